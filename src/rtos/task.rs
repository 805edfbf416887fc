//! Core-pinned task spawning.
//!
//! Wraps `esp_pthread_set_cfg()` so that `std::thread::Builder::spawn`
//! creates a FreeRTOS task with an explicit core, priority and stack size.
//! On non-ESP targets, falls back to a plain named thread.
//!
//! `esp_pthread_set_cfg()` sets thread-local configuration that applies to
//! the *next* `pthread_create()` call from the calling thread, so the
//! config→spawn pair must not be interleaved with other thread creation on
//! the same thread.

use std::thread::JoinHandle;

use crate::error::{Error, Result};

/// CPU core identifiers for the ESP32 dual-core parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 (PRO_CPU): the mesh stack and radio.
    Pro = 0,
    /// Core 1 (APP_CPU): bus task and timer driver.
    App = 1,
}

/// How a middleware task is created.
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec {
    /// NUL-terminated task name (e.g. `"meshx_bus\0"`).
    pub name: &'static str,
    pub core: Core,
    pub priority: u8,
    pub stack_kb: usize,
}

impl TaskSpec {
    /// Name without the trailing NUL, for logs and `std::thread` names.
    pub fn display_name(&self) -> &'static str {
        self.name.trim_end_matches('\0')
    }
}

/// Bus consumer task: 4 KiB stack like the control task it replaces.
pub const BUS_TASK: TaskSpec = TaskSpec {
    name: "meshx_bus\0",
    core: Core::App,
    priority: 5,
    stack_kb: 4,
};

/// Software timer driver.
pub const TIMER_TASK: TaskSpec = TaskSpec {
    name: "meshx_tmr\0",
    core: Core::App,
    priority: 6,
    stack_kb: 3,
};

#[cfg(target_os = "espidf")]
pub fn spawn_task(spec: TaskSpec, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    // SAFETY: the default config is plain data; `thread_name` points at a
    // 'static NUL-terminated string for the lifetime of the program.
    let ret = unsafe {
        let mut cfg = esp_idf_svc::sys::esp_create_default_pthread_config();
        cfg.pin_to_core = spec.core as i32;
        cfg.prio = i32::from(spec.priority);
        cfg.stack_size = (spec.stack_kb * 1024) as i32;
        cfg.thread_name = spec.name.as_ptr().cast();
        esp_idf_svc::sys::esp_pthread_set_cfg(&cfg)
    };
    if ret != esp_idf_svc::sys::ESP_OK {
        log::error!("task: esp_pthread_set_cfg failed for '{}' (rc={})", spec.display_name(), ret);
        return Err(Error::Platform(ret));
    }

    log::info!(
        "task: spawning '{}' on {:?} (pri={}, stack={}KB)",
        spec.display_name(),
        spec.core,
        spec.priority,
        spec.stack_kb
    );

    std::thread::Builder::new()
        .name(spec.display_name().into())
        .spawn(f)
        .map_err(|_| Error::NoMemory)
}

/// Simulation fallback: ignores core affinity and priority.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_task(spec: TaskSpec, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    log::debug!(
        "task: spawning '{}' (sim, no core pinning, stack={}KB)",
        spec.display_name(),
        spec.stack_kb
    );

    // Host threads need more headroom than the firmware budget for
    // debug-build frames and the test harness.
    std::thread::Builder::new()
        .name(spec.display_name().into())
        .stack_size((spec.stack_kb * 1024).max(64 * 1024))
        .spawn(f)
        .map_err(|_| Error::NoMemory)
}
