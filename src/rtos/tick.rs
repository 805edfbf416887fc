//! Periodic tick source driving the software timer service.
//!
//! On ESP-IDF the tick is an `esp_timer` periodic timer dispatched from the
//! esp_timer task (not ISR), so the callback may take mutexes and push onto
//! the bus queue. On simulation targets a dedicated thread sleeps between
//! ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
#[cfg(not(target_os = "espidf"))]
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};

#[cfg(not(target_os = "espidf"))]
use super::task::spawn_task;
use super::task::TIMER_TASK;

type TickFn = Box<dyn Fn() + Send + Sync + 'static>;

/// A running periodic tick. Stops when dropped.
pub struct Ticker {
    running: Arc<AtomicBool>,
    #[cfg(not(target_os = "espidf"))]
    thread: Option<JoinHandle<()>>,
    #[cfg(target_os = "espidf")]
    handle: esp_idf_svc::sys::esp_timer_handle_t,
    #[cfg(target_os = "espidf")]
    ctx: *mut TickFn,
}

// SAFETY: the esp_timer handle and the boxed callback pointer are only
// touched from `stop()`, which requires `&mut self`.
#[cfg(target_os = "espidf")]
unsafe impl Send for Ticker {}

#[cfg(target_os = "espidf")]
unsafe extern "C" fn tick_trampoline(arg: *mut core::ffi::c_void) {
    // SAFETY: `arg` is the `Box<TickFn>` leaked in `Ticker::start`; it stays
    // alive until `stop()` has stopped and deleted the timer.
    let f = unsafe { &*(arg as *const TickFn) };
    f();
}

impl Ticker {
    /// Call `f` every `period`.
    #[cfg(target_os = "espidf")]
    pub fn start(period: Duration, f: impl Fn() + Send + Sync + 'static) -> Result<Self> {
        use esp_idf_svc::sys::*;

        if period.is_zero() {
            return Err(Error::InvalidArgument);
        }
        let ctx: *mut TickFn = Box::into_raw(Box::new(Box::new(f)));
        let args = esp_timer_create_args_t {
            callback: Some(tick_trampoline),
            arg: ctx.cast(),
            dispatch_method: esp_timer_dispatch_t_ESP_TIMER_TASK,
            name: TIMER_TASK.name.as_ptr().cast(),
            skip_unhandled_events: true,
        };
        let mut handle: esp_timer_handle_t = core::ptr::null_mut();
        // SAFETY: `args` outlives the call; `handle` is written on success.
        let ret = unsafe { esp_timer_create(&args, &mut handle) };
        if ret != ESP_OK {
            // SAFETY: the timer was never created, so nothing else owns ctx.
            drop(unsafe { Box::from_raw(ctx) });
            log::error!("tick: esp_timer_create failed (rc={})", ret);
            return Err(Error::Platform(ret));
        }
        // SAFETY: `handle` was just created.
        let ret = unsafe { esp_timer_start_periodic(handle, period.as_micros() as u64) };
        if ret != ESP_OK {
            // SAFETY: stopped-state timer, safe to delete; ctx freed after.
            unsafe {
                esp_timer_delete(handle);
                drop(Box::from_raw(ctx));
            }
            log::error!("tick: esp_timer_start_periodic failed (rc={})", ret);
            return Err(Error::Platform(ret));
        }

        log::info!("tick: esp_timer every {}ms", period.as_millis());
        Ok(Self {
            running: Arc::new(AtomicBool::new(true)),
            handle,
            ctx,
        })
    }

    /// Call `f` every `period`.
    #[cfg(not(target_os = "espidf"))]
    pub fn start(period: Duration, f: impl Fn() + Send + Sync + 'static) -> Result<Self> {
        if period.is_zero() {
            return Err(Error::InvalidArgument);
        }
        let f: TickFn = Box::new(f);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = spawn_task(TIMER_TASK, move || {
            while flag.load(Ordering::Acquire) {
                std::thread::sleep(period);
                f();
            }
        })?;

        log::debug!("tick(sim): thread every {}ms", period.as_millis());
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[cfg(target_os = "espidf")]
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // SAFETY: handle is valid until deleted here, and the callback
        // context is only freed once the timer can no longer run.
        unsafe {
            esp_idf_svc::sys::esp_timer_stop(self.handle);
            esp_idf_svc::sys::esp_timer_delete(self.handle);
            drop(Box::from_raw(self.ctx));
        }
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log::warn!("tick(sim): driver thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
