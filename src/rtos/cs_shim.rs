//! `critical-section` 1.x provider for ESP-IDF builds.
//!
//! The bus queue uses `CriticalSectionRawMutex`, which needs an
//! `_critical_section_1_0_acquire/release` pair at link time. Producers
//! and the consumer are all FreeRTOS tasks here (no raw ISRs touch the
//! queue), so a process-wide mutex with per-thread nesting is enough.
//! Host builds get the provider from the `critical-section/std` feature.

#![cfg(target_os = "espidf")]

use core::cell::{Cell, RefCell};
use std::sync::{Mutex, MutexGuard, PoisonError};

static SECTION: Mutex<()> = Mutex::new(());

thread_local! {
    static NESTING: Cell<u8> = const { Cell::new(0) };
    static HELD: RefCell<Option<MutexGuard<'static, ()>>> = const { RefCell::new(None) };
}

#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_acquire() -> u8 {
    NESTING.with(|nesting| {
        let depth = nesting.get();
        if depth == 0 {
            let guard = SECTION.lock().unwrap_or_else(PoisonError::into_inner);
            HELD.with(|held| *held.borrow_mut() = Some(guard));
        }
        let depth = depth.saturating_add(1);
        nesting.set(depth);
        depth
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_release(_token: u8) {
    NESTING.with(|nesting| match nesting.get() {
        0 => {}
        1 => {
            nesting.set(0);
            HELD.with(|held| *held.borrow_mut() = None);
        }
        depth => nesting.set(depth - 1),
    });
}
