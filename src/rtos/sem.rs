//! Counting semaphore for task-to-task signalling.
//!
//! Backed by an `embassy-sync` semaphore, so `give` is safe from any
//! producer context and `take` blocks the calling task with a timeout.

use std::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::semaphore::{GreedySemaphore, Semaphore};

use crate::error::{Error, Result};
use crate::rtos::wait::block_on_timeout;

pub struct CountingSemaphore {
    inner: GreedySemaphore<CriticalSectionRawMutex>,
}

impl CountingSemaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            inner: GreedySemaphore::new(initial),
        }
    }

    /// Add one permit. Never blocks.
    pub fn give(&self) {
        self.inner.release(1);
    }

    /// Take one permit if available.
    pub fn try_take(&self) -> bool {
        match self.inner.try_acquire(1) {
            Some(permit) => {
                let _ = permit.disarm();
                true
            }
            None => false,
        }
    }

    /// Take one permit, waiting up to `timeout`.
    pub fn take(&self, timeout: Duration) -> Result<()> {
        match block_on_timeout(self.inner.acquire(1), timeout) {
            Some(acquired) => {
                let _ = acquired.map_err(|_| Error::InvalidState)?.disarm();
                Ok(())
            }
            None => Err(Error::Timeout),
        }
    }
}
