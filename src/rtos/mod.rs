//! Task, tick and blocking-wait primitives.
//!
//! The ESP-IDF build maps these onto FreeRTOS via pthreads and esp_timer;
//! the host build uses plain threads so every module can be tested
//! without hardware.

pub mod cs_shim;
pub mod sem;
pub mod task;
pub mod tick;
pub mod wait;
