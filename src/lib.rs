//! MeshNode middleware library.
//!
//! Event bus, debounced NVS persistence, software timers and the relay
//! element state synchronizer for ESP32 mesh nodes. All ESP-IDF-specific
//! code is guarded by `#[cfg(target_os = "espidf")]` within each module;
//! everything else builds and tests on the host.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod bus;
pub mod config;
pub mod element;
pub mod events;
pub mod node;
pub mod persistence;
pub mod rtos;
pub mod stack;
pub mod timer;
pub mod tx_control;

mod error;

pub use error::{Error, Result};
