//! MeshNode firmware entry point.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Adapters (outer ring)                   │
//! │   NvsFlash (FlashPort)  LogStackSink (StackPort)         │
//! │   MonotonicClock (Clock)                                 │
//! │  ─────────────── Port Trait Boundary ───────────────     │
//! │   Node: EventBus · TimerService · Persistence            │
//! │         RelayServer · RelayClient · StackBridge          │
//! └──────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use meshnode::adapters::log_sink::LogStackSink;
use meshnode::adapters::nvs::NvsFlash;
use meshnode::adapters::time::MonotonicClock;
use meshnode::config::NodeConfig;
use meshnode::node::Node;

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("MeshNode v{}", env!("CARGO_PKG_VERSION"));

    // ── 2. Platform adapters ──────────────────────────────────
    let flash = NvsFlash::new().context("NVS init failed")?;
    let stack = Arc::new(LogStackSink::new());
    let clock = Arc::new(MonotonicClock::new());

    // ── 3. Node: open NVS, restore elements, start tasks ──────
    let config = NodeConfig::default();
    let (node, _tasks) =
        Node::start(config, Box::new(flash), stack, clock).context("node start failed")?;

    let api = node.api();
    api.on_data(|msg| info!("app: {:?}", msg))
        .context("app data callback")?;
    api.on_control(|event| info!("app: control {:#04x}", event))
        .context("app control callback")?;

    info!("node running");

    // ── 4. Idle; the bus and timer tasks do the work ──────────
    loop {
        std::thread::sleep(Duration::from_secs(10));
        let stats = node.bus().stats();
        info!(
            "bus: published={} dispatched={} rejected={} handler_errors={}",
            stats.published, stats.dispatched, stats.rejected, stats.handler_errors
        );
    }
}
