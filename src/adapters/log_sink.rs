//! Log-based stack adapter.
//!
//! Implements [`StackPort`] by writing every outbound model message to the
//! logger (UART / USB-CDC in production). Used on bring-up boards before
//! the vendor mesh stack is linked, and in host runs. A real stack binding
//! implements the same trait.

use std::sync::atomic::{AtomicU32, Ordering};

use log::info;

use crate::app::ports::StackPort;
use crate::error::Result;
use crate::events::StackMsg;

/// Adapter that logs every [`StackMsg`] and reports success.
#[derive(Default)]
pub struct LogStackSink {
    sent: AtomicU32,
}

impl LogStackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl StackPort for LogStackSink {
    fn send_to_stack(&self, msg: &StackMsg) -> Result<()> {
        match msg {
            StackMsg::ServerStatus {
                element_id,
                net_key_idx,
                app_key_idx,
                dst_addr,
                on,
            } => {
                info!(
                    "STACK | status el={} -> {:#06x} net={} app={} on={}",
                    element_id, dst_addr, net_key_idx, app_key_idx, on
                );
            }
            StackMsg::Client {
                element_id,
                op,
                net_key_idx,
                app_key_idx,
                dst_addr,
                on,
                tid,
            } => {
                info!(
                    "STACK | client el={} {:?} -> {:#06x} net={} app={} on={} tid={}",
                    element_id, op, dst_addr, net_key_idx, app_key_idx, on, tid
                );
            }
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
