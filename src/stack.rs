//! Seam between the mesh stack and the bus.
//!
//! Inbound, [`StackEventSink`] turns typed stack callbacks into bus
//! messages without blocking, so it may be called from the stack's own
//! task. Outbound, [`StackBridge`] subscribes to `ToStack` and hands
//! messages to the [`StackPort`], either directly or with client traffic
//! paced by a [`TxControl`] queue. A client message the port rejects
//! comes back on `FromStack` as an undelivered status so the relay client
//! can retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::app::ports::StackPort;
use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::events::{
    Channel, ConfigChange, OnOffOp, OnOffSet, OnOffStatus, ProvisionInfo, StackMsg,
    configuration, element_state, from_stack, provisioning, to_stack,
};
use crate::tx_control::TxControl;

/// Callbacks the mesh stack raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    /// Generic on/off server state set by the network.
    OnOffSet(OnOffSet),
    /// Configuration server change; `event` is a [`configuration`] bit.
    Config { event: u32, change: ConfigChange },
    /// Provisioning lifecycle; `event` is a [`provisioning`] bit.
    Provisioning { event: u32, info: ProvisionInfo },
    /// Generic on/off client response or delivery failure.
    OnOffStatus(OnOffStatus),
}

/// Producer side: stack callbacks onto the bus.
#[derive(Clone)]
pub struct StackEventSink {
    bus: Arc<EventBus>,
}

impl StackEventSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Non-blocking. `QueueFull` means the event was dropped.
    pub fn on_stack_event(&self, event: StackEvent) -> Result<()> {
        let sent = match event {
            StackEvent::OnOffSet(set) => {
                self.bus.try_emit(Channel::ElementState, element_state::SET_ON_OFF, &set)
            }
            StackEvent::Config { event, change } => {
                if event & !(configuration::ELEMENT_MASK | configuration::SUB_ADD) != 0 {
                    return Err(Error::InvalidArgument);
                }
                self.bus.try_emit(Channel::Configuration, event, &change)
            }
            StackEvent::Provisioning { event, info } => {
                if event & !provisioning::ALL != 0 {
                    return Err(Error::InvalidArgument);
                }
                self.bus.try_emit(Channel::Provisioning, event, &info)
            }
            StackEvent::OnOffStatus(status) => {
                self.bus.try_emit(Channel::FromStack, from_stack::ONOFF_STATUS, &status)
            }
        };
        if let Err(e) = sent {
            warn!("stack: dropped {:?}: {}", event, e);
        }
        sent
    }
}

/// Consumer side: `ToStack` messages to the port.
pub struct StackBridge {
    port: Arc<dyn StackPort>,
    bus: Arc<EventBus>,
    sent: AtomicU32,
    failed: AtomicU32,
}

impl StackBridge {
    /// Forward every `ToStack` message straight to the port.
    pub fn register(bus: Arc<EventBus>, port: Arc<dyn StackPort>) -> Result<Arc<Self>> {
        Self::subscribe(
            bus,
            port,
            to_stack::SERVER_STATUS | to_stack::CLIENT_MSG | to_stack::RESEND,
        )
    }

    /// Forward server status directly and route client traffic through a
    /// [`TxControl`] queue.
    pub fn register_with_tx_control(
        bus: Arc<EventBus>,
        port: Arc<dyn StackPort>,
    ) -> Result<(Arc<Self>, Arc<TxControl>)> {
        let bridge = Self::subscribe(Arc::clone(&bus), port, to_stack::SERVER_STATUS)?;
        let tx = TxControl::register(&bus, Arc::clone(&bridge))?;
        Ok((bridge, tx))
    }

    fn subscribe(bus: Arc<EventBus>, port: Arc<dyn StackPort>, mask: u32) -> Result<Arc<Self>> {
        let bridge = Arc::new(Self {
            port,
            bus: Arc::clone(&bus),
            sent: AtomicU32::new(0),
            failed: AtomicU32::new(0),
        });
        let weak = Arc::downgrade(&bridge);
        bus.subscribe_fn(Channel::ToStack, mask, move |msg| {
            weak.upgrade().map_or(Ok(()), |b| b.send(&msg.decode()?))
        })?;
        Ok(bridge)
    }

    /// Hand `out` to the port. A rejected acknowledged client message is
    /// reported on `FromStack` as undelivered.
    pub fn send(&self, out: &StackMsg) -> Result<()> {
        match self.port.send_to_stack(out) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("stack: send {:?} failed: {}", out, e);
                if let StackMsg::Client { element_id, op, on, .. } = *out {
                    if op == OnOffOp::SetUnack {
                        debug!("stack: unacked send, no failure report");
                        return Ok(());
                    }
                    let status = OnOffStatus {
                        element_id,
                        delivered: false,
                        on,
                    };
                    self.bus.try_emit(Channel::FromStack, from_stack::ONOFF_STATUS, &status)?;
                }
                Ok(())
            }
        }
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Relaxed)
    }
}
