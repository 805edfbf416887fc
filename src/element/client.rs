//! Relay client elements: the node drives a remote on/off server.
//!
//! | Channel         | Event          | Action                                 |
//! |-----------------|----------------|----------------------------------------|
//! | `ToNode`        | `DATA`         | app request, send GET/SET to the stack |
//! | `FromStack`     | `ONOFF_STATUS` | learn remote state, or retry on error  |
//! | `Configuration` | pub/app-key    | update publication, persist            |
//! | `System`        | `FRESH_BOOT`   | GET every element not yet initialised  |
//!
//! Every settled exchange (status received, or retries exhausted) is
//! acknowledged on `ToStack` so a transmit-control queue can release the
//! next message. Retries go out as `RESEND`.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::RetryPolicy;
use crate::error::Result;
use crate::events::{
    AppMsg, BusMessage, Channel, ConfigChange, ElementRequest, OnOffOp, OnOffStatus, StackMsg,
    TxAck, configuration, from_stack, system, to_app, to_node, to_stack,
};
use crate::persistence::{KEY_NODE_STORE, NodeStore, Persistence};

use super::{ElementContext, ElementRange, ElementSyncState, ElementTable};

/// What a failed send turned into.
enum Recovery {
    Resend(OnOffOp),
    GiveUp,
    Nothing,
}

pub struct RelayClient {
    table: ElementTable,
    bus: Arc<EventBus>,
    nvs: Arc<Persistence>,
    retry: RetryPolicy,
}

impl RelayClient {
    /// Restore contexts for `range` and subscribe to the bus.
    pub fn register(
        range: ElementRange,
        bus: Arc<EventBus>,
        nvs: Arc<Persistence>,
        retry: RetryPolicy,
    ) -> Result<Arc<Self>> {
        let table = ElementTable::new(range, Arc::clone(&nvs))?;
        let restored = table.restore();
        info!(
            "relay client: elements {}..{} ({} restored, retry {:?})",
            range.start, range.end, restored, retry
        );

        let client = Arc::new(Self {
            table,
            bus: Arc::clone(&bus),
            nvs,
            retry,
        });

        let weak = Arc::downgrade(&client);
        bus.subscribe_fn(Channel::ToNode, to_node::DATA, move |msg| {
            weak.upgrade().map_or(Ok(()), |c| c.on_request(msg))
        })?;
        let weak = Arc::downgrade(&client);
        bus.subscribe_fn(Channel::FromStack, from_stack::ONOFF_STATUS, move |msg| {
            weak.upgrade().map_or(Ok(()), |c| c.on_status(msg))
        })?;
        let weak = Arc::downgrade(&client);
        bus.subscribe_fn(Channel::Configuration, configuration::ELEMENT_MASK, move |msg| {
            weak.upgrade().map_or(Ok(()), |c| {
                let change: ConfigChange = msg.decode()?;
                c.table.apply_config(msg.event, &change);
                Ok(())
            })
        })?;
        let weak = Arc::downgrade(&client);
        bus.subscribe_fn(Channel::System, system::FRESH_BOOT, move |_| {
            weak.upgrade().map_or(Ok(()), |c| {
                c.fresh_boot();
                Ok(())
            })
        })?;

        Ok(client)
    }

    pub fn range(&self) -> ElementRange {
        self.table.range()
    }

    pub fn context(&self, element_id: u16) -> Result<ElementContext> {
        self.table.context(element_id)
    }

    pub fn sync_state(&self, element_id: u16) -> Result<ElementSyncState> {
        self.table.sync_state(element_id)
    }

    /// Whether the remote state of `element_id` has been learned.
    pub fn is_ready(&self, element_id: u16) -> Result<bool> {
        self.table.update(element_id, |slot| slot.model_ready)
    }

    fn net_key_idx(&self) -> u16 {
        self.nvs
            .read_record::<NodeStore>(KEY_NODE_STORE)
            .map(|s| s.net_key_idx)
            .unwrap_or_default()
    }

    /// Queue `op` for `element_id` towards the stack. SETs carry the
    /// current toggle target. The tid advances only once the message is
    /// queued.
    pub fn send(&self, element_id: u16, op: OnOffOp) -> Result<()> {
        self.transmit(element_id, op, to_stack::CLIENT_MSG)
    }

    /// Re-issue `op` in place of the message still in flight.
    fn resend(&self, element_id: u16, op: OnOffOp) -> Result<()> {
        self.transmit(element_id, op, to_stack::RESEND)
    }

    fn transmit(&self, element_id: u16, op: OnOffOp, event: u32) -> Result<()> {
        let net_key_idx = self.net_key_idx();
        let msg = self.table.update(element_id, |slot| StackMsg::Client {
            element_id,
            op,
            net_key_idx,
            app_key_idx: slot.ctx.app_key_idx,
            dst_addr: slot.ctx.pub_addr,
            on: slot.ctx.state,
            tid: slot.ctx.tid,
        })?;

        self.bus.try_emit(Channel::ToStack, event, &msg)?;
        debug!("relay client {}: {:?} queued", element_id, op);

        self.table.update(element_id, |slot| {
            slot.ctx.tid = slot.ctx.tid.wrapping_add(1);
            slot.last_op = Some(op);
            if op == OnOffOp::SetUnack {
                // No status will come back; advance the target locally.
                slot.ctx.prev_state = slot.ctx.state;
                slot.ctx.state = !slot.ctx.state;
            }
            if op != OnOffOp::Get {
                self.table.persist(element_id, slot);
            }
        })
    }

    /// Release the message in flight for `element_id`.
    fn settle(&self, element_id: u16) {
        let ack = TxAck { element_id };
        if let Err(e) = self.bus.try_emit(Channel::ToStack, to_stack::ACK, &ack) {
            warn!("relay client {}: tx ack failed: {}", element_id, e);
        }
    }

    fn on_request(&self, msg: &BusMessage) -> Result<()> {
        let req: ElementRequest = msg.decode()?;
        if !self.table.range().contains(req.element_id) {
            return Ok(());
        }
        if let Err(e) = self.send(req.element_id, req.op) {
            warn!("relay client {}: request {:?} failed: {}", req.element_id, req.op, e);
        }
        Ok(())
    }

    fn on_status(&self, msg: &BusMessage) -> Result<()> {
        let status: OnOffStatus = msg.decode()?;
        let id = status.element_id;
        if !self.table.range().contains(id) {
            return Ok(());
        }
        if status.delivered {
            self.on_delivered(id, status.on)
        } else {
            self.on_failed(id)
        }
    }

    fn on_delivered(&self, element_id: u16, on: bool) -> Result<()> {
        let changed = self.table.update(element_id, |slot| {
            slot.model_ready = true;
            slot.failures = 0;
            if on == slot.ctx.prev_state {
                return false;
            }
            slot.ctx.prev_state = on;
            slot.ctx.state = !on;
            slot.ctx.tid = slot.ctx.tid.wrapping_add(1);
            self.table.persist(element_id, slot);
            true
        })?;
        self.settle(element_id);

        if changed {
            info!("relay client {}: remote is {}", element_id, if on { "on" } else { "off" });
            let note = AppMsg::ClientState { element_id, on };
            if let Err(e) = self.bus.try_emit(Channel::ToApp, to_app::DATA, &note) {
                warn!("relay client {}: app notify failed: {}", element_id, e);
            }
        }
        Ok(())
    }

    fn on_failed(&self, element_id: u16) -> Result<()> {
        let retry = self.retry;
        let recovery = self.table.update(element_id, |slot| {
            slot.ctx.tid = slot.ctx.tid.wrapping_add(1);
            slot.failures = slot.failures.saturating_add(1);
            let Some(op) = slot.last_op else {
                return Recovery::Nothing;
            };
            match retry {
                RetryPolicy::Bounded { max_attempts } if slot.failures >= max_attempts => {
                    slot.failures = 0;
                    slot.last_op = None;
                    Recovery::GiveUp
                }
                _ => Recovery::Resend(op),
            }
        })?;

        match recovery {
            Recovery::Resend(op) => {
                debug!("relay client {}: send failed, re-issuing {:?}", element_id, op);
                if let Err(e) = self.resend(element_id, op) {
                    warn!("relay client {}: re-issue failed: {}", element_id, e);
                }
            }
            Recovery::GiveUp => {
                warn!("relay client {}: giving up after repeated send failures", element_id);
                self.settle(element_id);
                let fault = AppMsg::SendFailed { element_id };
                if let Err(e) = self.bus.try_emit(Channel::ToApp, to_app::DATA, &fault) {
                    warn!("relay client {}: fault notify failed: {}", element_id, e);
                }
            }
            Recovery::Nothing => debug!("relay client {}: failure with nothing in flight", element_id),
        }
        Ok(())
    }

    /// Send a GET for every element whose remote state is still unknown.
    /// Returns how many were queued.
    pub fn fresh_boot(&self) -> usize {
        let mut queued = 0;
        for (element_id, slot) in self.table.snapshot() {
            if slot.model_ready {
                continue;
            }
            match self.send(element_id, OnOffOp::Get) {
                Ok(()) => queued += 1,
                Err(e) => warn!("relay client {}: fresh-boot GET failed: {}", element_id, e),
            }
        }
        queued
    }
}
