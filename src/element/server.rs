//! Relay server elements: the node owns an on/off output.
//!
//! | Channel         | Event          | Action                             |
//! |-----------------|----------------|------------------------------------|
//! | `ElementState`  | `SET_ON_OFF`   | update state, persist, notify app  |
//! | `Configuration` | pub/app-key    | update publication, persist        |
//! | `Provisioning`  | `NODE_ENABLED` | publish status for bound elements  |

use std::sync::Arc;

use log::{info, warn};

use crate::bus::EventBus;
use crate::error::Result;
use crate::events::{
    AppMsg, BusMessage, Channel, ConfigChange, OnOffSet, StackMsg, configuration,
    element_state, provisioning, to_app, to_stack,
};
use crate::persistence::{KEY_NODE_STORE, NodeStore, Persistence};

use super::{ElementContext, ElementRange, ElementSyncState, ElementTable};

pub struct RelayServer {
    table: ElementTable,
    bus: Arc<EventBus>,
    nvs: Arc<Persistence>,
}

impl RelayServer {
    /// Restore contexts for `range` and subscribe to the bus.
    pub fn register(range: ElementRange, bus: Arc<EventBus>, nvs: Arc<Persistence>) -> Result<Arc<Self>> {
        let table = ElementTable::new(range, Arc::clone(&nvs))?;
        let restored = table.restore();
        info!(
            "relay server: elements {}..{} ({} restored)",
            range.start, range.end, restored
        );

        let server = Arc::new(Self {
            table,
            bus: Arc::clone(&bus),
            nvs,
        });

        let weak = Arc::downgrade(&server);
        bus.subscribe_fn(Channel::ElementState, element_state::SET_ON_OFF, move |msg| {
            weak.upgrade().map_or(Ok(()), |s| s.on_state_change(msg))
        })?;
        let weak = Arc::downgrade(&server);
        bus.subscribe_fn(Channel::Configuration, configuration::ELEMENT_MASK, move |msg| {
            weak.upgrade().map_or(Ok(()), |s| s.on_config(msg))
        })?;
        let weak = Arc::downgrade(&server);
        bus.subscribe_fn(Channel::Provisioning, provisioning::NODE_ENABLED, move |_| {
            weak.upgrade().map_or(Ok(()), |s| {
                s.publish_status_all();
                Ok(())
            })
        })?;

        Ok(server)
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

    fn on_state_change(&self, msg: &BusMessage) -> Result<()> {
        let set: OnOffSet = msg.decode()?;
        if !self.table.range().contains(set.element_id) {
            return Ok(());
        }
        self.set_on_off(set.element_id, set.on)
    }

    fn on_config(&self, msg: &BusMessage) -> Result<()> {
        let change: ConfigChange = msg.decode()?;
        self.table.apply_config(msg.event, &change);
        Ok(())
    }

    /// Apply a network-driven on/off change to `element_id`.
    pub fn set_on_off(&self, element_id: u16, on: bool) -> Result<()> {
        self.table.update(element_id, |slot| {
            slot.ctx.prev_state = slot.ctx.state;
            slot.ctx.state = on;
            self.table.persist(element_id, slot);
        })?;

        let note = AppMsg::ServerState { element_id, on };
        if let Err(e) = self.bus.try_emit(Channel::ToApp, to_app::DATA, &note) {
            warn!("relay server {}: app notify failed: {}", element_id, e);
        }
        Ok(())
    }

    /// Publish a status for every element with a publication address and a
    /// bound app key. Returns how many were queued.
    pub fn publish_status_all(&self) -> usize {
        let net_key_idx = self
            .nvs
            .read_record::<NodeStore>(KEY_NODE_STORE)
            .map(|s| s.net_key_idx)
            .unwrap_or_default();

        let mut queued = 0;
        for (element_id, slot) in self.table.snapshot() {
            if !slot.ctx.can_publish() {
                continue;
            }
            let status = StackMsg::ServerStatus {
                element_id,
                net_key_idx,
                app_key_idx: slot.ctx.app_key_idx,
                dst_addr: slot.ctx.pub_addr,
                on: slot.ctx.state,
            };
            match self.bus.try_emit(Channel::ToStack, to_stack::SERVER_STATUS, &status) {
                Ok(()) => queued += 1,
                Err(e) => warn!("relay server {}: status publish failed: {}", element_id, e),
            }
        }
        queued
    }
}
