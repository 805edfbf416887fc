//! Application callbacks and requests.
//!
//! | Direction   | Channel  | Event  | Payload                      |
//! |-------------|----------|--------|------------------------------|
//! | node → app  | `ToApp`  | `DATA` | [`AppMsg`] element updates   |
//! | node → app  | `ToApp`  | `CTRL` | [`AppMsg::Control`]          |
//! | app → node  | `ToNode` | `DATA` | [`ElementRequest`]           |
//!
//! Callbacks run on the bus task. They must not block on the bus; use
//! [`AppApi::try_send_to_element`] from inside one.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::bus::{EventBus, SubscriptionId};
use crate::error::Result;
use crate::events::{AppMsg, Channel, ElementRequest, OnOffOp, to_app, to_node};

#[derive(Clone)]
pub struct AppApi {
    bus: Arc<EventBus>,
}

impl AppApi {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Register `cb` for element notifications.
    pub fn on_data<F>(&self, cb: F) -> Result<SubscriptionId>
    where
        F: Fn(AppMsg) + Send + Sync + 'static,
    {
        self.bus.subscribe_fn(Channel::ToApp, to_app::DATA, move |msg| {
            cb(msg.decode()?);
            Ok(())
        })
    }

    /// Register `cb` for provisioning lifecycle bits.
    pub fn on_control<F>(&self, cb: F) -> Result<SubscriptionId>
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.bus.subscribe_fn(Channel::ToApp, to_app::CTRL, move |msg| {
            match msg.decode::<AppMsg>()? {
                AppMsg::Control { event } => cb(event),
                other => warn!("app: unexpected control payload {:?}", other),
            }
            Ok(())
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.bus.unsubscribe(id)
    }

    /// Ask the client element `element_id` to send `op`, waiting up to
    /// `timeout` for queue space.
    pub fn send_to_element(&self, element_id: u16, op: OnOffOp, timeout: Duration) -> Result<()> {
        self.bus
            .emit(Channel::ToNode, to_node::DATA, &ElementRequest { element_id, op }, timeout)
    }

    /// Non-blocking form of [`send_to_element`](Self::send_to_element).
    pub fn try_send_to_element(&self, element_id: u16, op: OnOffOp) -> Result<()> {
        self.bus
            .try_emit(Channel::ToNode, to_node::DATA, &ElementRequest { element_id, op })
    }
}
