//! Bus channels, event bits and the payloads they carry.
//!
//! Every message on the bus is a `(channel, event, payload)` triple. The
//! channel picks a category, the event is a single bit of a 32-bit mask
//! scoped to that channel, and the payload is a postcard-encoded struct
//! copied into the queue slot.
//!
//! ```text
//! ┌─────────────┐ ElementState / Configuration ┌──────────────┐
//! │ Mesh stack  │ Provisioning / FromStack     │              │
//! │ callbacks   │─────────────────────────────▶│              │
//! ├─────────────┤ ToStack                      │   Event bus  │
//! │ Stack port  │◀─────────────────────────────│   (1 task)   │
//! ├─────────────┤ ToApp ◀──── / ────▶ ToNode   │              │
//! │ Application │◀────────────────────────────▶│              │
//! ├─────────────┤ System                       │              │
//! │ Timers      │─────────────────────────────▶│              │
//! └─────────────┘                              └──────────────┘
//! ```

use heapless::Vec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest payload a queue slot can hold.
pub const PAYLOAD_CAP: usize = 32;

/// Number of distinct channels.
pub const CHANNEL_COUNT: usize = 8;

/// Bus message categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Stack reports a model state change on one of our server elements.
    ElementState = 0,
    /// Middleware housekeeping (timer fires, fresh boot).
    System = 1,
    /// Outbound model messages for the stack.
    ToStack = 2,
    /// Stack responses to client messages (including send failures).
    FromStack = 3,
    /// Provisioning lifecycle.
    Provisioning = 4,
    /// Configuration-server changes (publication, app-key binding).
    Configuration = 5,
    /// Notifications for the application.
    ToApp = 6,
    /// Requests from the application to an element.
    ToNode = 7,
}

impl Channel {
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::ElementState,
        Channel::System,
        Channel::ToStack,
        Channel::FromStack,
        Channel::Provisioning,
        Channel::Configuration,
        Channel::ToApp,
        Channel::ToNode,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

// ── Event bits per channel ────────────────────────────────────

pub mod system {
    /// A software timer expired; payload is [`super::TimerFire`].
    pub const TIMER_FIRE: u32 = 1 << 4;
    /// The post-boot grace period elapsed.
    pub const FRESH_BOOT: u32 = 1 << 6;
}

pub mod element_state {
    /// Generic OnOff SET received by a server element; payload is
    /// [`super::OnOffSet`].
    pub const SET_ON_OFF: u32 = 1 << 0;
}

pub mod configuration {
    pub const PUB_ADD: u32 = 1 << 0;
    pub const PUB_DEL: u32 = 1 << 1;
    pub const SUB_ADD: u32 = 1 << 2;
    pub const APP_KEY_BIND: u32 = 1 << 3;
    /// Every event that rewrites an element's publication or key binding.
    pub const ELEMENT_MASK: u32 = PUB_ADD | PUB_DEL | APP_KEY_BIND;
}

pub mod provisioning {
    /// Provisioning finished; payload is [`super::ProvisionInfo`].
    pub const COMPLETE: u32 = 1 << 0;
    pub const STOP: u32 = 1 << 1;
    pub const IDENTIFY_START: u32 = 1 << 2;
    pub const IDENTIFY_STOP: u32 = 1 << 3;
    pub const NODE_RESET: u32 = 1 << 4;
    pub const PROXY_CONNECT: u32 = 1 << 5;
    pub const PROXY_DISCONNECT: u32 = 1 << 6;
    /// Node is provisioned and enabled; servers publish their status.
    pub const NODE_ENABLED: u32 = 1 << 7;
    pub const ALL: u32 = 0xFF;
}

pub mod to_stack {
    /// Server element status publication.
    pub const SERVER_STATUS: u32 = 1 << 0;
    /// Client element GET/SET.
    pub const CLIENT_MSG: u32 = 1 << 1;
    /// Client message re-issued after a failure; replaces the one in flight.
    pub const RESEND: u32 = 1 << 2;
    /// The client message in flight is settled; payload is [`super::TxAck`].
    pub const ACK: u32 = 1 << 3;
    /// Everything that carries client traffic.
    pub const CLIENT_MASK: u32 = CLIENT_MSG | RESEND | ACK;
}

pub mod from_stack {
    /// Response (or delivery failure) for a client message; payload is
    /// [`super::OnOffStatus`].
    pub const ONOFF_STATUS: u32 = 1 << 0;
}

pub mod to_app {
    pub const DATA: u32 = 1 << 0;
    pub const CTRL: u32 = 1 << 1;
}

pub mod to_node {
    pub const DATA: u32 = 1 << 0;
}

// ── Payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerFire {
    pub id: u8,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnOffSet {
    pub element_id: u16,
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub element_id: u16,
    pub app_key_idx: u16,
    pub pub_addr: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionInfo {
    pub net_key_idx: u16,
    pub node_addr: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnOffOp {
    Get,
    Set,
    SetUnack,
}

/// Everything the middleware asks the stack to transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackMsg {
    ServerStatus {
        element_id: u16,
        net_key_idx: u16,
        app_key_idx: u16,
        dst_addr: u16,
        on: bool,
    },
    Client {
        element_id: u16,
        op: OnOffOp,
        net_key_idx: u16,
        app_key_idx: u16,
        dst_addr: u16,
        on: bool,
        tid: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnOffStatus {
    pub element_id: u16,
    /// `false` when the stack could not deliver or the peer timed out.
    pub delivered: bool,
    pub on: bool,
}

/// Releases the in-flight client message of `element_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAck {
    pub element_id: u16,
}

/// Notifications delivered to the application on [`Channel::ToApp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppMsg {
    /// A server element was switched by the network.
    ServerState { element_id: u16, on: bool },
    /// A client element learned the remote state.
    ClientState { element_id: u16, on: bool },
    /// A client element exhausted its bounded retry budget.
    SendFailed { element_id: u16 },
    /// Provisioning lifecycle event bits, forwarded on `CTRL`.
    Control { event: u32 },
}

/// Application requests on [`Channel::ToNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRequest {
    pub element_id: u16,
    pub op: OnOffOp,
}

// ── Queue slot ────────────────────────────────────────────────

/// One queued bus message. The payload is copied in at publish time and
/// dropped once dispatch returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: Channel,
    pub event: u32,
    pub payload: Vec<u8, PAYLOAD_CAP>,
}

impl BusMessage {
    /// Build a message from raw payload bytes.
    pub fn new(channel: Channel, event: u32, payload: &[u8]) -> Result<Self> {
        if event == 0 {
            return Err(Error::InvalidArgument);
        }
        let payload = Vec::from_slice(payload).map_err(|_| Error::InvalidArgument)?;
        Ok(Self {
            channel,
            event,
            payload,
        })
    }

    /// Build a message whose payload is `value` encoded with postcard.
    pub fn encode<T: Serialize>(channel: Channel, event: u32, value: &T) -> Result<Self> {
        let mut buf = [0u8; PAYLOAD_CAP];
        let used = postcard::to_slice(value, &mut buf).map_err(|_| Error::InvalidArgument)?;
        Self::new(channel, event, used)
    }

    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(postcard::from_bytes(&self.payload)?)
    }
}
