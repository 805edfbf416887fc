//! Transmit control for client traffic.
//!
//! Client messages reach the stack one at a time. An acknowledged GET/SET
//! stays at the head of the queue in `WaitingAck` until the relay client
//! settles it with `ACK` (status received, or retries exhausted) or
//! replaces it with `RESEND`. Unacknowledged SETs are sent once they reach
//! the head and dropped right after.
//!
//! ```text
//!  CLIENT_MSG ──▶ [ head | New | New ... ] ──▶ StackBridge::send
//!                    │
//!                    ├─ acked:   WaitingAck until ACK / RESEND
//!                    └─ unacked: popped after sending
//!
//!  RESEND ──▶ replace head, send again
//!  ACK ─────▶ pop head, send the next New entry
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use heapless::Deque;
use log::{debug, warn};

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::events::{BusMessage, Channel, OnOffOp, StackMsg, TxAck, to_stack};
use crate::stack::StackBridge;

/// Outbound client messages held at once.
pub const TX_QUEUE_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Queued, not yet handed to the stack.
    New,
    /// Sent; the head of the queue until settled.
    WaitingAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxEntry {
    pub msg: StackMsg,
    pub acked: bool,
    pub state: TxState,
}

/// Requests driving the queue, decoded from `ToStack` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSignal {
    /// Queue an acknowledged message.
    EnqSend(StackMsg),
    /// Queue a message nobody answers.
    DirectSend(StackMsg),
    /// Replace the head with a fresh copy and send it again.
    Resend(StackMsg),
    /// Settle the head if it belongs to this element.
    Ack(u16),
}

impl TxSignal {
    pub fn from_message(msg: &BusMessage) -> Result<Self> {
        match msg.event {
            to_stack::CLIENT_MSG => {
                let out: StackMsg = msg.decode()?;
                Ok(if is_acked(&out) {
                    Self::EnqSend(out)
                } else {
                    Self::DirectSend(out)
                })
            }
            to_stack::RESEND => Ok(Self::Resend(msg.decode()?)),
            to_stack::ACK => Ok(Self::Ack(msg.decode::<TxAck>()?.element_id)),
            _ => Err(Error::InvalidArgument),
        }
    }
}

fn is_acked(msg: &StackMsg) -> bool {
    matches!(msg, StackMsg::Client { op, .. } if *op != OnOffOp::SetUnack)
}

fn element_of(msg: &StackMsg) -> u16 {
    match *msg {
        StackMsg::ServerStatus { element_id, .. } | StackMsg::Client { element_id, .. } => {
            element_id
        }
    }
}

pub struct TxControl {
    bridge: Arc<StackBridge>,
    queue: Mutex<Deque<TxEntry, TX_QUEUE_DEPTH>>,
}

impl TxControl {
    /// Take over client traffic on `ToStack`. Sends go out through `bridge`.
    pub fn register(bus: &EventBus, bridge: Arc<StackBridge>) -> Result<Arc<Self>> {
        let tx = Arc::new(Self {
            bridge,
            queue: Mutex::new(Deque::new()),
        });
        let weak = Arc::downgrade(&tx);
        bus.subscribe_fn(Channel::ToStack, to_stack::CLIENT_MASK, move |msg| {
            weak.upgrade()
                .map_or(Ok(()), |t| t.signal(TxSignal::from_message(msg)?))
        })?;
        Ok(tx)
    }

    fn queue(&self) -> MutexGuard<'_, Deque<TxEntry, TX_QUEUE_DEPTH>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signal(&self, sig: TxSignal) -> Result<()> {
        let resend = match sig {
            TxSignal::EnqSend(msg) => {
                self.enqueue(msg, true)?;
                false
            }
            TxSignal::DirectSend(msg) => {
                self.enqueue(msg, false)?;
                false
            }
            TxSignal::Resend(msg) => {
                let replaced = {
                    let mut q = self.queue();
                    match q.front_mut().filter(|h| element_of(&h.msg) == element_of(&msg)) {
                        Some(head) => {
                            head.msg = msg;
                            true
                        }
                        None => false,
                    }
                };
                if !replaced {
                    debug!("tx: resend for {} not at head, queued", element_of(&msg));
                    self.enqueue(msg, is_acked(&msg))?;
                }
                replaced
            }
            TxSignal::Ack(element_id) => {
                let mut q = self.queue();
                let settles = q.front().is_some_and(|h| {
                    h.state == TxState::WaitingAck && element_of(&h.msg) == element_id
                });
                if settles {
                    let _ = q.pop_front();
                    debug!("tx: {} settled, {} queued", element_id, q.len());
                } else {
                    debug!("tx: ack for {} with nothing in flight", element_id);
                }
                false
            }
        };
        self.pump(resend)
    }

    fn enqueue(&self, msg: StackMsg, acked: bool) -> Result<()> {
        let entry = TxEntry {
            msg,
            acked,
            state: TxState::New,
        };
        self.queue().push_back(entry).map_err(|_| {
            warn!("tx: queue full, dropped {:?}", msg);
            Error::QueueFull
        })
    }

    /// Send from the head: the head itself when `resend`, otherwise only
    /// entries still `New`. Stops at the first acknowledged message.
    fn pump(&self, mut resend: bool) -> Result<()> {
        loop {
            let (msg, acked) = {
                let mut q = self.queue();
                let Some(head) = q.front_mut() else {
                    return Ok(());
                };
                if !resend && head.state != TxState::New {
                    return Ok(());
                }
                let msg = head.msg;
                let acked = head.acked;
                if acked {
                    head.state = TxState::WaitingAck;
                } else {
                    let _ = q.pop_front();
                }
                (msg, acked)
            };
            self.bridge.send(&msg)?;
            if acked {
                return Ok(());
            }
            resend = false;
        }
    }

    /// Messages queued, the one in flight included.
    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// The acknowledged message awaiting its ACK, if any.
    pub fn in_flight(&self) -> Option<StackMsg> {
        self.queue()
            .front()
            .filter(|h| h.state == TxState::WaitingAck)
            .map(|h| h.msg)
    }
}
