//! Internal event bus.
//!
//! One bounded FIFO (`embassy-sync` channel, depth [`QUEUE_DEPTH`]) feeds a
//! single consumer task. Each dequeued message is fanned out, synchronously
//! and in registration order, to every subscriber on its channel whose mask
//! intersects the event bit.
//!
//! ```text
//!  try_publish (ISR-like) ─┐
//!                          ├─▶ [ queue ×10 ] ──▶ bus task ──▶ handler 1
//!  publish (task, timeout)─┘                                 ├▶ handler 2
//!                                                            └▶ ...
//! ```
//!
//! The registry lock is only held while snapshotting the matching handlers,
//! so handlers may subscribe or publish without deadlocking. Handlers that
//! publish from the bus task must use [`EventBus::try_publish`]: a blocking
//! publish there would wait on the very task that drains the queue.

mod registry;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel as Queue, TrySendError};
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::events::{BusMessage, Channel};
use crate::rtos::task::{spawn_task, BUS_TASK};
use crate::rtos::wait::block_on_timeout;

pub use registry::{BusHandler, MAX_SUBSCRIBERS, SubscriptionId};
use registry::Registry;

/// Bus queue depth.
pub const QUEUE_DEPTH: usize = 10;

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u32,
    pub dispatched: u32,
    pub rejected: u32,
    pub handler_errors: u32,
}

pub struct EventBus {
    queue: Queue<CriticalSectionRawMutex, BusMessage, QUEUE_DEPTH>,
    registry: Mutex<Registry>,
    running: AtomicBool,
    published: AtomicU32,
    dispatched: AtomicU32,
    rejected: AtomicU32,
    handler_errors: AtomicU32,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            queue: Queue::new(),
            registry: Mutex::new(Registry::new()),
            running: AtomicBool::new(false),
            published: AtomicU32::new(0),
            dispatched: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
            handler_errors: AtomicU32::new(0),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A handler panic cannot leave the registry half-written: every
        // mutation is a single push/remove.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Registration ──────────────────────────────────────────

    /// Register `handler` for every event on `channel` intersecting `mask`.
    pub fn subscribe(
        &self,
        channel: Channel,
        mask: u32,
        handler: Arc<dyn BusHandler>,
    ) -> Result<SubscriptionId> {
        let id = self.registry().insert(channel, mask, handler);
        match id {
            Ok(_) => debug!("bus: subscribed {:?} mask={:#x}", channel, mask),
            Err(e) => warn!("bus: subscribe {:?} mask={:#x} failed: {}", channel, mask, e),
        }
        id
    }

    /// Closure form of [`subscribe`](Self::subscribe).
    pub fn subscribe_fn<F>(&self, channel: Channel, mask: u32, f: F) -> Result<SubscriptionId>
    where
        F: Fn(&BusMessage) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(channel, mask, Arc::new(f))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.registry().remove(id)
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.registry().subscriber_count(channel)
    }

    // ── Producers ─────────────────────────────────────────────

    /// Non-blocking enqueue, safe from stack callbacks and timer context.
    pub fn try_publish_msg(&self, msg: BusMessage) -> Result<()> {
        match self.queue.try_send(msg) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(msg)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("bus: queue full, dropped {:?}/{:#x}", msg.channel, msg.event);
                Err(Error::QueueFull)
            }
        }
    }

    /// Enqueue, waiting up to `timeout` for room. On timeout nothing is
    /// enqueued.
    pub fn publish_msg(&self, msg: BusMessage, timeout: Duration) -> Result<()> {
        let msg = match self.queue.try_send(msg) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Full(msg)) => msg,
        };
        let (channel, event) = (msg.channel, msg.event);
        if block_on_timeout(self.queue.send(msg), timeout).is_some() {
            self.published.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "bus: publish {:?}/{:#x} timed out after {}ms",
                channel,
                event,
                timeout.as_millis()
            );
            Err(Error::Timeout)
        }
    }

    pub fn try_publish(&self, channel: Channel, event: u32, payload: &[u8]) -> Result<()> {
        self.try_publish_msg(BusMessage::new(channel, event, payload)?)
    }

    pub fn publish(
        &self,
        channel: Channel,
        event: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        self.publish_msg(BusMessage::new(channel, event, payload)?, timeout)
    }

    /// Encode `value` with postcard and enqueue without blocking.
    pub fn try_emit<T: Serialize>(&self, channel: Channel, event: u32, value: &T) -> Result<()> {
        self.try_publish_msg(BusMessage::encode(channel, event, value)?)
    }

    /// Encode `value` with postcard and enqueue, waiting up to `timeout`.
    pub fn emit<T: Serialize>(
        &self,
        channel: Channel,
        event: u32,
        value: &T,
        timeout: Duration,
    ) -> Result<()> {
        self.publish_msg(BusMessage::encode(channel, event, value)?, timeout)
    }

    // ── Consumer ──────────────────────────────────────────────

    /// Fan `msg` out to its matching subscribers. Returns how many ran.
    pub fn dispatch(&self, msg: &BusMessage) -> usize {
        let (matches, total) = {
            let reg = self.registry();
            (
                reg.matching(msg.channel, msg.event),
                reg.subscriber_count(msg.channel),
            )
        };

        if total == 0 {
            warn!("bus: no subscribers on {:?}, dropped {:#x}", msg.channel, msg.event);
        } else if matches.is_empty() {
            debug!("bus: {:?}/{:#x} matched no subscriber", msg.channel, msg.event);
        }

        for handler in &matches {
            if let Err(e) = handler.handle(msg) {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!("bus: handler on {:?}/{:#x} failed: {}", msg.channel, msg.event, e);
            }
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        matches.len()
    }

    /// Wait up to `timeout` for one message and dispatch it.
    pub fn dispatch_one(&self, timeout: Duration) -> bool {
        match block_on_timeout(self.queue.receive(), timeout) {
            Some(msg) => {
                self.dispatch(&msg);
                true
            }
            None => false,
        }
    }

    /// Dispatch queued messages, including ones published by handlers along
    /// the way, until the queue is empty or `max` messages were processed.
    pub fn drain_up_to(&self, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            let Ok(msg) = self.queue.try_receive() else {
                break;
            };
            self.dispatch(&msg);
            n += 1;
        }
        n
    }

    /// Dispatch until the queue is empty.
    pub fn drain(&self) -> usize {
        self.drain_up_to(usize::MAX)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    // ── Task lifecycle ────────────────────────────────────────

    /// Start the consumer task. It re-checks the stop flag after every
    /// dequeue timeout.
    pub fn spawn(self: &Arc<Self>, dequeue_timeout: Duration) -> Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState);
        }
        let bus = Arc::clone(self);
        let spawned = spawn_task(BUS_TASK, move || {
            info!("bus: task running");
            while bus.running.load(Ordering::Acquire) {
                bus.dispatch_one(dequeue_timeout);
            }
            info!("bus: task stopped");
        });
        if spawned.is_err() {
            self.running.store(false, Ordering::Release);
        }
        spawned
    }

    /// Ask the consumer task to exit after its current wait.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
