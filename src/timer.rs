//! Software timers delivered through the event bus.
//!
//! A fixed table of one-shot / auto-reload timers over a [`Clock`]. A tick
//! source calls [`TimerService::poll`], which publishes
//! `System::TIMER_FIRE` for every expired timer; the service's own bus
//! subscription then runs the timer callback on the bus task, serialised
//! with every other handler.
//!
//! Each (re)arm or stop bumps the timer's generation and every fire carries
//! the generation it was raised for. A fire still sitting in the queue when
//! the timer is restarted or stopped is recognised as stale and dropped, so
//! a restart always pushes the callback out by a full period.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use crate::app::ports::Clock;
use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::events::{BusMessage, Channel, TimerFire, system};
use crate::rtos::tick::Ticker;

/// Timers the service can hold at once.
pub const MAX_TIMERS: usize = 8;

pub type TimerId = u8;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Slot {
    name: &'static str,
    period_ms: u32,
    reload: bool,
    /// `Some` while armed.
    deadline: Option<u64>,
    generation: u32,
    callback: Callback,
}

pub struct TimerService {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    slots: Mutex<[Option<Slot>; MAX_TIMERS]>,
    fired: AtomicU32,
}

impl TimerService {
    /// Create the service and subscribe it to `System::TIMER_FIRE`.
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let svc = Arc::new(Self {
            bus: Arc::clone(&bus),
            clock,
            slots: Mutex::new(core::array::from_fn(|_| None)),
            fired: AtomicU32::new(0),
        });
        let weak = Arc::downgrade(&svc);
        bus.subscribe_fn(Channel::System, system::TIMER_FIRE, move |msg| {
            match weak.upgrade() {
                Some(svc) => svc.on_fire(msg),
                None => Ok(()),
            }
        })?;
        Ok(svc)
    }

    fn slots(&self) -> MutexGuard<'_, [Option<Slot>; MAX_TIMERS]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_slot<T>(&self, id: TimerId, f: impl FnOnce(&mut Slot, u64) -> T) -> Result<T> {
        let now = self.clock.now_ms();
        let mut slots = self.slots();
        let slot = slots
            .get_mut(usize::from(id))
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidState)?;
        Ok(f(slot, now))
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Allocate a disarmed timer. `period_ms` must be non-zero.
    pub fn create<F>(&self, name: &'static str, period_ms: u32, reload: bool, callback: F) -> Result<TimerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if period_ms == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut slots = self.slots();
        let idx = slots.iter().position(Option::is_none).ok_or(Error::NoMemory)?;
        slots[idx] = Some(Slot {
            name,
            period_ms,
            reload,
            deadline: None,
            generation: 0,
            callback: Arc::new(callback),
        });
        debug!("timer: created '{}' #{} ({}ms, reload={})", name, idx, period_ms, reload);
        Ok(idx as TimerId)
    }

    /// Arm the timer for one period from now. Arming an armed timer
    /// replaces its deadline.
    pub fn start(&self, id: TimerId) -> Result<()> {
        self.with_slot(id, |slot, now| {
            slot.deadline = Some(now + u64::from(slot.period_ms));
            slot.generation = slot.generation.wrapping_add(1);
        })
    }

    /// Push the deadline out to one full period from now, arming the timer
    /// if it was idle. Any fire already queued for it is discarded.
    pub fn restart(&self, id: TimerId) -> Result<()> {
        self.start(id)
    }

    /// Disarm; a fire already queued for this timer is discarded.
    pub fn stop(&self, id: TimerId) -> Result<()> {
        self.with_slot(id, |slot, _| {
            slot.deadline = None;
            slot.generation = slot.generation.wrapping_add(1);
        })
    }

    /// Change the period. An armed timer is re-armed with the new period
    /// from now; an idle timer stays idle.
    pub fn set_period(&self, id: TimerId, period_ms: u32) -> Result<()> {
        if period_ms == 0 {
            return Err(Error::InvalidArgument);
        }
        self.with_slot(id, |slot, now| {
            slot.period_ms = period_ms;
            if slot.deadline.is_some() {
                slot.deadline = Some(now + u64::from(period_ms));
                slot.generation = slot.generation.wrapping_add(1);
            }
        })
    }

    /// Free the slot. Queued fires for it are discarded.
    pub fn delete(&self, id: TimerId) -> Result<()> {
        let mut slots = self.slots();
        let slot = slots.get_mut(usize::from(id)).ok_or(Error::InvalidState)?;
        match slot.take() {
            Some(s) => {
                debug!("timer: deleted '{}' #{}", s.name, id);
                Ok(())
            }
            None => Err(Error::InvalidState),
        }
    }

    pub fn is_armed(&self, id: TimerId) -> Result<bool> {
        self.with_slot(id, |slot, _| slot.deadline.is_some())
    }

    pub fn period_ms(&self, id: TimerId) -> Result<u32> {
        self.with_slot(id, |slot, _| slot.period_ms)
    }

    /// Callbacks that actually ran (stale fires excluded).
    pub fn fired_count(&self) -> u32 {
        self.fired.load(Ordering::Relaxed)
    }

    // ── Expiry ────────────────────────────────────────────────

    /// Publish a fire for every timer whose deadline has passed. Returns
    /// the number published. Never blocks: if the bus queue is full the
    /// timer stays expired and is retried on the next poll.
    pub fn poll(&self) -> usize {
        let now = self.clock.now_ms();
        let mut published = 0;
        let mut slots = self.slots();
        for (idx, entry) in slots.iter_mut().enumerate() {
            let Some(slot) = entry.as_mut() else { continue };
            let Some(deadline) = slot.deadline else { continue };
            if deadline > now {
                continue;
            }
            let fire = TimerFire {
                id: idx as TimerId,
                generation: slot.generation,
            };
            let sent = BusMessage::encode(Channel::System, system::TIMER_FIRE, &fire)
                .and_then(|msg| self.bus.try_publish_msg(msg));
            if let Err(e) = sent {
                warn!("timer: '{}' fire deferred: {}", slot.name, e);
                continue;
            }
            published += 1;
            slot.deadline = if slot.reload {
                Some(now + u64::from(slot.period_ms))
            } else {
                None
            };
        }
        published
    }

    fn on_fire(&self, msg: &BusMessage) -> Result<()> {
        let fire: TimerFire = msg.decode()?;
        let callback = {
            let slots = self.slots();
            match slots.get(usize::from(fire.id)).and_then(Option::as_ref) {
                Some(slot) if slot.generation == fire.generation => Arc::clone(&slot.callback),
                _ => {
                    debug!("timer: stale fire #{} gen {}", fire.id, fire.generation);
                    return Ok(());
                }
            }
        };
        self.fired.fetch_add(1, Ordering::Relaxed);
        callback();
        Ok(())
    }

    /// Drive [`poll`](Self::poll) from a periodic tick.
    pub fn start_driver(self: &Arc<Self>, tick: Duration) -> Result<Ticker> {
        let weak = Arc::downgrade(self);
        Ticker::start(tick, move || {
            if let Some(svc) = weak.upgrade() {
                svc.poll();
            }
        })
    }
}
