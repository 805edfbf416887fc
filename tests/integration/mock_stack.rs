//! Mock mesh stack and test rig for integration tests.
//!
//! Records every outbound [`StackMsg`] so tests can assert on the full send
//! history, and can be told to fail the next N sends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use meshnode::Result;
use meshnode::adapters::nvs::NvsFlash;
use meshnode::adapters::time::ManualClock;
use meshnode::app::ports::StackPort;
use meshnode::bus::EventBus;
use meshnode::events::StackMsg;
use meshnode::persistence::{Identity, Persistence};
use meshnode::timer::TimerService;
use meshnode::Error;

// ── RecordingStack ────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingStack {
    sent: Mutex<Vec<StackMsg>>,
    fail_next: AtomicU32,
}

#[allow(dead_code)]
impl RecordingStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject the next `n` sends with a platform error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<StackMsg> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn client_sends_for(&self, element: u16) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m, StackMsg::Client { element_id, .. } if *element_id == element))
            .count()
    }
}

impl StackPort for RecordingStack {
    fn send_to_stack(&self, msg: &StackMsg) -> Result<()> {
        self.sent.lock().unwrap().push(*msg);
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(Error::Platform(-1))
        } else {
            Ok(())
        }
    }
}

// ── Rig: bus + timers + persistence on a manual clock ─────────

pub const NAMESPACE: &str = "it_nvs";
pub const IDENTITY: Identity = Identity {
    company_id: 0x02E5,
    product_id: 7,
};

pub struct Rig {
    pub bus: Arc<EventBus>,
    pub clock: Arc<ManualClock>,
    pub timers: Arc<TimerService>,
    pub flash: NvsFlash,
    pub nvs: Arc<Persistence>,
}

#[allow(dead_code)]
impl Rig {
    pub fn new(window_ms: u32) -> Self {
        Self::on_flash(NvsFlash::new().unwrap(), window_ms)
    }

    pub fn on_flash(flash: NvsFlash, window_ms: u32) -> Self {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new());
        let timers = TimerService::new(Arc::clone(&bus), clock.clone()).unwrap();
        let nvs = Persistence::new(Box::new(flash.clone()), Arc::clone(&timers));
        nvs.open(NAMESPACE, IDENTITY, window_ms).unwrap();
        Self {
            bus,
            clock,
            timers,
            flash,
            nvs,
        }
    }

    /// Advance the clock, fire due timers and drain the bus.
    pub fn step(&self, ms: u64) {
        self.clock.advance_ms(ms);
        self.timers.poll();
        self.bus.drain();
    }
}
