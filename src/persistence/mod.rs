//! Debounced persistence engine.
//!
//! Wraps a [`FlashPort`] namespace with a Closed → Open → Closed lifecycle.
//! `set` writes through to the flash cache immediately; only the commit is
//! deferred. Every `set` with `arm_debounce` restarts a one-shot commit
//! timer, so a burst of writes inside one window costs a single flash
//! commit once the burst goes quiet.
//!
//! ```text
//!  set(arm) ─▶ flash cache ─┐
//!  set(arm) ─▶ flash cache ─┼─ restart ─▶ [ window ] ─▶ TIMER_FIRE ─▶ commit
//!  set(arm) ─▶ flash cache ─┘
//! ```
//!
//! Only this engine starts, restarts or stops its commit timer.

mod records;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::ports::FlashPort;
use crate::error::{Error, Result};
use crate::timer::{TimerId, TimerService};

pub use records::{
    element_key, Identity, NodeStore, KEY_COMPANY_ID, KEY_NODE_STORE, KEY_PRODUCT_ID,
};

/// Commit window used when `open` is given 0.
pub const DEFAULT_COMMIT_WINDOW_MS: u32 = 1000;

/// NVS key limit, excluding NUL.
pub const MAX_KEY_LEN: usize = 15;

/// Largest typed record `read_record`/`write_record` handle.
pub const RECORD_CAP: usize = 64;

enum Lifecycle {
    Closed,
    Open { timer: TimerId, window_ms: u32 },
}

struct Inner {
    flash: Box<dyn FlashPort>,
    lifecycle: Lifecycle,
}

impl Inner {
    fn ensure_open(&self) -> Result<TimerId> {
        match self.lifecycle {
            Lifecycle::Open { timer, .. } => Ok(timer),
            Lifecycle::Closed => Err(Error::InvalidState),
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn read_u16(flash: &dyn FlashPort, key: &str) -> Option<u16> {
    let mut b = [0u8; 2];
    match flash.get_blob(key, &mut b) {
        Ok(2) => Some(u16::from_le_bytes(b)),
        _ => None,
    }
}

pub struct Persistence {
    inner: Mutex<Inner>,
    timers: Arc<TimerService>,
    commits: AtomicU32,
    this: Weak<Persistence>,
}

impl Persistence {
    pub fn new(flash: Box<dyn FlashPort>, timers: Arc<TimerService>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner: Mutex::new(Inner {
                flash,
                lifecycle: Lifecycle::Closed,
            }),
            timers,
            commits: AtomicU32::new(0),
            this: this.clone(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Open `namespace`, create the commit timer and verify the stored
    /// product identity.
    ///
    /// A missing or mismatching identity erases the namespace, writes the
    /// new identity and commits straight away.
    pub fn open(&self, namespace: &str, identity: Identity, commit_window_ms: u32) -> Result<()> {
        let mut inner = self.inner();
        if matches!(inner.lifecycle, Lifecycle::Open { .. }) {
            return Err(Error::InvalidState);
        }
        validate_key(namespace)?;
        let window_ms = if commit_window_ms == 0 {
            DEFAULT_COMMIT_WINDOW_MS
        } else {
            commit_window_ms
        };

        inner.flash.open_namespace(namespace)?;

        let this = self.this.clone();
        let timer = match self.timers.create("nvs_commit", window_ms, false, move || {
            let Some(p) = this.upgrade() else { return };
            match p.commit() {
                Ok(()) => {}
                // Closed between arming and firing; close never flushes.
                Err(Error::InvalidState) => debug!("nvs: debounce fired after close"),
                Err(e) => error!("nvs: debounced commit failed: {}", e),
            }
        }) {
            Ok(t) => t,
            Err(e) => {
                inner.flash.close_namespace();
                return Err(e);
            }
        };

        if let Err(e) = self.check_identity(&mut inner, identity) {
            error!("nvs: identity init failed: {}", e);
            if let Err(e) = self.timers.delete(timer) {
                warn!("nvs: timer cleanup failed: {}", e);
            }
            inner.flash.close_namespace();
            return Err(e);
        }

        inner.lifecycle = Lifecycle::Open { timer, window_ms };
        info!("nvs: '{}' open (window={}ms)", namespace, window_ms);
        Ok(())
    }

    fn check_identity(&self, inner: &mut Inner, identity: Identity) -> Result<()> {
        let cid = read_u16(inner.flash.as_ref(), KEY_COMPANY_ID);
        let pid = read_u16(inner.flash.as_ref(), KEY_PRODUCT_ID);
        if cid == Some(identity.company_id) && pid == Some(identity.product_id) {
            return Ok(());
        }

        warn!(
            "nvs: identity {:?}/{:?} != {:#06x}/{:#06x}, erasing namespace",
            cid, pid, identity.company_id, identity.product_id
        );
        inner.flash.erase_all()?;
        inner
            .flash
            .set_blob(KEY_PRODUCT_ID, &identity.product_id.to_le_bytes())?;
        inner
            .flash
            .set_blob(KEY_COMPANY_ID, &identity.company_id.to_le_bytes())?;
        inner.flash.commit()?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delete the commit timer and release the namespace. Pending writes
    /// are not flushed.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner();
        let Lifecycle::Open { timer, .. } = inner.lifecycle else {
            return Err(Error::InvalidState);
        };
        if let Err(e) = self.timers.delete(timer) {
            warn!("nvs: commit timer delete failed: {}", e);
        }
        inner.flash.close_namespace();
        inner.lifecycle = Lifecycle::Closed;
        info!("nvs: closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner().lifecycle, Lifecycle::Open { .. })
    }

    /// The effective debounce window.
    pub fn commit_window_ms(&self) -> Result<u32> {
        match self.inner().lifecycle {
            Lifecycle::Open { window_ms, .. } => Ok(window_ms),
            Lifecycle::Closed => Err(Error::InvalidState),
        }
    }

    // ── Accessors ─────────────────────────────────────────────

    /// Copy the blob under `key` into `buf`; returns the byte count.
    pub fn get(&self, key: &str, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner();
        inner.ensure_open()?;
        validate_key(key)?;
        inner.flash.get_blob(key, buf)
    }

    /// Write `blob` now; with `arm_debounce`, (re)start the commit window.
    pub fn set(&self, key: &str, blob: &[u8], arm_debounce: bool) -> Result<()> {
        let mut inner = self.inner();
        let timer = inner.ensure_open()?;
        validate_key(key)?;
        inner.flash.set_blob(key, blob)?;
        if arm_debounce {
            self.timers.restart(timer)?;
        }
        Ok(())
    }

    /// Flush to flash immediately.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.flash.commit()?;
        let n = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("nvs: commit #{}", n);
        Ok(())
    }

    /// Delete one key and make the deletion durable.
    pub fn remove(&self, key: &str) -> Result<()> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        validate_key(key)?;
        inner.flash.erase_key(key)?;
        inner.flash.commit()?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delete every key in the namespace and make it durable.
    pub fn erase(&self) -> Result<()> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.flash.erase_all()?;
        inner.flash.commit()?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        warn!("nvs: namespace erased");
        Ok(())
    }

    /// Physical commits issued since construction.
    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::Relaxed)
    }

    // ── Typed helpers ─────────────────────────────────────────

    pub fn read_record<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let mut buf = [0u8; RECORD_CAP];
        let n = self.get(key, &mut buf)?;
        Ok(postcard::from_bytes(&buf[..n])?)
    }

    pub fn write_record<T: Serialize>(&self, key: &str, value: &T, arm_debounce: bool) -> Result<()> {
        let mut buf = [0u8; RECORD_CAP];
        let used = postcard::to_slice(value, &mut buf)?;
        self.set(key, used, arm_debounce)
    }

    pub fn element_ctx_get(&self, element_id: u16, buf: &mut [u8]) -> Result<usize> {
        self.get(&element_key(element_id), buf)
    }

    /// Element contexts always arm the debounce.
    pub fn element_ctx_set(&self, element_id: u16, blob: &[u8]) -> Result<()> {
        self.set(&element_key(element_id), blob, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::NvsFlash;
    use crate::adapters::time::ManualClock;
    use crate::bus::EventBus;

    const ID: Identity = Identity {
        company_id: 0x02E5,
        product_id: 0x0001,
    };

    struct Rig {
        bus: Arc<EventBus>,
        clock: Arc<ManualClock>,
        timers: Arc<TimerService>,
        flash: NvsFlash,
        nvs: Arc<Persistence>,
    }

    impl Rig {
        fn new() -> Self {
            let bus = Arc::new(EventBus::new());
            let clock = Arc::new(ManualClock::new());
            let timers = TimerService::new(Arc::clone(&bus), clock.clone()).unwrap();
            let flash = NvsFlash::new().unwrap();
            let nvs = Persistence::new(Box::new(flash.clone()), Arc::clone(&timers));
            Self {
                bus,
                clock,
                timers,
                flash,
                nvs,
            }
        }

        fn step(&self, ms: u64) {
            self.clock.advance_ms(ms);
            self.timers.poll();
            self.bus.drain();
        }
    }

    #[test]
    fn first_open_writes_identity_and_commits() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 0).unwrap();
        assert_eq!(rig.nvs.commit_window_ms().unwrap(), DEFAULT_COMMIT_WINDOW_MS);
        assert_eq!(rig.nvs.commit_count(), 1);
        assert_eq!(
            rig.flash.durable_value("test", KEY_COMPANY_ID),
            Some(0x02E5u16.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn matching_identity_keeps_data() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        rig.nvs.set("keep", &[7], false).unwrap();
        rig.nvs.commit().unwrap();
        rig.nvs.close().unwrap();

        rig.nvs.open("test", ID, 100).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(rig.nvs.get("keep", &mut buf).unwrap(), 1);
        assert_eq!(buf, [7]);
    }

    #[test]
    fn identity_mismatch_erases_namespace() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        rig.nvs.set("old", &[1], false).unwrap();
        rig.nvs.commit().unwrap();
        rig.nvs.close().unwrap();

        let other = Identity {
            product_id: 0x0002,
            ..ID
        };
        rig.nvs.open("test", other, 100).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(rig.nvs.get("old", &mut buf).unwrap_err(), Error::NotFound);
        assert_eq!(rig.nvs.get(KEY_PRODUCT_ID, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &0x0002u16.to_le_bytes());
    }

    #[test]
    fn double_open_is_invalid_state() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        assert_eq!(rig.nvs.open("test", ID, 100).unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn closed_handle_rejects_every_accessor() {
        let rig = Rig::new();
        let mut buf = [0u8; 4];
        assert_eq!(rig.nvs.get("k", &mut buf).unwrap_err(), Error::InvalidState);
        assert_eq!(rig.nvs.set("k", &[1], true).unwrap_err(), Error::InvalidState);
        assert_eq!(rig.nvs.commit().unwrap_err(), Error::InvalidState);
        assert_eq!(rig.nvs.remove("k").unwrap_err(), Error::InvalidState);
        assert_eq!(rig.nvs.erase().unwrap_err(), Error::InvalidState);
        assert_eq!(rig.nvs.close().unwrap_err(), Error::InvalidState);
        assert_eq!(rig.nvs.element_ctx_set(3, &[1]).unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn burst_of_sets_coalesces_into_one_commit() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        let base = rig.nvs.commit_count();

        rig.nvs.set("A", &[1], true).unwrap();
        rig.step(10);
        rig.nvs.set("A", &[2], true).unwrap();
        rig.step(99);
        assert_eq!(rig.nvs.commit_count(), base);

        rig.step(1);
        assert_eq!(rig.nvs.commit_count(), base + 1);
        assert_eq!(rig.flash.durable_value("test", "A"), Some(vec![2]));

        rig.step(1000);
        assert_eq!(rig.nvs.commit_count(), base + 1);
    }

    #[test]
    fn unarmed_set_is_visible_but_never_committed() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        let base = rig.nvs.commit_count();
        rig.nvs.set("B", &[5], false).unwrap();
        rig.step(10_000);

        let mut buf = [0u8; 1];
        assert_eq!(rig.nvs.get("B", &mut buf).unwrap(), 1);
        assert_eq!(rig.nvs.commit_count(), base);
        assert_eq!(rig.flash.durable_value("test", "B"), None);
    }

    #[test]
    fn undersized_buffer_is_truncated() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        rig.nvs.set("wide", &[1, 2, 3, 4], false).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(rig.nvs.get("wide", &mut buf).unwrap_err(), Error::Truncated);
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn remove_and_erase_are_immediate() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        rig.nvs.set("x", &[1], false).unwrap();
        rig.nvs.set("y", &[2], false).unwrap();
        rig.nvs.remove("x").unwrap();
        assert_eq!(rig.nvs.remove("x").unwrap_err(), Error::NotFound);

        let mut buf = [0u8; 1];
        assert_eq!(rig.nvs.get("x", &mut buf).unwrap_err(), Error::NotFound);
        assert_eq!(rig.flash.durable_value("test", "y"), Some(vec![2]));

        rig.nvs.erase().unwrap();
        assert_eq!(rig.nvs.get("y", &mut buf).unwrap_err(), Error::NotFound);
        assert_eq!(rig.flash.durable_value("test", "y"), None);
    }

    #[test]
    fn close_drops_pending_commit() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        let base = rig.nvs.commit_count();
        rig.nvs.set("p", &[9], true).unwrap();
        rig.nvs.close().unwrap();
        rig.step(500);
        assert_eq!(rig.nvs.commit_count(), base);
        assert_eq!(rig.flash.durable_value("test", "p"), None);
    }

    #[test]
    fn oversized_key_rejected() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        assert_eq!(
            rig.nvs.set("sixteen_chars_xx", &[1], false).unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn typed_record_round_trip() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 100).unwrap();
        let store = NodeStore {
            net_key_idx: 0,
            node_addr: 0x0005,
            provisioned: true,
        };
        rig.nvs.write_record(KEY_NODE_STORE, &store, false).unwrap();
        assert_eq!(rig.nvs.read_record::<NodeStore>(KEY_NODE_STORE).unwrap(), store);
    }

    #[test]
    fn element_ctx_uses_element_key_and_arms() {
        let rig = Rig::new();
        rig.nvs.open("test", ID, 50).unwrap();
        let base = rig.nvs.commit_count();
        rig.nvs.element_ctx_set(0x0a, &[1, 2]).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(rig.nvs.get("el_000a", &mut buf).unwrap(), 2);
        rig.step(50);
        assert_eq!(rig.nvs.commit_count(), base + 1);
        assert_eq!(rig.nvs.element_ctx_get(0x0a, &mut buf).unwrap(), 2);
    }
}
