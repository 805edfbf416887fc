//! Element state synchronization.
//!
//! Each element module owns a contiguous id range `[start, end)` and one
//! [`ElementContext`] per id. Contexts are restored from NVS at
//! registration, mutated by bus handlers and written back through the
//! persistence engine with the commit debounce armed.
//!
//! ```text
//!  Uninitialized ──restore──▶ Synced ──bus event──▶ Dirty ──commit──▶ Synced
//!                                         ▲            │
//!                                         └─bus event──┘ (re-arms debounce)
//! ```

pub mod client;
pub mod server;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use heapless::Vec;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::config::MAX_ELEMENT_COUNT;
use crate::error::{Error, Result};
use crate::events::{ConfigChange, OnOffOp, configuration};
use crate::persistence::Persistence;

pub use client::RelayClient;
pub use server::RelayServer;

/// Unassigned unicast/publish address.
pub const ADDR_UNASSIGNED: u16 = 0x0000;
/// App-key index meaning "no key bound".
pub const KEY_UNUSED: u16 = 0xFFFF;

/// Elements one module can own (everything but the root element).
pub const MAX_MODULE_ELEMENTS: usize = (MAX_ELEMENT_COUNT - 1) as usize;

const CTX_CAP: usize = 16;

/// Persisted per-element state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementContext {
    /// Transaction id of the next outbound message.
    pub tid: u8,
    pub app_key_idx: u16,
    pub pub_addr: u16,
    /// Server: current output. Client: next SET target.
    pub state: bool,
    /// Server: value before the last change. Client: last state reported
    /// by the remote.
    pub prev_state: bool,
}

impl Default for ElementContext {
    fn default() -> Self {
        Self {
            tid: 0,
            app_key_idx: KEY_UNUSED,
            pub_addr: ADDR_UNASSIGNED,
            state: false,
            prev_state: false,
        }
    }
}

impl ElementContext {
    /// Publication configured and an app key bound.
    pub fn can_publish(&self) -> bool {
        self.pub_addr != ADDR_UNASSIGNED && self.app_key_idx != KEY_UNUSED
    }
}

/// Where an element's context stands relative to flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSyncState {
    /// Nothing was restored and nothing has been written yet.
    Uninitialized,
    /// In-memory context matches the last commit.
    Synced,
    /// Written to the flash cache, commit pending.
    Dirty,
}

/// Half-open element id range owned by one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementRange {
    pub start: u16,
    pub end: u16,
}

impl ElementRange {
    /// `count` ids starting at `start`. Element 0 is the root element and
    /// never belongs to a module.
    pub fn new(start: u16, count: u16) -> Result<Self> {
        if start == 0 || usize::from(count) > MAX_MODULE_ELEMENTS {
            return Err(Error::InvalidArgument);
        }
        let end = start.checked_add(count).ok_or(Error::InvalidArgument)?;
        Ok(Self { start, end })
    }

    pub fn contains(&self, element_id: u16) -> bool {
        (self.start..self.end).contains(&element_id)
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn ids(&self) -> core::ops::Range<u16> {
        self.start..self.end
    }

    fn offset(&self, element_id: u16) -> Result<usize> {
        if self.contains(element_id) {
            Ok(usize::from(element_id - self.start))
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

/// In-memory state for one element.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementSlot {
    pub ctx: ElementContext,
    restored: bool,
    /// Commit count observed right after the last write, while Dirty.
    dirty_at: Option<u32>,
    /// Client: remote state learned at least once.
    pub model_ready: bool,
    /// Client: consecutive failed sends.
    pub failures: u16,
    /// Client: operation of the last accepted send, re-issued on failure.
    pub last_op: Option<OnOffOp>,
}

/// Contexts for one module, plus the persistence plumbing every module
/// shares.
pub struct ElementTable {
    range: ElementRange,
    slots: Mutex<Vec<ElementSlot, MAX_MODULE_ELEMENTS>>,
    nvs: Arc<Persistence>,
}

impl ElementTable {
    pub fn new(range: ElementRange, nvs: Arc<Persistence>) -> Result<Self> {
        let mut slots = Vec::new();
        for _ in range.ids() {
            slots.push(ElementSlot::default()).map_err(|_| Error::NoMemory)?;
        }
        Ok(Self {
            range,
            slots: Mutex::new(slots),
            nvs,
        })
    }

    fn slots(&self) -> MutexGuard<'_, Vec<ElementSlot, MAX_MODULE_ELEMENTS>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn range(&self) -> ElementRange {
        self.range
    }

    /// Load every owned context from NVS. Missing or unreadable records
    /// leave the default context in place.
    pub fn restore(&self) -> usize {
        let mut restored = 0;
        let mut slots = self.slots();
        for (slot, id) in slots.iter_mut().zip(self.range.ids()) {
            let mut buf = [0u8; CTX_CAP];
            let loaded = self
                .nvs
                .element_ctx_get(id, &mut buf)
                .and_then(|n| Ok(postcard::from_bytes::<ElementContext>(&buf[..n])?));
            match loaded {
                Ok(ctx) => {
                    slot.ctx = ctx;
                    slot.restored = true;
                    restored += 1;
                }
                Err(Error::NotFound) => debug!("element {}: no stored context", id),
                Err(e) => warn!("element {}: context restore failed: {}", id, e),
            }
        }
        restored
    }

    /// Run `f` on the slot for `element_id`. Ids outside the range are
    /// rejected before any slot is touched.
    pub fn update<T>(&self, element_id: u16, f: impl FnOnce(&mut ElementSlot) -> T) -> Result<T> {
        let idx = self.range.offset(element_id)?;
        let mut slots = self.slots();
        let slot = slots.get_mut(idx).ok_or(Error::InvalidState)?;
        Ok(f(slot))
    }

    /// Write the slot's context to NVS (debounce armed) and mark it Dirty.
    /// Failures are logged; the in-memory context stays authoritative.
    pub fn persist(&self, element_id: u16, slot: &mut ElementSlot) {
        let mut buf = [0u8; CTX_CAP];
        let written = postcard::to_slice(&slot.ctx, &mut buf)
            .map_err(Error::from)
            .and_then(|bytes| self.nvs.element_ctx_set(element_id, bytes));
        match written {
            Ok(()) => slot.dirty_at = Some(self.nvs.commit_count()),
            Err(e) => error!("element {}: context save failed: {}", element_id, e),
        }
    }

    pub fn context(&self, element_id: u16) -> Result<ElementContext> {
        self.update(element_id, |slot| slot.ctx)
    }

    pub fn sync_state(&self, element_id: u16) -> Result<ElementSyncState> {
        let commits = self.nvs.commit_count();
        self.update(element_id, |slot| match slot.dirty_at {
            Some(at) if commits > at => {
                slot.dirty_at = None;
                ElementSyncState::Synced
            }
            Some(_) => ElementSyncState::Dirty,
            None if slot.restored => ElementSyncState::Synced,
            None => ElementSyncState::Uninitialized,
        })
    }

    /// Apply a configuration-server change to one of our elements and
    /// persist it. Returns `false` when the element is not ours.
    pub fn apply_config(&self, event: u32, change: &ConfigChange) -> bool {
        if !self.range.contains(change.element_id) {
            return false;
        }
        let applied = self.update(change.element_id, |slot| {
            if event & configuration::PUB_ADD != 0 {
                slot.ctx.pub_addr = change.pub_addr;
                slot.ctx.app_key_idx = change.app_key_idx;
            } else if event & configuration::PUB_DEL != 0 {
                slot.ctx.pub_addr = ADDR_UNASSIGNED;
                slot.ctx.app_key_idx = change.app_key_idx;
            } else if event & configuration::APP_KEY_BIND != 0 {
                slot.ctx.app_key_idx = change.app_key_idx;
            } else {
                return false;
            }
            self.persist(change.element_id, slot);
            true
        });
        debug!(
            "element {}: config {:#x} pub={:#06x} app={} applied={:?}",
            change.element_id, event, change.pub_addr, change.app_key_idx, applied
        );
        applied.unwrap_or(false)
    }

    /// Snapshot of `(id, slot)` for every owned element.
    pub fn snapshot(&self) -> Vec<(u16, ElementSlot), MAX_MODULE_ELEMENTS> {
        let slots = self.slots();
        let mut out = Vec::new();
        for (id, slot) in self.range.ids().zip(slots.iter()) {
            // Both sized by `MAX_MODULE_ELEMENTS`.
            let pushed = out.push((id, *slot));
            debug_assert!(pushed.is_ok(), "snapshot smaller than slot table");
        }
        out
    }
}
