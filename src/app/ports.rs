//! Port traits: the boundary between the middleware core and the platform.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ bus / persistence / element modules
//! ```
//!
//! Driven adapters (NVS flash, the mesh stack's send path, the monotonic
//! clock) implement these traits. The core only ever holds them as trait
//! objects, so host tests swap in simulated flash, a recording stack and a
//! manual clock.

use crate::error::Result;
use crate::events::StackMsg;

// ───────────────────────────────────────────────────────────────
// Flash port (driven adapter: persistence ↔ NVS partition)
// ───────────────────────────────────────────────────────────────

/// Key/value blob storage with an explicit commit, shaped after ESP-IDF
/// NVS: writes land in a cache immediately and only `commit` makes them
/// durable.
pub trait FlashPort: Send {
    /// Open `namespace` read-write. Calls before this fail with
    /// `InvalidState`.
    fn open_namespace(&mut self, namespace: &str) -> Result<()>;

    /// Release the namespace handle without committing.
    fn close_namespace(&mut self);

    /// Copy the blob stored under `key` into `buf`.
    ///
    /// `NotFound` if absent; `Truncated` if `buf` is shorter than the
    /// stored blob, in which case `buf` is left untouched.
    fn get_blob(&self, key: &str, buf: &mut [u8]) -> Result<usize>;

    fn set_blob(&mut self, key: &str, data: &[u8]) -> Result<()>;

    /// `NotFound` if the key does not exist.
    fn erase_key(&mut self, key: &str) -> Result<()>;

    fn erase_all(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;
}

// ───────────────────────────────────────────────────────────────
// Stack port (driven adapter: middleware → mesh protocol stack)
// ───────────────────────────────────────────────────────────────

/// Outbound seam to the vendor mesh stack. Called from the bus task; may
/// block for the duration of one radio transaction.
pub trait StackPort: Send + Sync {
    fn send_to_stack(&self, msg: &StackMsg) -> Result<()>;
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic milliseconds since boot.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}
