//! Unified error type for the mesh-node middleware.
//!
//! Every subsystem (bus, timers, persistence, element modules) returns this
//! one `Error` so the dispatch loop and the boot sequence can treat failures
//! uniformly. All variants are `Copy` so they pass through bus handlers and
//! timer callbacks without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Middleware error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller supplied a zero mask, an out-of-range element id, an oversized
    /// key or payload, or a zero timer period.
    InvalidArgument,
    /// Operation is not allowed in the current lifecycle state
    /// (persistence handle closed, already open, timer deleted).
    InvalidState,
    /// Requested key or record does not exist.
    NotFound,
    /// Destination buffer is shorter than the stored blob.
    Truncated,
    /// A fixed-capacity table (subscribers, timers, elements) is full.
    NoMemory,
    /// The platform layer (ESP-IDF NVS, esp_timer, pthread) returned an
    /// error code.
    Platform(i32),
    /// Non-blocking publish found the bus queue full.
    QueueFull,
    /// Blocking operation did not complete before its deadline.
    Timeout,
    /// Payload or record could not be encoded or decoded.
    Codec,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::NotFound => write!(f, "not found"),
            Self::Truncated => write!(f, "buffer too small"),
            Self::NoMemory => write!(f, "capacity exhausted"),
            Self::Platform(code) => write!(f, "platform error {code}"),
            Self::QueueFull => write!(f, "queue full"),
            Self::Timeout => write!(f, "timed out"),
            Self::Codec => write!(f, "encode/decode failed"),
        }
    }
}

impl core::error::Error for Error {}

impl From<postcard::Error> for Error {
    fn from(_: postcard::Error) -> Self {
        Self::Codec
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Middleware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
