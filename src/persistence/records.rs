//! Reserved keys and the records stored under them.

use core::fmt::Write;

use serde::{Deserialize, Serialize};

/// Company identifier singleton (`u16`, little-endian).
pub const KEY_COMPANY_ID: &str = "id_cid";
/// Product identifier singleton (`u16`, little-endian).
pub const KEY_PRODUCT_ID: &str = "id_pid";
/// Provisioning data, see [`NodeStore`].
pub const KEY_NODE_STORE: &str = "node_store";

/// Product identity checked on every open. A mismatch means the namespace
/// belongs to other firmware and is wiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub company_id: u16,
    pub product_id: u16,
}

/// Node-level provisioning data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeStore {
    pub net_key_idx: u16,
    pub node_addr: u16,
    pub provisioned: bool,
}

/// Per-element context key: `el_` + 4 lowercase hex digits.
pub fn element_key(element_id: u16) -> heapless::String<16> {
    let mut s = heapless::String::new();
    // 7 bytes always fit.
    let _ = s.write_fmt(format_args!("el_{:04x}", element_id));
    s
}
