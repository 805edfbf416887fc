//! Node configuration parameters
//!
//! All tunables for the mesh-node middleware: product identity, NVS
//! namespace, bus timing, debounce window and the element layout.
//! Loadable from JSON at bring-up and storable as a postcard record.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on elements a node exposes, root element included.
pub const MAX_ELEMENT_COUNT: u16 = 16;

/// Maximum NVS namespace length (ESP-IDF limit, excluding NUL).
pub const MAX_NAMESPACE_LEN: usize = 15;

/// What the relay client does when the stack reports a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Re-issue the failed send immediately, forever.
    Unbounded,
    /// Give up after `max_attempts` consecutive failures and raise a fault
    /// to the application.
    Bounded { max_attempts: u16 },
}

/// Core node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    // --- Identity ---
    /// Company identifier stored in NVS; a mismatch wipes the namespace.
    pub company_id: u16,
    /// Product identifier stored in NVS; a mismatch wipes the namespace.
    pub product_id: u16,
    /// Human-readable product name (logged at boot)
    pub product_name: heapless::String<32>,

    // --- Persistence ---
    /// NVS namespace holding every node record
    pub nvs_namespace: heapless::String<16>,
    /// Debounce window before dirty records are committed (ms, 0 = default)
    pub commit_window_ms: u32,

    // --- Bus / timing ---
    /// How long a task-context publish waits for queue room (ms)
    pub publish_timeout_ms: u32,
    /// How long the bus task waits on an empty queue before re-checking
    /// its stop flag (ms)
    pub dequeue_timeout_ms: u32,
    /// Resolution of the software timer driver (ms)
    pub timer_tick_ms: u32,
    /// Delay after boot before the FRESH_BOOT system event (ms)
    pub fresh_boot_delay_ms: u32,

    // --- Elements ---
    /// Relay server elements (node owns the output)
    pub relay_server_count: u16,
    /// Relay client elements (node drives a remote output)
    pub relay_client_count: u16,
    /// Relay client behaviour on send failure
    pub retry: RetryPolicy,
    /// Serialise client messages through the transmit-control queue, one
    /// acknowledged message in flight at a time
    #[serde(default = "default_tx_control")]
    pub tx_control: bool,
}

fn default_tx_control() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        let mut product_name = heapless::String::new();
        let _ = product_name.push_str("meshnode-relay");
        let mut nvs_namespace = heapless::String::new();
        let _ = nvs_namespace.push_str("MESHX_NVS");

        Self {
            // Identity
            company_id: 0x02E5,
            product_id: 0x0001,
            product_name,

            // Persistence
            nvs_namespace,
            commit_window_ms: 1000,

            // Bus / timing
            publish_timeout_ms: 100,
            dequeue_timeout_ms: 500,
            timer_tick_ms: 10,
            fresh_boot_delay_ms: 1500,

            // Elements
            relay_server_count: 1,
            relay_client_count: 1,
            retry: RetryPolicy::Unbounded,
            tx_control: true,
        }
    }
}

impl NodeConfig {
    /// Parse a JSON configuration document and validate it.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let cfg: Self = serde_json::from_slice(raw).map_err(|_| Error::Codec)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check every field before the node is assembled.
    pub fn validate(&self) -> Result<()> {
        if self.nvs_namespace.is_empty() || self.nvs_namespace.len() > MAX_NAMESPACE_LEN {
            return Err(Error::InvalidArgument);
        }
        if self.publish_timeout_ms == 0 || self.dequeue_timeout_ms == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.timer_tick_ms == 0 || self.fresh_boot_delay_ms == 0 {
            return Err(Error::InvalidArgument);
        }
        // Element 0 is the root element; module ranges start after it.
        let total = 1 + u32::from(self.relay_server_count) + u32::from(self.relay_client_count);
        if total > u32::from(MAX_ELEMENT_COUNT) {
            return Err(Error::NoMemory);
        }
        if let RetryPolicy::Bounded { max_attempts: 0 } = self.retry {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}
