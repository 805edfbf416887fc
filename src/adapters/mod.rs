//! Adapters — concrete implementations of the port traits.
//!
//! | Adapter    | Implements | Connects to                  |
//! |------------|------------|------------------------------|
//! | `log_sink` | StackPort  | Serial log output            |
//! | `nvs`      | FlashPort  | NVS partition / in-memory sim|
//! | `time`     | Clock      | esp_timer / `Instant`        |

pub mod log_sink;
pub mod nvs;
pub mod time;
