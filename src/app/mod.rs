//! Application-facing surface of the middleware.
//!
//! The core (bus, persistence, element modules) talks to the platform only
//! through the **port traits** in [`ports`]. Application code talks to the
//! core only through [`api::AppApi`], which rides on the `ToApp` and
//! `ToNode` bus channels.

pub mod api;
pub mod ports;
