//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a specific subsystem
//! against the simulated flash, a manual clock and a recording stack. All
//! tests run on the host with no radio or flash required.

mod element_tests;
mod mock_stack;
mod node_tests;
mod persistence_tests;
