//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that drives the library end to end
//! against the emulated device over the in-memory pipe transport.

mod action_tests;
mod connection_tests;
mod mock_link;
