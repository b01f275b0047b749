//! Shared helpers for tests that need real sockets.
//!
//! Compiled only for unit tests; integration tests under `tests/` carry
//! their own copy since they cannot see `#[cfg(test)]` modules.

pub mod socket_guard;
