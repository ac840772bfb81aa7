//! Testing utilities and mock implementations
//!
//! In-memory protocol engine and heartbeat doubles for exercising the runtime
//! without a running broker.

pub mod mocks;

pub use mocks::*;
