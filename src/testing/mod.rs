//! Testing utilities and mock implementations
//!
//! Lets the client wrapper be tested without an MQTT broker.

pub mod mocks;

pub use mocks::*;
