//! Error types for the MQTT client wrapper
//!
//! Configuration and transport failures are returned to the caller; nothing in
//! the library terminates the process.

use crate::config::ConfigError;
use crate::transport::mqtt::{ConnectionState, MqttError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("mqtt client failed to connect mqtt broker, the timed out period of {timeout:?} has elapsed")]
    ConnectTimeout { timeout: Duration },

    #[error("Invalid client state: {state}")]
    InvalidState { state: ConnectionState },

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

impl ClientError {
    /// True for errors caused by a malformed configuration value
    pub fn is_config(&self) -> bool {
        matches!(self, ClientError::Config(_))
    }

    /// True when a connect attempt ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::ConnectTimeout { .. })
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
