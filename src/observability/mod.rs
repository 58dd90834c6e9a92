//! Observability for the MQTT client
//!
//! Structured logging through tracing, configured from the environment.

pub mod logging;

pub use logging::{build_filter, init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
