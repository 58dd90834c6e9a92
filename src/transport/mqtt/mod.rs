//! MQTT transport built on rumqttc
//!
//! The module separates pure functions from I/O for testability:
//!
//! - [`connection`] - Option builder, connection state machine and errors
//! - [`tls`] - TLS client configuration
//! - [`message_handler`] - Event routing, inbound messages and topic matching
//! - [`client`] - Event loop task and broker I/O
//!
//! # Usage
//!
//! ```rust,no_run
//! use runner_mqtt::config::MqttConf;
//! use runner_mqtt::transport::mqtt::{build_options, MqttTransport};
//! use runner_mqtt::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let params = build_options(&MqttConf::from_env())?;
//! let transport = MqttTransport::new(params)?;
//! transport.connect(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod tls;

pub use client::MqttTransport;
pub use connection::{
    build_options, configure_mqtt_options, parse_broker_uri, qos_from_level, BrokerAddress,
    ConnectionEvent, ConnectionParameters, ConnectionState, Credentials, MqttError, TlsPolicy,
    network_timeout_secs, DEFAULT_KEEP_ALIVE, DEFAULT_NETWORK_TIMEOUT_SECS,
};
pub use message_handler::{topic_matches, EventRoute, EventRouter, InboundMessage, MessageHandler};
