//! Runner MQTT - minimal MQTT client wrapper
//!
//! Connects to an MQTT broker described by environment variables, publishes
//! messages and subscribes a handler to a configured topic.
//!
//! # Overview
//!
//! - [`config`] reads the `MQTT_*` environment variables with typed getters
//! - [`transport::mqtt`] builds connection options and drives the rumqttc event loop
//! - [`client`] runs the connect handshake against a timeout and shuts down on signals
//! - [`observability`] sets up structured logging
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use runner_mqtt::{is_mqtt_config_available, Client};
//! use std::time::Duration;
//!
//! # async fn run() -> runner_mqtt::ClientResult<()> {
//! if !is_mqtt_config_available() {
//!     return Ok(());
//! }
//!
//! let client = Client::from_env()?;
//! client.connect(Duration::from_secs(5)).await?;
//! client
//!     .subscribe(|msg| println!("{}: {}", msg.topic, msg.payload_str()))
//!     .await?;
//! client.publish("jobs/42/events", "started").await?;
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod signal;
pub mod testing;
pub mod transport;

pub use client::Client;
pub use config::{is_mqtt_config_available, ConfKey, ConfigError, EnvSource, MqttConf, ProcessEnv};
pub use error::{ClientError, ClientResult};
pub use transport::mqtt::{
    build_options, ConnectionParameters, ConnectionState, InboundMessage, MqttError, MqttTransport,
};
pub use transport::Transport;
