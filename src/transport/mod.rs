//! Transport layer for broker communication
//!
//! This module provides the capability set the client wrapper consumes
//! (connect, publish, subscribe, disconnect, connection query, options) and
//! its rumqttc implementation.

use bytes::Bytes;
use rumqttc::QoS;
use std::time::Duration;

pub mod mqtt;

use mqtt::{ConnectionParameters, MessageHandler, MqttError};

/// Broker transport
///
/// This trait is the boundary to the MQTT protocol implementation so the
/// client wrapper can be driven by a real broker connection or by a mock.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Perform the connect handshake; resolves once the broker accepted or refused
    ///
    /// `timeout` is how long the caller waits. The transport's own network
    /// timeouts must not be shorter.
    async fn connect(&self, timeout: Duration) -> Result<(), MqttError>;

    /// Publish one message; resolves once the broker acknowledged it (QoS 1/2)
    /// or it was written (QoS 0)
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), MqttError>;

    /// Subscribe to `filter`; resolves once the broker acknowledged the subscription
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), MqttError>;

    /// Disconnect, giving in-flight work up to `grace` to complete
    async fn disconnect(&self, grace: Duration) -> Result<(), MqttError>;

    /// Abandon a connect attempt that is still in flight
    fn abort_connect(&self) {}

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Parameters this transport was built from
    fn options(&self) -> &ConnectionParameters;
}
