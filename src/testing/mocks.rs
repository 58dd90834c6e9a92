//! Mock implementations for testing
//!
//! Provides an in-memory [`Transport`] so the client wrapper can be exercised
//! without a broker.

use crate::transport::mqtt::{
    topic_matches, ConnectionParameters, ConnectionState, InboundMessage, MessageHandler,
    MqttError, TlsPolicy, DEFAULT_KEEP_ALIVE,
};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;

/// A publish recorded by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

/// Mock transport for testing
pub struct MockTransport {
    params: ConnectionParameters,
    pub connect_latency: Duration,
    pub connect_error: Option<String>,
    pub should_fail: bool,
    pub reject_subscriptions: bool,
    state: StdMutex<ConnectionState>,
    connect_attempts: AtomicUsize,
    aborted: AtomicBool,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS, MessageHandler)>>,
    disconnect_grace: Mutex<Option<Duration>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("client_id", &self.params.client_id)
            .field("connect_latency", &self.connect_latency)
            .field("connect_error", &self.connect_error)
            .field("should_fail", &self.should_fail)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_parameters(ConnectionParameters {
            broker_uri: "tcp://localhost:1883".to_string(),
            client_id: "mock-client".to_string(),
            credentials: None,
            tls: TlsPolicy {
                insecure_skip_verify: false,
            },
            clean_session: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
        })
    }

    pub fn with_parameters(params: ConnectionParameters) -> Self {
        Self {
            params,
            connect_latency: Duration::ZERO,
            connect_error: None,
            should_fail: false,
            reject_subscriptions: false,
            state: StdMutex::new(ConnectionState::Unconnected),
            connect_attempts: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            disconnect_grace: Mutex::new(None),
        }
    }

    /// Connect handshake takes `latency` before resolving
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Connect handshake resolves with an error
    pub fn with_connect_failure(mut self, reason: impl Into<String>) -> Self {
        self.connect_error = Some(reason.into());
        self
    }

    /// Publish and subscribe fail as if the broker refused them
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new()
        }
    }

    /// SubAck carries a failure return code
    pub fn with_rejected_subscriptions(mut self) -> Self {
        self.reject_subscriptions = true;
        self
    }

    fn current_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|_| ConnectionState::Disconnected("poisoned".to_string()))
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn ensure_connected(&self) -> Result<(), MqttError> {
        let state = self.current_state();
        if state.is_connected() {
            Ok(())
        } else {
            Err(MqttError::NotConnected { state })
        }
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Active subscriptions as `(filter, qos)`
    pub async fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|(filter, qos, _)| (filter.clone(), *qos))
            .collect()
    }

    /// Grace period passed to the last disconnect
    pub async fn disconnect_grace(&self) -> Option<Duration> {
        *self.disconnect_grace.lock().await
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Simulate an inbound message; returns how many handlers received it
    pub async fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let subscriptions = self.subscriptions.lock().await;
        let mut delivered = 0;
        for (filter, qos, handler) in subscriptions.iter() {
            if topic_matches(filter, topic) {
                handler(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos: *qos,
                    retain: false,
                    duplicate: false,
                });
                delivered += 1;
            }
        }
        delivered
    }

    /// Simulate the broker dropping the connection
    pub fn drop_connection(&self) {
        self.set_state(ConnectionState::Disconnected("broker went away".to_string()));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _timeout: Duration) -> Result<(), MqttError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        if !self.connect_latency.is_zero() {
            tokio::time::sleep(self.connect_latency).await;
        }

        match &self.connect_error {
            Some(reason) => {
                self.set_state(ConnectionState::Disconnected(reason.clone()));
                Err(MqttError::ConnectionFailedStr(reason.clone()))
            }
            None => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), MqttError> {
        self.ensure_connected()?;
        if self.should_fail {
            return Err(MqttError::PublishFailed {
                topic: topic.to_string(),
                source: "Mock publish failure".into(),
            });
        }

        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), MqttError> {
        self.ensure_connected()?;
        if self.should_fail {
            return Err(MqttError::SubscriptionFailed {
                topic: filter.to_string(),
                source: "Mock subscribe failure".into(),
            });
        }
        if self.reject_subscriptions {
            return Err(MqttError::SubscriptionRejected(filter.to_string()));
        }

        self.subscriptions
            .lock()
            .await
            .push((filter.to_string(), qos, handler));
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), MqttError> {
        *self.disconnect_grace.lock().await = Some(grace);
        self.subscriptions.lock().await.clear();
        self.set_state(ConnectionState::Disconnected("client disconnected".to_string()));
        Ok(())
    }

    fn abort_connect(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected("connect aborted".to_string()));
    }

    fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    fn options(&self) -> &ConnectionParameters {
        &self.params
    }
}
