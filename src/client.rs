//! Client wrapper around a broker transport
//!
//! [`Client`] owns one transport and the configuration it was built from. It
//! runs the connect handshake against a timeout, publishes and subscribes with
//! the configured QoS, and shuts down on SIGINT/SIGTERM with the configured
//! grace period.
//!
//! ```rust,no_run
//! use runner_mqtt::Client;
//! use std::sync::Arc;
//!
//! # async fn run() -> runner_mqtt::ClientResult<()> {
//! let client = Arc::new(Client::from_env()?);
//!
//! let runner = client.clone();
//! let handle = tokio::spawn(async move { runner.start(10).await });
//!
//! // once connected
//! client.publish("jobs/42/events", "started").await?;
//! handle.await.ok();
//! # Ok(())
//! # }
//! ```

use crate::config::MqttConf;
use crate::error::{ClientError, ClientResult};
use crate::signal::ShutdownSignal;
use crate::transport::mqtt::{
    build_options, ConnectionEvent, ConnectionParameters, ConnectionState, InboundMessage,
    MessageHandler, MqttError, MqttTransport,
};
use crate::transport::Transport;
use crate::{lifecycle_span, mqtt_span};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, Instrument};

/// MQTT client bound to one transport
pub struct Client<T: Transport = MqttTransport> {
    conf: MqttConf,
    transport: Arc<T>,
    state: watch::Sender<ConnectionState>,
}

impl Client<MqttTransport> {
    /// Client for the broker described by `conf`
    ///
    /// Every configuration value that can be malformed is checked here, so a
    /// bad environment fails before any network activity.
    pub fn new(conf: MqttConf) -> ClientResult<Self> {
        conf.validate()?;
        let params = build_options(&conf)?;
        Self::with_parameters(conf, params)
    }

    /// Client using explicit connection parameters, e.g. after command-line overrides
    pub fn with_parameters(conf: MqttConf, params: ConnectionParameters) -> ClientResult<Self> {
        conf.qos_level()?;
        let transport = MqttTransport::new(params)?;
        debug!("new mqtt client created");
        Ok(Self::with_transport(conf, transport))
    }

    /// Client configured from the process environment
    pub fn from_env() -> ClientResult<Self> {
        Self::new(MqttConf::from_env())
    }
}

impl<T: Transport + 'static> Client<T> {
    /// Client driving an arbitrary transport
    pub fn with_transport(conf: MqttConf, transport: T) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unconnected);
        Self {
            conf,
            transport: Arc::new(transport),
            state,
        }
    }

    pub fn conf(&self) -> &MqttConf {
        &self.conf
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Lifecycle state of this client
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every lifecycle change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether the transport currently holds a live broker connection
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn transition(&self, event: ConnectionEvent) {
        self.state.send_modify(|state| *state = state.on(event));
    }

    /// Claim the single connect attempt this client allows
    fn begin_connect(&self) -> ClientResult<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Unconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                result = Err(ClientError::InvalidState {
                    state: state.clone(),
                });
                false
            }
        });
        result
    }

    /// Connect, giving the handshake at most `timeout`
    ///
    /// Returns as soon as the handshake resolved or the timeout elapsed,
    /// whichever comes first. On timeout the attempt is abandoned. A client
    /// gets one attempt: after a failure it stays disconnected.
    pub async fn connect(&self, timeout: Duration) -> ClientResult<()> {
        self.begin_connect()?;

        let params = self.transport.options();
        let span = lifecycle_span!(
            event = "connect",
            broker = %params.broker_uri,
            client_id = %params.client_id
        );

        async {
            let (outcome_tx, outcome_rx) = oneshot::channel();
            let transport = self.transport.clone();
            let connect_task = tokio::spawn(async move {
                let _ = outcome_tx.send(transport.connect(timeout).await);
            });

            tokio::select! {
                outcome = outcome_rx => {
                    let outcome = outcome.unwrap_or_else(|_| {
                        Err(MqttError::ConnectionFailedStr(
                            "connect task ended without an outcome".to_string(),
                        ))
                    });
                    match outcome {
                        Ok(()) => {
                            self.transition(ConnectionEvent::ConnAckReceived);
                            let params = self.transport.options();
                            info!(
                                "Connected to mqtt broker at [ {} ] with client id [ {} ]",
                                params.broker_uri, params.client_id
                            );
                            Ok(())
                        }
                        Err(e) => {
                            debug!("MQ client failed to connect : {}", e);
                            self.transition(ConnectionEvent::ConnectFailed(e.to_string()));
                            Err(ClientError::from(e))
                        }
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    connect_task.abort();
                    self.transport.abort_connect();
                    self.transition(ConnectionEvent::ConnectFailed("connect timed out".to_string()));
                    error!(
                        "mqtt client failed to connect mqtt broker, the timed out period of {:?} has elapsed",
                        timeout
                    );
                    Err(ClientError::ConnectTimeout { timeout })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Connect within `wait_secs` seconds, then run until SIGINT or SIGTERM
    ///
    /// Signal handlers are installed before connecting. A connect failure or
    /// timeout is returned immediately; otherwise the client disconnects
    /// gracefully once a signal arrives.
    pub async fn start(&self, wait_secs: u64) -> ClientResult<()> {
        let mut stop = ShutdownSignal::register().map_err(ClientError::Signal)?;
        self.start_until(Duration::from_secs(wait_secs), async move { stop.recv().await })
            .await
    }

    /// Connect within `timeout`, then run until `shutdown` resolves
    pub async fn start_until<F>(&self, timeout: Duration, shutdown: F) -> ClientResult<()>
    where
        F: Future<Output = ()>,
    {
        self.connect(timeout).await?;
        info!("mqtt client running, waiting for shutdown signal");
        shutdown.await;
        self.shutdown().await
    }

    /// Disconnect, giving in-flight work the configured grace period
    pub async fn shutdown(&self) -> ClientResult<()> {
        let grace = self.conf.shutdown_grace_period();
        debug!("disconnecting mqtt client..");
        let result = self.transport.disconnect(grace).await;
        self.transition(ConnectionEvent::Closed("client shut down".to_string()));
        debug!("mqtt client disconnected..");
        result.map_err(Into::into)
    }

    /// Publish `message` to `topic` at the configured QoS, never retained
    ///
    /// Resolves once the broker acknowledged the message (QoS 1/2) or it was
    /// written to the connection (QoS 0).
    pub async fn publish(&self, topic: &str, message: impl Into<Bytes>) -> ClientResult<()> {
        let qos = self.conf.qos_level()?;
        let payload = message.into();

        async {
            match self.transport.publish(topic, qos, false, payload).await {
                Ok(()) => {
                    debug!("Published message to topic {}", topic);
                    Ok(())
                }
                Err(e) => {
                    debug!("MQ client failed to publish message to topic {} : {}", topic, e);
                    Err(ClientError::from(e))
                }
            }
        }
        .instrument(mqtt_span!(operation = "publish", topic = %topic, qos = ?qos))
        .await
    }

    /// Subscribe to the configured topic at the configured QoS
    ///
    /// `handler` is called for every matching message until the connection
    /// ends. It runs on the transport's event loop task.
    pub async fn subscribe<F>(&self, handler: F) -> ClientResult<()>
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let qos = self.conf.qos_level()?;
        let topic = self.conf.topic();
        let handler: MessageHandler = Arc::new(handler);

        async {
            match self.transport.subscribe(&topic, qos, handler).await {
                Ok(()) => {
                    debug!("subscribed to topic {}", topic);
                    Ok(())
                }
                Err(e) => {
                    debug!("failed to subscribe topic {} : {}", topic, e);
                    Err(ClientError::from(e))
                }
            }
        }
        .instrument(mqtt_span!(operation = "subscribe", topic = %topic, qos = ?qos))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn conf(pairs: &[(&str, &str)]) -> MqttConf {
        MqttConf::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    fn client(mock: MockTransport) -> Client<MockTransport> {
        Client::with_transport(conf(&[("MQTT_TOPIC", "jobs/#"), ("MQTT_QoS", "1")]), mock)
    }

    #[test]
    fn test_new_rejects_malformed_config() {
        let result = Client::new(conf(&[("MQTT_URI", "tcp://localhost:1883")]));
        assert!(matches!(result, Err(ClientError::Config(_))));

        let result = Client::new(conf(&[
            ("MQTT_URI", "tcp://localhost:1883"),
            ("MQTT_INSECURE_SKIP_VERIFY", "false"),
            ("MQTT_QoS", "7"),
        ]));
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_new_rejects_bad_uri() {
        let result = Client::new(conf(&[
            ("MQTT_URI", "ftp://localhost"),
            ("MQTT_INSECURE_SKIP_VERIFY", "false"),
        ]));
        assert!(matches!(
            result,
            Err(ClientError::Transport(MqttError::InvalidBrokerUrl(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_success_sets_connected() {
        let client = client(MockTransport::new());
        client.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_second_connect_is_invalid_state() {
        let client = client(MockTransport::new());
        client.connect(Duration::from_secs(1)).await.unwrap();
        let second = client.connect(Duration::from_secs(1)).await;
        assert!(matches!(second, Err(ClientError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_publish_uses_configured_qos_without_retain() {
        let client = client(MockTransport::new());
        client.connect(Duration::from_secs(1)).await.unwrap();
        client.publish("jobs/1", "payload").await.unwrap();

        let published = client.transport().published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "jobs/1");
        assert_eq!(published[0].qos, rumqttc::QoS::AtLeastOnce);
        assert!(!published[0].retain);
        assert_eq!(published[0].payload, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_publish_invalid_qos_is_config_error() {
        let client = Client::with_transport(conf(&[("MQTT_QoS", "one")]), MockTransport::new());
        client.connect(Duration::from_secs(1)).await.unwrap();
        let result = client.publish("jobs/1", "x").await;
        assert!(matches!(result, Err(ClientError::Config(_))));
        assert!(client.transport().published().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_uses_configured_topic() {
        let client = client(MockTransport::new());
        client.connect(Duration::from_secs(1)).await.unwrap();
        client.subscribe(|_msg| {}).await.unwrap();

        let subscriptions = client.transport().subscriptions().await;
        assert_eq!(subscriptions, vec![("jobs/#".to_string(), rumqttc::QoS::AtLeastOnce)]);
    }

    #[tokio::test]
    async fn test_shutdown_uses_grace_period() {
        let client = Client::with_transport(
            conf(&[("MQTT_SHUTDOWN_GRACE_PERIOD", "900")]),
            MockTransport::new(),
        );
        client.connect(Duration::from_secs(1)).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(
            client.transport().disconnect_grace().await,
            Some(Duration::from_millis(900))
        );
        assert!(client.state().is_terminal());
    }
}
