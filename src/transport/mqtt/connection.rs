//! Pure connection parameter and state management for the MQTT transport
//!
//! This module contains the option builder (configuration to
//! [`ConnectionParameters`]), the conversion of those parameters into rumqttc
//! options, and the connection state machine.

use super::tls;
use crate::config::{ConfigError, MqttConf, DEFAULT_CLIENT_ID};
use rumqttc::{MqttOptions, QoS, Transport as RumqttcTransport};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Keep alive used for every connection
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// rumqttc's own network timeout, in seconds
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 5;

/// Connection state for the MQTT client
///
/// `Disconnected` is terminal: there is no reconnect path out of it.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Created, no connect attempted yet
    Unconnected,
    /// Connect handshake in flight
    Connecting,
    /// ConnAck received, ready for publish/subscribe
    Connected,
    /// Connection closed or never established, with reason
    Disconnected(String),
}

impl ConnectionState {
    /// Next state after `event` (pure function)
    pub fn on(&self, event: ConnectionEvent) -> ConnectionState {
        match (self, event) {
            (ConnectionState::Disconnected(reason), _) => {
                ConnectionState::Disconnected(reason.clone())
            }
            (ConnectionState::Unconnected, ConnectionEvent::ConnectStarted) => {
                ConnectionState::Connecting
            }
            (ConnectionState::Connecting, ConnectionEvent::ConnAckReceived) => {
                ConnectionState::Connected
            }
            (_, ConnectionEvent::ConnectFailed(reason)) => ConnectionState::Disconnected(reason),
            (_, ConnectionEvent::Closed(reason)) => ConnectionState::Disconnected(reason),
            (state, _) => state.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unconnected => f.write_str("unconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
        }
    }
}

/// Events driving [`ConnectionState`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectStarted,
    ConnAckReceived,
    ConnectFailed(String),
    Closed(String),
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("Publishing to {topic} failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Subscription to {topic} failed")]
    SubscriptionFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Subscription to {0} rejected by broker")]
    SubscriptionRejected(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Connect already attempted on this transport")]
    AlreadyStarted,
    #[error("Client is disconnecting")]
    Disconnecting,
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Username and password sent on connect
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// TLS policy: server verification may be skipped, no client certificate is ever sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPolicy {
    pub insecure_skip_verify: bool,
}

/// Broker connection parameters, derived once from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParameters {
    pub broker_uri: String,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub tls: TlsPolicy,
    pub clean_session: bool,
    pub keep_alive: Duration,
}

impl ConnectionParameters {
    /// Attach credentials; an empty username drops them, whatever the password
    pub fn set_credentials(&mut self, username: &str, password: &str) {
        self.credentials = if username.is_empty() {
            None
        } else {
            Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
        };
    }
}

/// Build connection parameters from configuration (pure function of `conf` at call time)
pub fn build_options(conf: &MqttConf) -> Result<ConnectionParameters, ConfigError> {
    let configured_id = conf.client_id();
    let client_id = if configured_id.is_empty() {
        DEFAULT_CLIENT_ID.to_string()
    } else {
        configured_id
    };

    let mut params = ConnectionParameters {
        broker_uri: conf.uri(),
        client_id,
        credentials: None,
        tls: TlsPolicy {
            insecure_skip_verify: conf.insecure_skip_verify()?,
        },
        clean_session: true,
        keep_alive: DEFAULT_KEEP_ALIVE,
    };
    params.set_credentials(&conf.user(), &conf.password());

    Ok(params)
}

/// Broker endpoint parsed from a URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

/// Parse `scheme://host[:port]` into a broker endpoint (pure function)
///
/// `tcp`/`mqtt` are plain (default port 1883), `ssl`/`tls`/`mqtts`/`tcps` use
/// TLS (default port 8883).
pub fn parse_broker_uri(uri: &str) -> Result<BrokerAddress, MqttError> {
    let url = Url::parse(uri).map_err(|_| MqttError::InvalidBrokerUrl(uri.to_string()))?;

    let secure = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" | "tcps" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(uri.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(uri.to_string()))?;
    let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        secure,
    })
}

/// Turn connection parameters into rumqttc options
pub fn configure_mqtt_options(params: &ConnectionParameters) -> Result<MqttOptions, MqttError> {
    let address = parse_broker_uri(&params.broker_uri)?;

    let mut mqtt_options = MqttOptions::new(params.client_id.clone(), address.host, address.port);
    mqtt_options.set_clean_session(params.clean_session);
    mqtt_options.set_keep_alive(params.keep_alive);

    if let Some(credentials) = &params.credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    // The TLS policy only takes effect on TLS schemes
    if address.secure {
        let transport = match tls::client_config(&params.tls) {
            Some(config) => RumqttcTransport::tls_with_config(config),
            None => RumqttcTransport::tls_with_default_config(),
        };
        mqtt_options.set_transport(transport);
    }

    Ok(mqtt_options)
}

/// Network timeout (whole seconds) for an event loop whose caller waits `connect_timeout`
///
/// Always longer than `connect_timeout`, so the caller's own timeout fires first.
pub fn network_timeout_secs(connect_timeout: Duration) -> u64 {
    let secs = connect_timeout
        .as_secs()
        .saturating_add(u64::from(connect_timeout.subsec_nanos() > 0));
    secs.saturating_add(1).max(DEFAULT_NETWORK_TIMEOUT_SECS)
}

/// Map a numeric level onto a QoS (pure function)
pub fn qos_from_level(level: i32) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
