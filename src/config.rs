//! Environment-driven configuration for the MQTT client
//!
//! Every setting lives in a named environment variable and is re-read on each
//! access, so a value changed between two reads is picked up by the second.
//! Lookups go through an [`EnvSource`] which is the process environment in
//! production and a plain map in tests.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `MQTT_URI` | broker address, e.g. `tcp://host:1883` | none |
//! | `MQTT_USER` | username | empty |
//! | `MQTT_PWD` | password | empty |
//! | `MQTT_INSECURE_SKIP_VERIFY` | TLS verification bypass | required |
//! | `MQTT_CLIENT_ID` | client identifier | `runner-client` |
//! | `MQTT_QoS` | publish/subscribe QoS (0/1/2) | `0` |
//! | `MQTT_TOPIC` | subscribe topic | empty |
//! | `MQTT_SHUTDOWN_GRACE_PERIOD` | disconnect grace period (ms) | `250` |
//! | `MQTT_DEBUG` | debug tracing when non-empty | disabled |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Client id used when `MQTT_CLIENT_ID` is unset or empty
pub const DEFAULT_CLIENT_ID: &str = "runner-client";

/// Grace period (milliseconds) used when `MQTT_SHUTDOWN_GRACE_PERIOD` is unset or malformed
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_MS: u64 = 250;

/// Names of the environment variables read by [`MqttConf`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfKey {
    Uri,
    User,
    Pwd,
    InsecureSkipVerify,
    ClientId,
    QoS,
    Topic,
    ShutdownGracePeriod,
    Debug,
}

impl ConfKey {
    pub const ALL: [ConfKey; 9] = [
        ConfKey::Uri,
        ConfKey::User,
        ConfKey::Pwd,
        ConfKey::InsecureSkipVerify,
        ConfKey::ClientId,
        ConfKey::QoS,
        ConfKey::Topic,
        ConfKey::ShutdownGracePeriod,
        ConfKey::Debug,
    ];

    /// Environment variable name for this key
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfKey::Uri => "MQTT_URI",
            ConfKey::User => "MQTT_USER",
            ConfKey::Pwd => "MQTT_PWD",
            ConfKey::InsecureSkipVerify => "MQTT_INSECURE_SKIP_VERIFY",
            ConfKey::ClientId => "MQTT_CLIENT_ID",
            ConfKey::QoS => "MQTT_QoS",
            ConfKey::Topic => "MQTT_TOPIC",
            ConfKey::ShutdownGracePeriod => "MQTT_SHUTDOWN_GRACE_PERIOD",
            ConfKey::Debug => "MQTT_DEBUG",
        }
    }
}

impl fmt::Display for ConfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration errors
///
/// Returned instead of terminating the process; the embedding application
/// decides whether a bad value is fatal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for variable {key}, value [{value}]")]
    InvalidValue { key: ConfKey, value: String },
    #[error("invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(i32),
}

/// Lookup of named string values
pub trait EnvSource: Send + Sync {
    /// Raw value for `key`, `None` when unset
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Read-only view over the MQTT environment variables
#[derive(Clone)]
pub struct MqttConf {
    source: Arc<dyn EnvSource>,
}

impl fmt::Debug for MqttConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConf")
            .field("uri", &self.uri())
            .field("client_id", &self.client_id())
            .field("topic", &self.topic())
            .field("user", &self.user())
            .finish_non_exhaustive()
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self::from_env()
    }
}

impl MqttConf {
    /// Configuration backed by the process environment
    pub fn from_env() -> Self {
        Self::with_source(ProcessEnv)
    }

    /// Configuration backed by an arbitrary source
    pub fn with_source<S: EnvSource + 'static>(source: S) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Configuration backed by a fixed set of `(variable, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::with_source(map)
    }

    /// Raw value of `key`, empty string when unset
    pub fn get(&self, key: ConfKey) -> String {
        self.source.var(key.as_str()).unwrap_or_default()
    }

    pub fn uri(&self) -> String {
        self.get(ConfKey::Uri)
    }

    pub fn client_id(&self) -> String {
        self.get(ConfKey::ClientId)
    }

    pub fn topic(&self) -> String {
        self.get(ConfKey::Topic)
    }

    pub fn user(&self) -> String {
        self.get(ConfKey::User)
    }

    pub fn password(&self) -> String {
        self.get(ConfKey::Pwd)
    }

    /// QoS level, `0` when unset
    ///
    /// Any set value that is not an integer is an error. The range is not
    /// checked here; see [`MqttConf::qos_level`].
    pub fn qos(&self) -> Result<i32, ConfigError> {
        let raw = self.get(ConfKey::QoS);
        if raw.is_empty() {
            return Ok(0);
        }
        raw.parse::<i32>().map_err(|_| ConfigError::InvalidValue {
            key: ConfKey::QoS,
            value: raw,
        })
    }

    /// QoS level as a protocol value
    pub fn qos_level(&self) -> Result<rumqttc::QoS, ConfigError> {
        let level = self.qos()?;
        crate::transport::mqtt::qos_from_level(level).ok_or(ConfigError::InvalidQos(level))
    }

    /// TLS verification bypass
    ///
    /// There is no default: an unset variable is reported like a malformed one.
    pub fn insecure_skip_verify(&self) -> Result<bool, ConfigError> {
        let raw = self.get(ConfKey::InsecureSkipVerify);
        parse_bool(&raw).ok_or(ConfigError::InvalidValue {
            key: ConfKey::InsecureSkipVerify,
            value: raw,
        })
    }

    /// Disconnect grace period
    ///
    /// A malformed value is logged and replaced by the default; it never fails.
    pub fn shutdown_grace_period(&self) -> Duration {
        let raw = self.get(ConfKey::ShutdownGracePeriod);
        if raw.is_empty() {
            return Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_PERIOD_MS);
        }
        match parse_uint32(&raw) {
            Some(ms) => Duration::from_millis(u64::from(ms)),
            None => {
                error!(
                    "invalid value for variable {}, value [{}], using {}ms",
                    ConfKey::ShutdownGracePeriod,
                    raw,
                    DEFAULT_SHUTDOWN_GRACE_PERIOD_MS
                );
                Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_PERIOD_MS)
            }
        }
    }

    pub fn debug_enabled(&self) -> bool {
        !self.get(ConfKey::Debug).is_empty()
    }

    /// True iff a broker URI is configured
    pub fn is_available(&self) -> bool {
        !self.uri().is_empty()
    }

    /// Evaluate every setting that can be malformed, returning the first error
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.qos_level()?;
        self.insecure_skip_verify()?;
        Ok(())
    }
}

/// Whether messaging should be enabled at all, based on the process environment
pub fn is_mqtt_config_available() -> bool {
    MqttConf::from_env().is_available()
}

/// Boolean literals accepted for flag variables
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Unsigned 32-bit integer with base prefix detection
///
/// `0x`/`0X` hex, `0o`/`0O` or a bare leading `0` octal, `0b`/`0B` binary,
/// otherwise decimal. Single underscores may separate digits, or a prefix
/// from the first digit.
fn parse_uint32(raw: &str) -> Option<u32> {
    if raw.is_empty() {
        return None;
    }

    let (radix, digits, prefixed) = match raw.as_bytes() {
        [b'0', b'x' | b'X', ..] => (16, &raw[2..], true),
        [b'0', b'o' | b'O', ..] => (8, &raw[2..], true),
        [b'0', b'b' | b'B', ..] => (2, &raw[2..], true),
        [b'0', _, ..] => (8, &raw[1..], true),
        _ => (10, raw, false),
    };

    if digits.contains('_')
        && ((!prefixed && digits.starts_with('_'))
            || digits.ends_with('_')
            || digits.contains("__"))
    {
        return None;
    }

    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    if cleaned.is_empty() || cleaned.starts_with('+') || cleaned.starts_with('-') {
        return None;
    }
    u32::from_str_radix(&cleaned, radix).ok()
}
