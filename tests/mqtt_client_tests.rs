//! Integration tests for the rumqttc transport without a broker
//!
//! Covers construction from configuration, option conversion, state before
//! connecting and connect failure paths that need no running broker.

use bytes::Bytes;
use runner_mqtt::config::MqttConf;
use runner_mqtt::transport::mqtt::{
    build_options, ConnectionParameters, ConnectionState, MqttError, MqttTransport, TlsPolicy,
    DEFAULT_KEEP_ALIVE,
};
use runner_mqtt::transport::Transport;
use runner_mqtt::{Client, ClientError};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_params(uri: &str) -> ConnectionParameters {
    ConnectionParameters {
        broker_uri: uri.to_string(),
        client_id: "integration-test".to_string(),
        credentials: None,
        tls: TlsPolicy {
            insecure_skip_verify: false,
        },
        clean_session: true,
        keep_alive: DEFAULT_KEEP_ALIVE,
    }
}

fn conf(pairs: &[(&str, &str)]) -> MqttConf {
    MqttConf::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

#[tokio::test]
async fn test_transport_creation() {
    let transport = MqttTransport::new(test_params("mqtt://localhost:1883"))
        .expect("Transport creation should succeed");

    assert!(
        !transport.is_connected(),
        "Transport should not be connected until connect() is called"
    );
    assert_eq!(transport.connection_state(), ConnectionState::Unconnected);
    assert_eq!(transport.options().client_id, "integration-test");
}

#[tokio::test]
async fn test_transport_creation_with_credentials() {
    let mut params = test_params("tcp://localhost:1883");
    params.set_credentials("runner", "secret");

    let transport = MqttTransport::new(params).expect("Transport creation should succeed");
    let credentials = transport.options().credentials.clone().unwrap();
    assert_eq!(credentials.username, "runner");
    assert_eq!(credentials.password, "secret");
}

#[tokio::test]
async fn test_transport_creation_tls() {
    let mut params = test_params("ssl://localhost:8883");
    params.tls.insecure_skip_verify = true;
    assert!(MqttTransport::new(params).is_ok());

    // Verified TLS uses the default root store
    assert!(MqttTransport::new(test_params("mqtts://localhost:8883")).is_ok());
}

#[tokio::test]
async fn test_transport_rejects_unknown_scheme() {
    let result = MqttTransport::new(test_params("http://localhost:1883"));
    assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
}

#[tokio::test]
async fn test_publish_before_connect() {
    let transport = MqttTransport::new(test_params("tcp://localhost:1883")).unwrap();
    let result = transport
        .publish("jobs/1", QoS::AtLeastOnce, false, Bytes::from_static(b"x"))
        .await;
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));
}

#[tokio::test]
async fn test_subscribe_before_connect() {
    let transport = MqttTransport::new(test_params("tcp://localhost:1883")).unwrap();
    let result = transport
        .subscribe("jobs/#", QoS::AtMostOnce, Arc::new(|_msg| {}))
        .await;
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));
}

#[tokio::test]
async fn test_connect_refused_fails_without_retry() {
    // Nothing listens on port 1
    let transport = MqttTransport::new(test_params("tcp://127.0.0.1:1")).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        transport.connect(Duration::from_secs(5)),
    )
        .await
        .expect("A refused connection should fail promptly");

    assert!(result.is_err());
    assert!(matches!(
        transport.connection_state(),
        ConnectionState::Disconnected(_)
    ));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_second_connect_rejected() {
    let transport = MqttTransport::new(test_params("tcp://127.0.0.1:1")).unwrap();
    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        transport.connect(Duration::from_secs(5)),
    )
    .await;

    let result = transport.connect(Duration::from_secs(5)).await;
    assert!(matches!(result, Err(MqttError::AlreadyStarted)));
}

#[tokio::test]
async fn test_client_against_refused_broker() {
    let c = conf(&[
        ("MQTT_URI", "tcp://127.0.0.1:1"),
        ("MQTT_INSECURE_SKIP_VERIFY", "false"),
    ]);
    let client = Client::new(c).expect("Client creation should succeed");

    let started = Instant::now();
    let result = client.connect(Duration::from_secs(5)).await;

    assert!(matches!(result, Err(ClientError::Transport(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(client.state().is_terminal());
}

#[tokio::test]
async fn test_build_options_feeds_transport() {
    let c = conf(&[
        ("MQTT_URI", "tcp://localhost:1883"),
        ("MQTT_INSECURE_SKIP_VERIFY", "false"),
        ("MQTT_USER", ""),
        ("MQTT_PWD", "ignored"),
    ]);
    let params = build_options(&c).unwrap();
    let transport = MqttTransport::new(params).unwrap();

    assert_eq!(transport.options().client_id, "runner-client");
    assert!(transport.options().credentials.is_none());
}

#[tokio::test]
async fn test_disconnect_never_connected() {
    let transport = MqttTransport::new(test_params("tcp://localhost:1883")).unwrap();
    assert!(transport.disconnect(Duration::from_millis(50)).await.is_ok());
}
