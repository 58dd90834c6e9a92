//! Graceful shutdown against a local broker that acknowledges slowly
//!
//! The broker below speaks just enough MQTT 3.1.1 (via rumqttc's packet codec)
//! to accept a connection, hold back PUBACKs and record the DISCONNECT.

use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{read, ConnAck, ConnectReturnCode, Packet, PubAck};
use runner_mqtt::config::MqttConf;
use runner_mqtt::transport::mqtt::MqttError;
use runner_mqtt::{Client, ClientError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrokerEvent {
    Publish,
    PubAck,
    Disconnect,
}

async fn read_packet(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Packet> {
    loop {
        if !buf.is_empty() {
            match read(buf, MAX_PACKET_SIZE) {
                Ok(packet) => return Some(packet),
                Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(_) => return None,
            }
        }
        if stream.read_buf(buf).await.ok()? == 0 {
            return None;
        }
    }
}

/// Serve one client, answering every PUBLISH after `ack_delay`
async fn run_slow_ack_broker(listener: TcpListener, ack_delay: Duration) -> Vec<BrokerEvent> {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = BytesMut::new();
    let mut events = Vec::new();

    while let Some(packet) = read_packet(&mut stream, &mut buf).await {
        let mut out = BytesMut::new();
        match packet {
            Packet::Connect(_) => {
                ConnAck::new(ConnectReturnCode::Success, false)
                    .write(&mut out)
                    .unwrap();
            }
            Packet::Publish(publish) => {
                events.push(BrokerEvent::Publish);
                tokio::time::sleep(ack_delay).await;
                PubAck::new(publish.pkid).write(&mut out).unwrap();
                events.push(BrokerEvent::PubAck);
            }
            Packet::Disconnect => {
                events.push(BrokerEvent::Disconnect);
                break;
            }
            _ => {}
        }
        if !out.is_empty() && stream.write_all(&out).await.is_err() {
            break;
        }
    }
    events
}

fn conf(port: u16, grace_ms: &str) -> MqttConf {
    MqttConf::from_pairs([
        ("MQTT_URI".to_string(), format!("tcp://127.0.0.1:{port}")),
        ("MQTT_INSECURE_SKIP_VERIFY".to_string(), "false".to_string()),
        ("MQTT_CLIENT_ID".to_string(), "grace-test".to_string()),
        ("MQTT_QoS".to_string(), "1".to_string()),
        ("MQTT_SHUTDOWN_GRACE_PERIOD".to_string(), grace_ms.to_string()),
    ])
}

async fn start_broker(ack_delay: Duration) -> (u16, tokio::task::JoinHandle<Vec<BrokerEvent>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (port, tokio::spawn(run_slow_ack_broker(listener, ack_delay)))
}

#[tokio::test]
async fn test_shutdown_waits_for_inflight_publish() {
    // Arrange: PUBACK arrives 200ms after the publish, grace period is 2s
    let (port, broker) = start_broker(Duration::from_millis(200)).await;
    let client = Arc::new(Client::new(conf(port, "2000")).unwrap());
    client.connect(Duration::from_secs(5)).await.unwrap();

    let publisher = client.clone();
    let publish = tokio::spawn(async move { publisher.publish("a/b", "x").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Act
    let started = Instant::now();
    client.shutdown().await.expect("Shutdown should succeed");
    let elapsed = started.elapsed();

    // Assert: the publish completed, DISCONNECT only followed the PUBACK
    let outcome = publish.await.unwrap();
    assert!(outcome.is_ok(), "in-flight publish should complete: {outcome:?}");
    assert!(
        elapsed >= Duration::from_millis(100),
        "shutdown returned before the ack: {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(2), "shutdown used the whole grace period");
    assert_eq!(
        broker.await.unwrap(),
        vec![BrokerEvent::Publish, BrokerEvent::PubAck, BrokerEvent::Disconnect]
    );
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_shutdown_forced_after_grace_period() {
    // The ack would take far longer than the 100ms grace period
    let (port, _broker) = start_broker(Duration::from_secs(5)).await;
    let client = Arc::new(Client::new(conf(port, "100")).unwrap());
    client.connect(Duration::from_secs(5)).await.unwrap();

    let publisher = client.clone();
    let publish = tokio::spawn(async move { publisher.publish("a/b", "x").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let _ = client.shutdown().await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "shutdown must not outlive its grace period"
    );

    let outcome = tokio::time::timeout(Duration::from_secs(1), publish)
        .await
        .expect("pending publish should be failed on forced shutdown")
        .unwrap();
    assert!(matches!(outcome, Err(ClientError::Transport(_))));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_publish_refused_once_shutdown_started() {
    let (port, _broker) = start_broker(Duration::from_millis(300)).await;
    let client = Arc::new(Client::new(conf(port, "2000")).unwrap());
    client.connect(Duration::from_secs(5)).await.unwrap();

    let publisher = client.clone();
    let first = tokio::spawn(async move { publisher.publish("a/b", "first").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closer = client.clone();
    let shutdown = tokio::spawn(async move { closer.shutdown().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let late = client.publish("a/b", "late").await;
    assert!(matches!(
        late,
        Err(ClientError::Transport(MqttError::Disconnecting))
    ));

    assert!(first.await.unwrap().is_ok());
    shutdown.await.unwrap().unwrap();
}
