//! Pure message routing for MQTT events
//!
//! This module turns rumqttc events into routing decisions, defines the
//! inbound message handed to subscription handlers, and matches topics against
//! subscription filters.

use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::sync::Arc;

/// Message delivered to a subscription handler
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
}

impl InboundMessage {
    /// Payload as UTF-8, lossily
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Per-message callback registered by `subscribe`
///
/// Invoked from the transport's event loop task for every matching message;
/// it should hand heavy work off instead of blocking.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// Outgoing publish written to the socket (packet id 0 for QoS 0)
    PublishSent(u16),
    /// QoS 1 publish acknowledged
    PublishAcknowledged(u16),
    /// QoS 2 publish completed
    PublishCompleted(u16),
    /// Outgoing subscribe written to the socket
    SubscribeSent(u16),
    /// Subscription acknowledged; `accepted` is false if any filter was refused
    SubscriptionAcknowledged { packet_id: u16, accepted: bool },
    /// Broker sent DISCONNECT
    DisconnectedByBroker,
    /// Our DISCONNECT went out
    DisconnectSent,
    /// Keep-alive and other protocol housekeeping
    Infrastructure,
}

/// Pure routing of rumqttc events
pub struct EventRouter;

impl EventRouter {
    /// Route an MQTT event to the transport's handling (pure function)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                    duplicate: publish.dup,
                }),
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged(ack.pkid),
                Packet::PubComp(comp) => EventRoute::PublishCompleted(comp.pkid),
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    accepted: Self::subscription_accepted(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::DisconnectedByBroker,
                _ => EventRoute::Infrastructure,
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::PublishSent(*pkid),
                Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent(*pkid),
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::Infrastructure,
            },
        }
    }

    /// True when every filter in a SubAck was granted (pure function)
    pub fn subscription_accepted(return_codes: &[SubscribeReasonCode]) -> bool {
        return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    }
}

/// Whether `topic` matches subscription `filter` (pure function)
///
/// `+` matches exactly one level, `#` matches the remaining levels including
/// the parent level. Topics starting with `$` never match a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, SubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            EventRouter::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_publish() {
        let mut publish = Publish::new("jobs/42/events", QoS::AtLeastOnce, "done");
        publish.retain = true;
        let event = Event::Incoming(Packet::Publish(publish));

        match EventRouter::route_mqtt_event(&event) {
            EventRoute::MessageReceived(msg) => {
                assert_eq!(msg.topic, "jobs/42/events");
                assert_eq!(msg.payload_str(), "done");
                assert_eq!(msg.qos, QoS::AtLeastOnce);
                assert!(msg.retain);
                assert!(!msg.duplicate);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_route_acks() {
        let puback = Event::Incoming(Packet::PubAck(PubAck::new(7)));
        assert_eq!(
            EventRouter::route_mqtt_event(&puback),
            EventRoute::PublishAcknowledged(7)
        );

        let suback = Event::Incoming(Packet::SubAck(SubAck::new(
            3,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        )));
        assert_eq!(
            EventRouter::route_mqtt_event(&suback),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 3,
                accepted: true
            }
        );

        let refused = Event::Incoming(Packet::SubAck(SubAck::new(
            4,
            vec![SubscribeReasonCode::Failure],
        )));
        assert_eq!(
            EventRouter::route_mqtt_event(&refused),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 4,
                accepted: false
            }
        );
    }

    #[test]
    fn test_route_outgoing() {
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(0))),
            EventRoute::PublishSent(0)
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(9))),
            EventRoute::SubscribeSent(9)
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::Infrastructure
        );
    }

    #[test]
    fn test_route_broker_disconnect() {
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::DisconnectedByBroker
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::Infrastructure
        );
    }

    #[test]
    fn test_subscription_accepted_empty() {
        assert!(EventRouter::subscription_accepted(&[]));
    }

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/d"));
    }

    #[test]
    fn test_topic_matches_single_level() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("+/+", "x/y"));
        assert!(topic_matches("a/+", "a/"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/c"));
    }

    #[test]
    fn test_topic_matches_multi_level() {
        assert!(topic_matches("#", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(!topic_matches("a/#", "b/c"));
        assert!(!topic_matches("a/#/c", "a/b/c"));
    }

    #[test]
    fn test_topic_matches_system_topics() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }
}
