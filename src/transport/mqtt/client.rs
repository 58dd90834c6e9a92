//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc client and its event loop task. The event
//! loop drives the connection state, dispatches inbound messages to the
//! subscription handlers, and resolves publish/subscribe calls once the broker
//! acknowledged them.

use super::connection::{
    configure_mqtt_options, network_timeout_secs, ConnectionEvent, ConnectionParameters,
    ConnectionState, MqttError,
};
use super::message_handler::{topic_matches, EventRoute, EventRouter, InboundMessage, MessageHandler};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between `AsyncClient` and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

type PublishAck = oneshot::Sender<Result<(), String>>;
type SubscribeAck = oneshot::Sender<bool>;

/// Requests waiting for the broker, in request-channel order until their
/// packet id is known
#[derive(Default)]
struct PendingAcks {
    queued_publishes: VecDeque<(QoS, PublishAck)>,
    inflight_publishes: HashMap<u16, PublishAck>,
    queued_subscribes: VecDeque<SubscribeAck>,
    inflight_subscribes: HashMap<u16, SubscribeAck>,
}

impl PendingAcks {
    fn is_empty(&self) -> bool {
        self.queued_publishes.is_empty()
            && self.inflight_publishes.is_empty()
            && self.queued_subscribes.is_empty()
            && self.inflight_subscribes.is_empty()
    }
}

/// State shared between the transport handle and its event loop task
struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    pending: Mutex<PendingAcks>,
    subscriptions: RwLock<Vec<(String, MessageHandler)>>,
    /// Set once a disconnect started; new requests are refused
    closing: AtomicBool,
    /// Woken whenever pending acks may have been resolved
    settled: Notify,
}

impl Shared {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Unconnected);
        Self {
            state_tx,
            pending: Mutex::new(PendingAcks::default()),
            subscriptions: RwLock::new(Vec::new()),
            closing: AtomicBool::new(false),
            settled: Notify::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn transition(&self, event: ConnectionEvent) {
        self.state_tx.send_modify(|state| {
            let next = state.on(event);
            if *state != next {
                debug!(target: "mqtt_transport", from = %state, to = %next, "Connection state change");
                *state = next;
            }
        });
    }

    fn ensure_connected(&self) -> Result<(), MqttError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(MqttError::Disconnecting);
        }
        let state = self.state();
        if state.is_connected() {
            Ok(())
        } else {
            Err(MqttError::NotConnected { state })
        }
    }

    /// Queue a publish acknowledgement; the state check happens under the
    /// pending lock so a closing event loop cannot miss it
    async fn enqueue_publish(&self, qos: QoS, ack: PublishAck) -> Result<(), MqttError> {
        let mut pending = self.pending.lock().await;
        self.ensure_connected()?;
        pending.queued_publishes.push_back((qos, ack));
        Ok(())
    }

    async fn enqueue_subscribe(&self, ack: SubscribeAck) -> Result<(), MqttError> {
        let mut pending = self.pending.lock().await;
        self.ensure_connected()?;
        pending.queued_subscribes.push_back(ack);
        Ok(())
    }

    async fn dispatch(&self, message: InboundMessage) {
        let subscriptions = self.subscriptions.read().await;
        let mut delivered = false;
        for (filter, handler) in subscriptions.iter() {
            if topic_matches(filter, &message.topic) {
                handler(message.clone());
                delivered = true;
            }
        }
        if !delivered {
            debug!(target: "mqtt_transport", "No handler for message on topic: {}", message.topic);
        }
    }

    /// Resolves once nothing waits for the broker any more
    async fn drained(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Apply a routed event; returns false once the connection is over
    async fn handle_route(&self, route: EventRoute) -> bool {
        let keep_running = self.apply_route(route).await;
        self.settled.notify_waiters();
        keep_running
    }

    async fn apply_route(&self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                info!("MQTT connection acknowledged by broker");
                self.transition(ConnectionEvent::ConnAckReceived);
                true
            }
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", message.topic);
                self.dispatch(message).await;
                true
            }
            EventRoute::PublishSent(pkid) => {
                let mut pending = self.pending.lock().await;
                match pending.queued_publishes.pop_front() {
                    Some((QoS::AtMostOnce, ack)) => {
                        let _ = ack.send(Ok(()));
                    }
                    Some((_, ack)) => {
                        pending.inflight_publishes.insert(pkid, ack);
                    }
                    None => {
                        debug!(target: "mqtt_transport", "Untracked outgoing publish {}", pkid);
                    }
                }
                true
            }
            EventRoute::PublishAcknowledged(pkid) | EventRoute::PublishCompleted(pkid) => {
                if let Some(ack) = self.pending.lock().await.inflight_publishes.remove(&pkid) {
                    let _ = ack.send(Ok(()));
                }
                true
            }
            EventRoute::SubscribeSent(pkid) => {
                let mut pending = self.pending.lock().await;
                if let Some(ack) = pending.queued_subscribes.pop_front() {
                    pending.inflight_subscribes.insert(pkid, ack);
                }
                true
            }
            EventRoute::SubscriptionAcknowledged {
                packet_id,
                accepted,
            } => {
                if let Some(ack) = self.pending.lock().await.inflight_subscribes.remove(&packet_id) {
                    let _ = ack.send(accepted);
                }
                true
            }
            EventRoute::DisconnectedByBroker => {
                warn!("MQTT broker disconnected client");
                self.transition(ConnectionEvent::Closed("broker disconnected".to_string()));
                false
            }
            EventRoute::DisconnectSent => {
                info!("MQTT disconnect sent");
                self.transition(ConnectionEvent::Closed("client disconnected".to_string()));
                false
            }
            EventRoute::Infrastructure => true,
        }
    }

    /// Fail everything still waiting for the broker
    async fn fail_pending(&self, reason: &str) {
        let mut guard = self.pending.lock().await;
        let pending = &mut *guard;
        let publishes = pending
            .queued_publishes
            .drain(..)
            .map(|(_, ack)| ack)
            .chain(pending.inflight_publishes.drain().map(|(_, ack)| ack))
            .collect::<Vec<_>>();
        for ack in publishes {
            let _ = ack.send(Err(reason.to_string()));
        }
        // Dropping the senders reports the subscribe as failed
        pending.queued_subscribes.clear();
        pending.inflight_subscribes.clear();
        drop(guard);
        self.settled.notify_waiters();
    }
}

/// rumqttc-backed broker transport
///
/// No reconnection is attempted: once the connection is lost the transport
/// stays disconnected.
pub struct MqttTransport {
    params: ConnectionParameters,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    request_gate: Mutex<()>,
    shared: Arc<Shared>,
}

impl MqttTransport {
    pub fn new(params: ConnectionParameters) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(&params)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            params,
            client,
            event_loop: Mutex::new(Some(event_loop)),
            event_loop_handle: Mutex::new(None),
            shutdown_tx,
            request_gate: Mutex::new(()),
            shared: Arc::new(Shared::new()),
        })
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Wait until the state settles on connected or disconnected
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
    ) -> Result<(), MqttError> {
        loop {
            match &*state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected(reason) => {
                    return Err(MqttError::ConnectionFailedStr(reason.clone()));
                }
                ConnectionState::Unconnected | ConnectionState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(MqttError::ConnectionFailedStr(
                    "State channel closed".to_string(),
                ));
            }
        }
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        shared: Arc<Shared>,
        mut shutdown_rx: watch::Receiver<bool>,
        client_id: String,
    ) {
        // A shutdown sent before this task subscribed is already marked as seen
        if *shutdown_rx.borrow_and_update() {
            info!("Shutdown requested before the event loop started for client: {}", client_id);
            shared.transition(ConnectionEvent::Closed("shutdown".to_string()));
            return;
        }

        info!("Starting MQTT event loop for client: {}", client_id);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping event loop");
                        shared.transition(ConnectionEvent::Closed("shutdown".to_string()));
                        break;
                    }
                }
                event = event_loop.poll() => {
                    match event {
                        Ok(event) => {
                            let route = EventRouter::route_mqtt_event(&event);
                            if !shared.handle_route(route).await {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("MQTT event loop error for client {}: {}", client_id, e);
                            let event = if matches!(shared.state(), ConnectionState::Connecting) {
                                ConnectionEvent::ConnectFailed(e.to_string())
                            } else {
                                ConnectionEvent::Closed(e.to_string())
                            };
                            shared.transition(event);
                            break;
                        }
                    }
                }
            }
        }

        shared.fail_pending("connection closed").await;
        info!("MQTT event loop stopped for client: {}", client_id);
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut event_loop = self
            .event_loop
            .lock()
            .await
            .take()
            .ok_or(MqttError::AlreadyStarted)?;

        let mut network = event_loop.network_options();
        network.set_connection_timeout(network_timeout_secs(timeout));
        event_loop.set_network_options(network);

        let state_rx = self.shared.state_tx.subscribe();
        self.shared.transition(ConnectionEvent::ConnectStarted);

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            self.shared.clone(),
            self.shutdown_tx.subscribe(),
            self.params.client_id.clone(),
        ));
        *self.event_loop_handle.lock().await = Some(handle);

        Self::wait_for_connection_confirmation(state_rx).await
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), MqttError> {
        let (ack_tx, ack_rx) = oneshot::channel();

        {
            // Requests must reach the event loop in the order their acks were queued
            let _gate = self.request_gate.lock().await;
            self.shared.enqueue_publish(qos, ack_tx).await?;
            if let Err(e) = self.client.publish_bytes(topic, qos, retain, payload).await {
                self.shared.pending.lock().await.queued_publishes.pop_back();
                self.shared.settled.notify_waiters();
                debug!("MQ client failed to publish message to topic {}: {}", topic, e);
                return Err(MqttError::PublishFailed {
                    topic: topic.to_string(),
                    source: Box::new(e),
                });
            }
        }

        match ack_rx.await {
            Ok(Ok(())) => {
                debug!("Published message to topic {}", topic);
                Ok(())
            }
            Ok(Err(reason)) => Err(MqttError::PublishFailed {
                topic: topic.to_string(),
                source: reason.into(),
            }),
            Err(_) => Err(MqttError::PublishFailed {
                topic: topic.to_string(),
                source: "acknowledgement dropped".into(),
            }),
        }
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), MqttError> {
        let (ack_tx, ack_rx) = oneshot::channel();

        // Registered up front so retained messages right after the SubAck are delivered
        self.shared
            .subscriptions
            .write()
            .await
            .push((filter.to_string(), handler.clone()));

        let sent = {
            let _gate = self.request_gate.lock().await;
            match self.shared.enqueue_subscribe(ack_tx).await {
                Ok(()) => match self.client.subscribe(filter, qos).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.shared.pending.lock().await.queued_subscribes.pop_back();
                        self.shared.settled.notify_waiters();
                        Err(MqttError::SubscriptionFailed {
                            topic: filter.to_string(),
                            source: Box::new(e),
                        })
                    }
                },
                Err(e) => Err(e),
            }
        };

        let result = match sent {
            Ok(()) => match ack_rx.await {
                Ok(true) => Ok(()),
                Ok(false) => Err(MqttError::SubscriptionRejected(filter.to_string())),
                Err(_) => Err(MqttError::SubscriptionFailed {
                    topic: filter.to_string(),
                    source: "connection closed before SubAck".into(),
                }),
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => debug!("Subscribed to topic {}", filter),
            Err(e) => {
                debug!("Failed to subscribe topic {}: {}", filter, e);
                self.shared
                    .subscriptions
                    .write()
                    .await
                    .retain(|(_, registered)| !Arc::ptr_eq(registered, &handler));
            }
        }
        result
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), MqttError> {
        let Some(mut handle) = self.event_loop_handle.lock().await.take() else {
            self.shared
                .transition(ConnectionEvent::Closed("client disconnected".to_string()));
            return Ok(());
        };

        let deadline = Instant::now() + grace;
        let mut result = Ok(());
        if self.shared.state().is_connected() {
            self.shared.closing.store(true, Ordering::SeqCst);

            // Outstanding acks get until the deadline before DISCONNECT goes out
            if tokio::time::timeout_at(deadline, self.shared.drained())
                .await
                .is_err()
            {
                warn!(
                    "MQTT operations still awaiting the broker after {:?}, disconnecting anyway",
                    grace
                );
            }

            if self.shared.state().is_connected() {
                if let Err(e) = self.client.disconnect().await {
                    warn!("Failed to queue MQTT disconnect: {}", e);
                    result = Err(MqttError::DisconnectFailed(Box::new(e)));
                }
            }
        }

        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => info!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    "Event loop task didn't finish within {:?}, forcing shutdown",
                    grace
                );
                let _ = self.shutdown_tx.send_replace(true);
                handle.abort();
                self.shared.fail_pending("client disconnected").await;
            }
        }

        self.shared
            .transition(ConnectionEvent::Closed("client disconnected".to_string()));
        result
    }

    fn abort_connect(&self) {
        let _ = self.shutdown_tx.send_replace(true);
        if let Ok(mut guard) = self.event_loop_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.shared
            .transition(ConnectionEvent::ConnectFailed("connect aborted".to_string()));
    }

    fn is_connected(&self) -> bool {
        self.shared.state().is_connected()
    }

    fn options(&self) -> &ConnectionParameters {
        &self.params
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.event_loop_handle.get_mut().take() {
            handle.abort();
        }
    }
}
