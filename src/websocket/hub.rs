//! WebSocket Connection Hub
//!
//! The hub is an actor: a single task owns the connection registry and
//! processes registration, deregistration, filter updates and fan-out in
//! the order they arrive. Everything else talks to it through [`Hub`], a
//! cheap cloneable handle wrapping the actor's input channels.
//!
//! Delivery to a connection never blocks the control loop. A connection
//! whose outbound queue is full is evicted on the spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::connection::{ClientConnection, DeliveryError, OutboundFrame, StreamKind};
use super::messages::{Envelope, FilterPatch, Payload};

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the hub's inbound broadcast queue
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
        }
    }
}

/// A filter change requested by a connection's inbound pump
#[derive(Debug, Clone, PartialEq)]
pub enum FilterUpdate {
    Subscribe(FilterPatch),
    Unsubscribe(FilterPatch),
}

/// Census entry for one registered connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: String,
    pub stream: StreamKind,
    pub connected_at: DateTime<Utc>,
}

/// Backpressure and delivery counters
#[derive(Debug, Default)]
pub struct HubStats {
    active_connections: AtomicUsize,
    broadcasts_accepted: AtomicU64,
    broadcasts_dropped: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
    producers_stopped: AtomicU64,
}

/// Point-in-time copy of [`HubStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStatsSnapshot {
    pub active_connections: usize,
    pub broadcasts_accepted: u64,
    pub broadcasts_dropped: u64,
    pub deliveries: u64,
    pub evictions: u64,
    pub producers_stopped: u64,
}

impl HubStats {
    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            broadcasts_accepted: self.broadcasts_accepted.load(Ordering::Relaxed),
            broadcasts_dropped: self.broadcasts_dropped.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            producers_stopped: self.producers_stopped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc_producers_stopped(&self) {
        self.producers_stopped.fetch_add(1, Ordering::Relaxed);
    }
}

enum Command {
    Register(ClientConnection),
    Unregister(ConnectionId),
    UpdateFilter {
        id: ConnectionId,
        update: FilterUpdate,
    },
    Census {
        user_id: Option<String>,
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    DisconnectUser {
        user_id: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the hub actor
#[derive(Clone)]
pub struct Hub {
    control: mpsc::UnboundedSender<Command>,
    broadcast_tx: mpsc::Sender<Envelope>,
    stats: Arc<HubStats>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Start the hub actor on the current tokio runtime
    ///
    /// The actor stops on [`Hub::shutdown`] or once every handle has been
    /// dropped.
    pub fn spawn(config: HubConfig) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let stats = Arc::new(HubStats::default());
        let shutdown = CancellationToken::new();

        tokio::spawn(run(
            control_rx,
            broadcast_rx,
            Arc::clone(&stats),
            shutdown.clone(),
        ));

        Self {
            control,
            broadcast_tx,
            stats,
            shutdown,
        }
    }

    /// Stop the actor and close every registered connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Admit a connection into the registry
    pub fn register(&self, connection: ClientConnection) -> Result<(), HubError> {
        self.control
            .send(Command::Register(connection))
            .map_err(|_| HubError::Stopped)
    }

    /// Remove a connection and close its outbound queue
    ///
    /// Unknown or already-removed ids are ignored.
    pub fn unregister(&self, id: &str) {
        let _ = self.control.send(Command::Unregister(id.to_string()));
    }

    /// Change a connection's subscription filter
    pub fn update_filter(&self, id: &str, update: FilterUpdate) {
        let _ = self.control.send(Command::UpdateFilter {
            id: id.to_string(),
            update,
        });
    }

    /// Queue an envelope for fan-out without waiting
    ///
    /// Best-effort: when the broadcast queue is full the envelope is dropped
    /// and counted.
    pub fn broadcast(&self, envelope: Envelope) -> Result<(), HubError> {
        match self.broadcast_tx.try_send(envelope) {
            Ok(()) => {
                self.stats.broadcasts_accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.stats.broadcasts_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %envelope.event, "Broadcast queue full, dropping event");
                Err(HubError::BroadcastQueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::Stopped),
        }
    }

    /// Broadcast a session lifecycle event
    pub fn broadcast_session_event(
        &self,
        event: &str,
        resource_id: &str,
        user_id: &str,
        data: Payload,
    ) -> Result<(), HubError> {
        self.broadcast(Envelope::session(event, resource_id, user_id, data))
    }

    /// Broadcast a notification event to its owner
    pub fn broadcast_notification_event(
        &self,
        event: &str,
        user_id: &str,
        data: Payload,
    ) -> Result<(), HubError> {
        self.broadcast(Envelope::notification(event, user_id, data))
    }

    /// Broadcast a platform alert
    pub fn broadcast_alert_event(&self, event: &str, data: Payload) -> Result<(), HubError> {
        self.broadcast(Envelope::alert(event, data))
    }

    /// Convenience for producers holding a JSON value rather than a map
    pub fn broadcast_value(&self, kind: &str, event: &str, data: Value) -> Result<(), HubError> {
        let payload = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Payload::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.broadcast(Envelope::new(kind, event).data(payload))
    }

    /// List registered connections
    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, HubError> {
        self.census(None).await
    }

    /// List the registered connections of one user
    pub async fn connections_for_user(&self, user_id: &str) -> Result<Vec<ConnectionInfo>, HubError> {
        self.census(Some(user_id.to_string())).await
    }

    async fn census(&self, user_id: Option<String>) -> Result<Vec<ConnectionInfo>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Command::Census { user_id, reply })
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Tear down every connection of a user, returning how many were closed
    pub async fn disconnect_user(&self, user_id: &str) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Command::DisconnectUser {
                user_id: user_id.to_string(),
                reply,
            })
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.stats.active_connections.load(Ordering::Relaxed)
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<HubStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the actor is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.control.is_closed()
    }
}

/// The control loop. Registration, deregistration and filter changes take
/// priority over fan-out so that a broadcast queued after a subscribe sees
/// the new filter.
async fn run(
    mut control_rx: mpsc::UnboundedReceiver<Command>,
    mut broadcast_rx: mpsc::Receiver<Envelope>,
    stats: Arc<HubStats>,
    shutdown: CancellationToken,
) {
    let mut registry = Registry::new(stats);
    tracing::debug!("Hub control loop started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = control_rx.recv() => match command {
                Some(command) => registry.handle(command),
                None => break,
            },
            Some(envelope) = broadcast_rx.recv() => {
                registry.fan_out(&envelope);
            }
        }
    }

    registry.close_all();
    tracing::debug!("Hub control loop stopped");
}

/// Connection registry, owned by the control loop
struct Registry {
    connections: HashMap<ConnectionId, ClientConnection>,
    stats: Arc<HubStats>,
}

impl Registry {
    fn new(stats: Arc<HubStats>) -> Self {
        Self {
            connections: HashMap::new(),
            stats,
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(connection) => self.register(connection),
            Command::Unregister(id) => {
                self.unregister(&id);
            }
            Command::UpdateFilter { id, update } => self.update_filter(&id, update),
            Command::Census { user_id, reply } => {
                let _ = reply.send(self.census(user_id.as_deref()));
            }
            Command::DisconnectUser { user_id, reply } => {
                let _ = reply.send(self.disconnect_user(&user_id));
            }
        }
    }

    fn register(&mut self, connection: ClientConnection) {
        tracing::info!(
            connection_id = %connection.id,
            user_id = %connection.user_id,
            stream = connection.stream.as_str(),
            "WebSocket connected"
        );
        if let Some(previous) = self.connections.insert(connection.id.clone(), connection) {
            tracing::warn!(connection_id = %previous.id, "Duplicate connection id replaced");
            previous.close();
        }
        self.publish_count();
    }

    fn unregister(&mut self, id: &str) -> bool {
        match self.connections.remove(id) {
            Some(connection) => {
                connection.close();
                self.publish_count();
                tracing::info!(connection_id = %id, "WebSocket disconnected");
                true
            }
            None => false,
        }
    }

    fn update_filter(&mut self, id: &str, update: FilterUpdate) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        match update {
            FilterUpdate::Subscribe(patch) => connection.filter.apply_subscribe(patch),
            FilterUpdate::Unsubscribe(patch) => connection.filter.apply_unsubscribe(&patch),
        }
        tracing::debug!(
            connection_id = %id,
            filter = ?connection.filter,
            "Subscription filter updated"
        );
    }

    /// Deliver to every matching connection, evicting the ones that cannot
    /// keep up. Returns the number of deliveries.
    fn fan_out(&mut self, envelope: &Envelope) -> usize {
        let mut frame: Option<OutboundFrame> = None;
        let mut evicted = Vec::new();
        let mut stale = Vec::new();
        let mut delivered = 0;

        for (id, connection) in &self.connections {
            if !connection.filter.matches(envelope) {
                continue;
            }

            let payload = match &frame {
                Some(frame) => Arc::clone(frame),
                None => match envelope.to_json() {
                    Ok(json) => {
                        let encoded: OutboundFrame = json.into();
                        frame = Some(Arc::clone(&encoded));
                        encoded
                    }
                    Err(e) => {
                        tracing::error!(error = %e, event = %envelope.event, "Failed to serialize envelope");
                        return 0;
                    }
                },
            };

            match connection.try_deliver(payload) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Full) => {
                    tracing::warn!(connection_id = %id, "Outbound queue full, evicting slow consumer");
                    evicted.push(id.clone());
                }
                Err(DeliveryError::Closed) => stale.push(id.clone()),
            }
        }

        for id in &evicted {
            if self.unregister(id) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        for id in &stale {
            self.unregister(id);
        }

        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if delivered > 0 {
            tracing::trace!(event = %envelope.event, subscribers = delivered, "Broadcast event");
        }
        delivered
    }

    fn census(&self, user_id: Option<&str>) -> Vec<ConnectionInfo> {
        self.connections
            .values()
            .filter(|connection| user_id.map_or(true, |user| connection.user_id == user))
            .map(ClientConnection::info)
            .collect()
    }

    fn disconnect_user(&mut self, user_id: &str) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| connection.user_id == user_id)
            .map(|connection| connection.id.clone())
            .collect();

        for id in &ids {
            self.unregister(id);
        }
        if !ids.is_empty() {
            tracing::info!(user_id = %user_id, closed = ids.len(), "Disconnected user");
        }
        ids.len()
    }

    fn close_all(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.close();
        }
        self.publish_count();
    }

    fn publish_count(&self) {
        self.stats
            .active_connections
            .store(self.connections.len(), Ordering::Relaxed);
    }
}

/// Errors that can occur in the connection hub
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub is not running")]
    Stopped,

    #[error("Broadcast queue is full")]
    BroadcastQueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::OutboundQueue;
    use crate::websocket::filter::SubscriptionFilter;
    use std::time::Duration;
    use tokio::time::timeout;

    fn connection(
        user: &str,
        filter: SubscriptionFilter,
        capacity: usize,
    ) -> (ClientConnection, OutboundQueue) {
        ClientConnection::new(user, StreamKind::Sessions, filter, capacity)
    }

    async fn recv_event(queue: &mut OutboundQueue) -> Option<String> {
        let frame = timeout(Duration::from_millis(500), queue.recv()).await.ok()??;
        let value: Value = serde_json::from_str(&frame).unwrap();
        Some(value["event"].as_str().unwrap().to_string())
    }

    fn assert_empty(queue: &mut OutboundQueue) {
        assert!(queue.try_recv().is_none());
    }

    /// Round-trip through the control loop so earlier commands are applied.
    async fn settle(hub: &Hub) {
        hub.connections().await.unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, mut queue) = connection("u1", SubscriptionFilter::unconstrained(), 8);
        let id = conn.id.clone();

        hub.register(conn).unwrap();
        let census = hub.connections().await.unwrap();
        assert_eq!(census.len(), 1);
        assert_eq!(census[0].id, id);
        assert_eq!(census[0].user_id, "u1");
        assert_eq!(hub.connection_count(), 1);

        hub.unregister(&id);
        settle(&hub).await;
        assert_eq!(hub.connection_count(), 0);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, _queue) = connection("u1", SubscriptionFilter::unconstrained(), 8);
        let (other, mut other_queue) = connection("u2", SubscriptionFilter::unconstrained(), 8);
        let id = conn.id.clone();

        hub.register(conn).unwrap();
        hub.register(other).unwrap();
        hub.unregister(&id);
        hub.unregister(&id);
        hub.unregister("ws_unknown");
        settle(&hub).await;

        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.stats().snapshot().evictions, 0);

        hub.broadcast(Envelope::new("session", "session.created")).unwrap();
        assert_eq!(recv_event(&mut other_queue).await.as_deref(), Some("session.created"));
    }

    #[tokio::test]
    async fn test_fan_out_respects_filters() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut qa) = connection(
            "u1",
            SubscriptionFilter::unconstrained()
                .with_event_types(["session.created"])
                .for_user("u1"),
            8,
        );
        let (b, mut qb) = connection("u2", SubscriptionFilter::unconstrained(), 8);
        hub.register(a).unwrap();
        hub.register(b).unwrap();

        hub.broadcast(Envelope::new("session", "session.created").user("u1"))
            .unwrap();
        hub.broadcast(Envelope::new("session", "session.created").user("u2"))
            .unwrap();
        hub.broadcast(Envelope::new("session", "session.deleted").user("u1"))
            .unwrap();
        settle(&hub).await;

        assert_eq!(recv_event(&mut qa).await.as_deref(), Some("session.created"));
        assert_empty(&mut qa);

        assert_eq!(recv_event(&mut qb).await.as_deref(), Some("session.created"));
        assert_eq!(recv_event(&mut qb).await.as_deref(), Some("session.created"));
        assert_eq!(recv_event(&mut qb).await.as_deref(), Some("session.deleted"));
        assert_empty(&mut qb);
    }

    #[tokio::test]
    async fn test_delivery_order_is_preserved() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, mut queue) = connection("u1", SubscriptionFilter::unconstrained(), 64);
        hub.register(conn).unwrap();

        for i in 0..20 {
            hub.broadcast(Envelope::new("session", format!("event.{}", i)))
                .unwrap();
        }

        for i in 0..20 {
            assert_eq!(recv_event(&mut queue).await, Some(format!("event.{}", i)));
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let hub = Hub::spawn(HubConfig::default());
        let (slow, mut slow_queue) = connection("slow", SubscriptionFilter::unconstrained(), 2);
        let (fast, mut fast_queue) = connection("fast", SubscriptionFilter::unconstrained(), 64);
        let slow_id = slow.id.clone();
        hub.register(slow).unwrap();
        hub.register(fast).unwrap();

        for i in 0..5 {
            hub.broadcast(Envelope::new("session", format!("event.{}", i)))
                .unwrap();
            assert_eq!(recv_event(&mut fast_queue).await, Some(format!("event.{}", i)));
        }

        let census = hub.connections().await.unwrap();
        assert_eq!(census.len(), 1);
        assert_ne!(census[0].id, slow_id);
        assert_eq!(hub.stats().snapshot().evictions, 1);

        // The two frames that fit are still drained before the queue reports closed.
        assert!(slow_queue.recv().await.is_some());
        assert!(slow_queue.recv().await.is_some());
        assert!(slow_queue.recv().await.is_none());

        hub.broadcast(Envelope::new("session", "after")).unwrap();
        assert_eq!(recv_event(&mut fast_queue).await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_filter_update_through_control_loop() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, mut queue) = connection("u1", SubscriptionFilter::unconstrained(), 16);
        let id = conn.id.clone();
        hub.register(conn).unwrap();

        hub.update_filter(
            &id,
            FilterUpdate::Subscribe(FilterPatch::events(["alert.triggered"])),
        );
        hub.broadcast(Envelope::alert("alert.resolved", Payload::new()))
            .unwrap();
        hub.broadcast(Envelope::alert("alert.triggered", Payload::new()))
            .unwrap();
        assert_eq!(recv_event(&mut queue).await.as_deref(), Some("alert.triggered"));

        hub.update_filter(
            &id,
            FilterUpdate::Unsubscribe(FilterPatch::events(["alert.triggered"])),
        );
        hub.broadcast(Envelope::alert("alert.resolved", Payload::new()))
            .unwrap();
        assert_eq!(recv_event(&mut queue).await.as_deref(), Some("alert.resolved"));
    }

    #[tokio::test]
    async fn test_full_broadcast_queue_drops() {
        let (control, _control_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _broadcast_rx) = mpsc::channel(1);
        let hub = Hub {
            control,
            broadcast_tx,
            stats: Arc::new(HubStats::default()),
            shutdown: CancellationToken::new(),
        };

        assert!(hub.broadcast(Envelope::new("session", "a")).is_ok());
        assert_eq!(
            hub.broadcast(Envelope::new("session", "b")),
            Err(HubError::BroadcastQueueFull)
        );

        let stats = hub.stats().snapshot();
        assert_eq!(stats.broadcasts_accepted, 1);
        assert_eq!(stats.broadcasts_dropped, 1);
    }

    #[tokio::test]
    async fn test_typed_broadcast_helpers() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, mut queue) = connection("u1", SubscriptionFilter::unconstrained(), 16);
        hub.register(conn).unwrap();

        hub.broadcast_session_event("session.created", "s1", "u1", Payload::new())
            .unwrap();
        hub.broadcast_notification_event("notification.new", "u1", Payload::new())
            .unwrap();
        hub.broadcast_alert_event("alert.triggered", Payload::new())
            .unwrap();
        hub.broadcast_value("metrics", "metrics.users", serde_json::json!(3))
            .unwrap();

        let frame = timeout(Duration::from_millis(500), queue.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "session");
        assert_eq!(value["resourceId"], "s1");

        assert_eq!(recv_event(&mut queue).await.as_deref(), Some("notification.new"));
        assert_eq!(recv_event(&mut queue).await.as_deref(), Some("alert.triggered"));

        let frame = timeout(Duration::from_millis(500), queue.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["data"]["value"], 3);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, queue) = connection("u1", SubscriptionFilter::unconstrained(), 8);
        hub.register(conn).unwrap();
        settle(&hub).await;
        assert!(hub.is_running());

        hub.shutdown();
        assert!(!hub.is_running());

        timeout(Duration::from_millis(500), queue.cancellation().cancelled())
            .await
            .unwrap();
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_per_user_census_and_disconnect() {
        let hub = Hub::spawn(HubConfig::default());
        let (a1, a1_queue) = connection("alice", SubscriptionFilter::unconstrained(), 8);
        let (a2, a2_queue) = connection("alice", SubscriptionFilter::unconstrained(), 8);
        let (b, mut b_queue) = connection("bob", SubscriptionFilter::unconstrained(), 8);
        hub.register(a1).unwrap();
        hub.register(a2).unwrap();
        hub.register(b).unwrap();

        let alice = hub.connections_for_user("alice").await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|info| info.user_id == "alice"));
        assert!(hub.connections_for_user("carol").await.unwrap().is_empty());

        assert_eq!(hub.disconnect_user("alice").await.unwrap(), 2);
        assert!(a1_queue.is_closed());
        assert!(a2_queue.is_closed());
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.disconnect_user("alice").await.unwrap(), 0);

        hub.broadcast(Envelope::new("session", "session.created")).unwrap();
        assert_eq!(recv_event(&mut b_queue).await.as_deref(), Some("session.created"));
        assert_empty(&mut b_queue);
    }
}
