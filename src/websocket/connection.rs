//! Client connections and their pumps
//!
//! Each accepted socket becomes a [`ClientConnection`] (the half the hub
//! keeps in its registry) plus an [`OutboundQueue`] (the half drained by
//! the outbound pump). The two pumps are the only code that touches the
//! socket: the inbound pump owns the read half, the outbound pump owns the
//! write half.
//!
//! A per-connection [`CancellationToken`] is cancelled exactly once when
//! the connection is torn down, by whichever side notices first.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::filter::SubscriptionFilter;
use super::hub::{ConnectionId, ConnectionInfo, FilterUpdate, Hub};
use super::messages::ClientMessage;

/// A serialized envelope, shared between every queue it is delivered to
pub type OutboundFrame = Arc<str>;

/// Which upgrade endpoint a connection came through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Sessions,
    Notifications,
    Metrics,
    Alerts,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Sessions => "sessions",
            StreamKind::Notifications => "notifications",
            StreamKind::Metrics => "metrics",
            StreamKind::Alerts => "alerts",
        }
    }
}

/// Why a frame could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The consumer is not keeping up
    Full,
    /// The connection is being torn down
    Closed,
}

/// One accepted connection, as held in the hub registry
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub user_id: String,
    pub stream: StreamKind,
    pub filter: SubscriptionFilter,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Create a connection with a fresh id and an outbound queue of
    /// `capacity` frames
    pub fn new(
        user_id: impl Into<String>,
        stream: StreamKind,
        filter: SubscriptionFilter,
        capacity: usize,
    ) -> (Self, OutboundQueue) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let id = format!("ws_{}_{}", stream.as_str(), Uuid::new_v4().simple());

        let connection = Self {
            id,
            user_id: user_id.into(),
            stream,
            filter,
            connected_at: Utc::now(),
            outbound,
            cancel: cancel.clone(),
        };
        (connection, OutboundQueue { rx, cancel })
    }

    /// Attempt to queue a frame without waiting
    pub fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        self.sender().try_send(frame)
    }

    /// A sender for producers that write to this connection only
    pub fn sender(&self) -> OutboundSender {
        OutboundSender {
            tx: self.outbound.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Token cancelled when the connection is torn down
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            stream: self.stream,
            connected_at: self.connected_at,
        }
    }

    /// Signal teardown. Dropping `self` afterwards releases the hub's
    /// sender so the outbound pump sees the queue close.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Queue handle for periodic producers
///
/// Checks the connection's cancellation before every enqueue, so a
/// producer never writes to a connection that has been deregistered.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl OutboundSender {
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Resolves once the connection is torn down
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Receiving half of a connection's outbound queue
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
}

impl OutboundQueue {
    /// Next frame in FIFO order; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }

    /// Whether teardown has been signalled
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Timing for the connection pumps
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    /// Ping period; pings go out on a fixed schedule, busy or not, so the
    /// peer's pongs keep extending the read deadline
    pub heartbeat: Duration,
    /// Time without a pong before the inbound pump gives up
    pub read_timeout: Duration,
    /// Deadline for writing a single frame
    pub write_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(54),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Why the outbound pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundExit {
    /// The queue was closed by deregistration
    Closed,
    /// Writing to the peer failed or timed out
    WriteFailed,
}

/// Drain the outbound queue onto the socket
///
/// The sole writer for its connection. Frames already queued when teardown
/// is signalled are still flushed before the close frame.
pub async fn outbound_pump<S>(
    connection_id: &str,
    mut sink: S,
    mut queue: OutboundQueue,
    config: PumpConfig,
) -> OutboundExit
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let cancel = queue.cancellation();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + config.heartbeat, config.heartbeat);

    let exit = loop {
        tokio::select! {
            biased;
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if !write(connection_id, &mut sink, Message::Text(frame.to_string()), config.write_timeout).await {
                        break OutboundExit::WriteFailed;
                    }
                }
                None => break OutboundExit::Closed,
            },
            _ = cancel.cancelled() => {
                while let Some(frame) = queue.try_recv() {
                    if !write(connection_id, &mut sink, Message::Text(frame.to_string()), config.write_timeout).await {
                        break;
                    }
                }
                break OutboundExit::Closed;
            }
            _ = heartbeat.tick() => {
                if !write(connection_id, &mut sink, Message::Ping(Vec::new()), config.write_timeout).await {
                    break OutboundExit::WriteFailed;
                }
            }
        }
    };

    if exit == OutboundExit::Closed {
        let _ = tokio::time::timeout(config.write_timeout, sink.send(Message::Close(None))).await;
    }
    let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
    cancel.cancel();

    tracing::debug!(connection_id = %connection_id, reason = ?exit, "Outbound pump stopped");
    exit
}

async fn write<S>(connection_id: &str, sink: &mut S, message: Message, timeout: Duration) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(timeout, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket send failed, closing connection");
            false
        }
        Err(_) => {
            tracing::debug!(connection_id = %connection_id, "WebSocket write deadline exceeded");
            false
        }
    }
}

/// Why the inbound pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundExit {
    /// Peer sent a close frame or ended the stream
    PeerClosed,
    /// Read failed
    ReadError,
    /// No pong within the read timeout
    Timeout,
    /// Torn down from elsewhere (eviction or write failure)
    Cancelled,
}

/// Read control frames until the connection ends, then deregister
///
/// The read deadline is pushed forward whenever a pong arrives.
pub async fn inbound_pump<S, E>(
    connection_id: &str,
    hub: &Hub,
    mut stream: S,
    cancel: CancellationToken,
    read_timeout: Duration,
) -> InboundExit
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + read_timeout;

    let exit = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break InboundExit::Cancelled,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::debug!(connection_id = %connection_id, "Read deadline exceeded");
                break InboundExit::Timeout;
            }
            Ok(None) => break InboundExit::PeerClosed,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break InboundExit::ReadError;
            }
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => handle_control_frame(hub, connection_id, text.as_bytes()),
                Message::Binary(bytes) => handle_control_frame(hub, connection_id, &bytes),
                Message::Pong(_) => deadline = Instant::now() + read_timeout,
                Message::Ping(_) => {}
                Message::Close(_) => {
                    tracing::debug!(connection_id = %connection_id, "Client requested close");
                    break InboundExit::PeerClosed;
                }
            },
        }
    };

    hub.unregister(connection_id);
    cancel.cancel();
    exit
}

/// Route a parsed control frame to the hub; anything else is ignored
fn handle_control_frame(hub: &Hub, connection_id: &str, raw: &[u8]) {
    match ClientMessage::parse(raw) {
        Some(ClientMessage::Subscribe { filters }) => {
            hub.update_filter(connection_id, FilterUpdate::Subscribe(filters));
        }
        Some(ClientMessage::Unsubscribe { filters }) => {
            hub.update_filter(connection_id, FilterUpdate::Unsubscribe(filters));
        }
        Some(ClientMessage::Unknown) => {}
        None => {
            tracing::debug!(connection_id = %connection_id, "Ignoring malformed control frame");
        }
    }
}
