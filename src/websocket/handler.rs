//! WebSocket Handler
//!
//! Upgrade endpoints for the four event streams. Admission happens before
//! the upgrade: the origin is checked, the caller is resolved, and the
//! privileged streams require an admin or operator role. Only then is a
//! [`ClientConnection`] built, registered and handed its pumps.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;

use super::connection::{inbound_pump, outbound_pump, ClientConnection, StreamKind};
use super::filter::SubscriptionFilter;
use super::producer::MetricsProducer;
use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::Identity;

/// Event types delivered on the notification stream
pub const NOTIFICATION_EVENTS: &[&str] =
    &["notification.new", "notification.read", "notification.deleted"];

/// Event types delivered on the metrics stream
pub const METRICS_EVENTS: &[&str] = &["metrics.sessions", "metrics.resources", "metrics.users"];

/// Event types delivered on the alerts stream
pub const ALERT_EVENTS: &[&str] = &["alert.triggered", "alert.acknowledged", "alert.resolved"];

/// Credentials for clients that cannot set an Authorization header
#[derive(Debug, Default, Deserialize)]
pub struct UpgradeQuery {
    pub token: Option<String>,
}

impl StreamKind {
    /// Whether the stream needs an elevated role
    pub fn is_privileged(&self) -> bool {
        matches!(self, StreamKind::Metrics | StreamKind::Alerts)
    }

    /// Initial filter for a caller on this stream
    pub fn default_filter(&self, user_id: &str) -> SubscriptionFilter {
        match self {
            StreamKind::Sessions => SubscriptionFilter::unconstrained().for_user(user_id),
            StreamKind::Notifications => SubscriptionFilter::unconstrained()
                .for_user(user_id)
                .with_event_types(NOTIFICATION_EVENTS.iter().copied()),
            StreamKind::Metrics => {
                SubscriptionFilter::unconstrained().with_event_types(METRICS_EVENTS.iter().copied())
            }
            StreamKind::Alerts => {
                SubscriptionFilter::unconstrained().with_event_types(ALERT_EVENTS.iter().copied())
            }
        }
    }
}

/// GET /ws/sessions
pub async fn session_updates(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    Query(query): Query<UpgradeQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(StreamKind::Sessions, ws, &headers, query, state).await
}

/// GET /ws/notifications
pub async fn notification_updates(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    Query(query): Query<UpgradeQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(StreamKind::Notifications, ws, &headers, query, state).await
}

/// GET /ws/metrics
pub async fn metrics_updates(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    Query(query): Query<UpgradeQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(StreamKind::Metrics, ws, &headers, query, state).await
}

/// GET /ws/alerts
pub async fn alert_updates(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    Query(query): Query<UpgradeQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(StreamKind::Alerts, ws, &headers, query, state).await
}

/// Admit the caller, then upgrade
///
/// Admission runs before the upgrade headers are looked at, so a refused
/// caller gets 401/403 whatever else is wrong with the request.
async fn upgrade(
    stream: StreamKind,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: &HeaderMap,
    query: UpgradeQuery,
    state: Arc<AppState>,
) -> Response {
    let identity = match admit(stream, headers, &query, &state).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, stream, identity, state)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Origin check, identity resolution and the role gate
async fn admit(
    stream: StreamKind,
    headers: &HeaderMap,
    query: &UpgradeQuery,
    state: &AppState,
) -> ApiResult<Identity> {
    let origin = headers
        .get(header::ORIGIN)
        .map(|value| value.to_str().unwrap_or_default());
    if !state.origin_policy.allows(origin) {
        tracing::warn!(origin = ?origin, stream = stream.as_str(), "Rejected WebSocket origin");
        return Err(ApiError::Forbidden("Origin not allowed".to_string()));
    }

    let identity = state
        .identity
        .resolve(headers, query.token.as_deref())
        .await?;

    if stream.is_privileged() && !identity.role.is_privileged() {
        tracing::warn!(
            user_id = %identity.user_id,
            role = %identity.role,
            stream = stream.as_str(),
            "Insufficient permissions for stream"
        );
        return Err(ApiError::Forbidden("Insufficient permissions".to_string()));
    }

    Ok(identity)
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, stream: StreamKind, identity: Identity, state: Arc<AppState>) {
    let ws_config = &state.config.websocket;
    let pump_config = ws_config.pump_config();

    let (connection, queue) = ClientConnection::new(
        identity.user_id.clone(),
        stream,
        stream.default_filter(&identity.user_id),
        ws_config.outbound_capacity,
    );
    let connection_id = connection.id.clone();
    let cancel = connection.cancellation();
    let producer_sender = connection.sender();

    if let Err(e) = state.hub.register(connection) {
        tracing::error!(error = %e, "Failed to register WebSocket connection");
        return;
    }

    let (sink, reader) = socket.split();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move { outbound_pump(&writer_id, sink, queue, pump_config).await });

    if stream == StreamKind::Metrics {
        MetricsProducer::new(state.metrics.clone(), ws_config.metrics_interval()).spawn(
            connection_id.clone(),
            producer_sender,
            state.hub.stats(),
        );
    } else {
        drop(producer_sender);
    }

    let exit = inbound_pump(
        &connection_id,
        &state.hub,
        reader,
        cancel,
        pump_config.read_timeout,
    )
    .await;

    let _ = writer.await;
    tracing::debug!(connection_id = %connection_id, reason = ?exit, "Connection handler finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::messages::Envelope;

    #[test]
    fn test_default_filters() {
        let sessions = StreamKind::Sessions.default_filter("u1");
        assert_eq!(sessions.user_id.as_deref(), Some("u1"));
        assert!(sessions.event_types.is_empty());

        let notifications = StreamKind::Notifications.default_filter("u1");
        assert!(notifications.matches(&Envelope::new("notification", "notification.new").user("u1")));
        assert!(!notifications.matches(&Envelope::new("notification", "notification.new").user("u2")));
        assert!(!notifications.matches(&Envelope::new("session", "session.created").user("u1")));

        let metrics = StreamKind::Metrics.default_filter("admin");
        assert!(metrics.user_id.is_none());
        assert!(metrics.matches(&Envelope::new("metrics", "metrics.users")));

        let alerts = StreamKind::Alerts.default_filter("admin");
        assert!(alerts.matches(&Envelope::new("alert", "alert.acknowledged")));
        assert!(!alerts.matches(&Envelope::new("metrics", "metrics.users")));
    }

    #[test]
    fn test_privileged_streams() {
        assert!(!StreamKind::Sessions.is_privileged());
        assert!(!StreamKind::Notifications.is_privileged());
        assert!(StreamKind::Metrics.is_privileged());
        assert!(StreamKind::Alerts.is_privileged());
    }
}
