//! Event Routes
//!
//! Operator endpoints around the hub.
//!
//! - GET /api/v1/connections - Connected-client census (`?user_id=` narrows it)
//! - DELETE /api/v1/users/:user_id/connections - Disconnect every socket of a user
//! - POST /api/v1/events - Hand an envelope to the hub for fan-out

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{
    ConnectionsQuery, ConnectionsResponse, DisconnectResponse, PublishRequest, PublishResponse,
};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::Identity;

/// GET /api/v1/connections
pub async fn list_connections(
    headers: HeaderMap,
    Query(query): Query<ConnectionsQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ConnectionsResponse>> {
    require_privileged(&state, &headers).await?;

    let connections = match query.user_id.as_deref() {
        Some(user_id) => state.hub.connections_for_user(user_id).await?,
        None => state.hub.connections().await?,
    };

    Ok(Json(ConnectionsResponse {
        count: connections.len(),
        connections,
        stats: state.hub.stats().snapshot(),
    }))
}

/// DELETE /api/v1/users/:user_id/connections
pub async fn disconnect_user(
    headers: HeaderMap,
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<DisconnectResponse>> {
    let identity = require_privileged(&state, &headers).await?;

    let disconnected = state.hub.disconnect_user(&user_id).await?;
    tracing::info!(
        operator = %identity.user_id,
        user_id = %user_id,
        disconnected,
        "User connections closed"
    );

    Ok(Json(DisconnectResponse {
        user_id,
        disconnected,
    }))
}

/// POST /api/v1/events
///
/// Returns 202 once the hub has accepted the event. Delivery is
/// asynchronous; 503 means the broadcast queue is full and the event was
/// dropped.
pub async fn publish_event(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PublishResponse>)> {
    let identity = require_privileged(&state, &headers).await?;

    let Json(PublishRequest(envelope)) =
        payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    if envelope.kind.is_empty() || envelope.event.is_empty() {
        return Err(ApiError::Validation(
            "type and event must not be empty".to_string(),
        ));
    }

    let event = envelope.event.clone();
    state.hub.broadcast(envelope)?;

    tracing::debug!(user_id = %identity.user_id, event = %event, "Event published");

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            status: "accepted".to_string(),
            event,
        }),
    ))
}

async fn require_privileged(state: &AppState, headers: &HeaderMap) -> ApiResult<Identity> {
    let identity = state.identity.resolve(headers, None).await?;
    if !identity.role.is_privileged() {
        return Err(ApiError::Forbidden("Insufficient permissions".to_string()));
    }
    Ok(identity)
}
