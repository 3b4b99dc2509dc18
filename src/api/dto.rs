//! Data Transfer Objects
//!
//! Request and response types for the HTTP endpoints.

use serde::{Deserialize, Serialize};

use crate::websocket::{ConnectionInfo, Envelope, HubStatsSnapshot};

// ============================================
// HEALTH DTOs
// ============================================

/// Full health status response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" or "unhealthy"
    pub status: String,
    /// Hub actor state: "ok" or "stopped"
    pub hub: String,
    /// Registered connections
    pub connections: usize,
    /// Delivery counters
    pub stats: HubStatsSnapshot,
    /// Seconds since the server started
    pub uptime_seconds: u64,
    /// Crate version
    pub version: String,
}

// ============================================
// CONNECTION DTOs
// ============================================

/// Census filter
#[derive(Debug, Default, Deserialize)]
pub struct ConnectionsQuery {
    pub user_id: Option<String>,
}

/// Connected-client census
#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub count: usize,
    pub connections: Vec<ConnectionInfo>,
    pub stats: HubStatsSnapshot,
}

/// Result of closing a user's sockets
#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub user_id: String,
    pub disconnected: usize,
}

// ============================================
// EVENT DTOs
// ============================================

/// Event submitted for fan-out
///
/// Same shape as the wire envelope; `timestamp` is optional and defaults
/// to the time of receipt.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct PublishRequest(pub Envelope);

/// Accepted event
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    /// Always "accepted"; delivery happens asynchronously
    pub status: String,
    pub event: String,
}
