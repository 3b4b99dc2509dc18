//! Streamhub HTTP Surface
//!
//! WebSocket upgrade endpoints plus a small operator API, built with Axum.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /ws/sessions` - Session events for the caller
//! - `GET /ws/notifications` - Notifications for the caller
//! - `GET /ws/metrics` - Platform counters (admin, operator)
//! - `GET /ws/alerts` - Platform alerts (admin, operator)
//!
//! ## Operator API
//! - `GET /api/v1/connections` - Connected-client census (`?user_id=` narrows it)
//! - `DELETE /api/v1/users/:user_id/connections` - Disconnect a user
//! - `POST /api/v1/events` - Publish an event to matching subscribers
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use streamhub::api::{serve, AppState};
//! use streamhub::auth::StaticTokenResolver;
//! use streamhub::config::Config;
//! use streamhub::store::NullMetricsSource;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (config, _) = Config::load_default()?;
//!     let identity = Arc::new(StaticTokenResolver::new(&config.auth.tokens));
//!     let state = AppState::new(config, identity, Arc::new(NullMetricsSource));
//!
//!     serve(state).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::websocket::{
    alert_updates, metrics_updates, notification_updates, session_updates, OriginPolicy,
};

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let ws_routes = Router::new()
        .route("/sessions", get(session_updates))
        .route("/notifications", get(notification_updates))
        .route("/metrics", get(metrics_updates))
        .route("/alerts", get(alert_updates));

    let api_routes = Router::new()
        .route("/connections", get(routes::events::list_connections))
        .route(
            "/users/:user_id/connections",
            delete(routes::events::disconnect_user),
        )
        .route("/events", post(routes::events::publish_event));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let cors = cors_layer(&state.origin_policy);

    // Create shared state
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/ws", ws_routes)
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state)
}

/// CORS for the operator API, using the same allow-list as the sockets
fn cors_layer(policy: &OriginPolicy) -> CorsLayer {
    let origins: Vec<HeaderValue> = policy
        .allowed_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Start the server
///
/// Runs until Ctrl-C or SIGTERM. Open sockets are closed with the hub.
pub async fn serve(state: AppState) -> Result<(), ApiError> {
    let addr = state.config.server.addr();
    let hub = state.hub.clone();
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Streamhub listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            hub.shutdown();
        })
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Streamhub shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
