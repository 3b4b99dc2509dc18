//! Application State
//!
//! Shared state accessible by all handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::IdentityResolver;
use crate::config::Config;
use crate::store::MetricsSource;
use crate::websocket::{Hub, OriginPolicy};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Connection hub; every handler holds a clone of the same handle
    pub hub: Hub,
    /// Full service configuration
    pub config: Arc<Config>,
    /// Origin allow-list for upgrade requests
    pub origin_policy: OriginPolicy,
    /// Resolves callers from request credentials
    pub identity: Arc<dyn IdentityResolver>,
    /// Backs the metrics stream producers
    pub metrics: Arc<dyn MetricsSource>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Spawn the hub and build the state from configuration
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: Config,
        identity: Arc<dyn IdentityResolver>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        let hub = Hub::spawn(config.websocket.hub_config());
        Self::with_hub(hub, config, identity, metrics)
    }

    /// Build the state around an existing hub
    pub fn with_hub(
        hub: Hub,
        config: Config,
        identity: Arc<dyn IdentityResolver>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        let origin_policy = config.websocket.origin_policy();
        Self {
            hub,
            config: Arc::new(config),
            origin_policy,
            identity,
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
