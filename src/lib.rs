//! # Streamhub
//!
//! Real-time event delivery for browser clients. Clients hold a WebSocket
//! open on one of four streams; producers inside the process publish
//! events to a central hub, which pushes each event to every connection
//! whose subscription filter matches it.
//!
//! ## Features
//!
//! - **Single-owner hub**: one task owns the registry; no locks on the hot path
//! - **Backpressure**: bounded queues, slow consumers are evicted, never waited on
//! - **Subscriptions**: per-connection filters on event type, user, team and resource
//! - **Liveness**: ping heartbeats, read and write deadlines
//! - **Periodic producers**: per-connection metrics snapshots
//!
//! ## Modules
//!
//! - [`websocket`]: hub, connections, filters, producers and upgrade handlers
//! - [`api`]: Axum router, health probes and operator endpoints
//! - [`auth`]: caller identity resolution
//! - [`store`]: metrics sources for the metrics stream
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use streamhub::websocket::{Hub, HubConfig, Payload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = Hub::spawn(HubConfig::default());
//!
//!     // Every connection of user u1 on /ws/sessions receives this
//!     let mut data = Payload::new();
//!     data.insert("state".into(), "running".into());
//!     hub.broadcast_session_event("session.started", "s1", "u1", data)?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use websocket::{Envelope, Hub, HubConfig, HubError};
