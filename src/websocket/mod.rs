//! WebSocket Real-Time Streaming
//!
//! Pushes platform events to browser clients over long-lived sockets.
//!
//! ## Architecture
//!
//! - **Hub**: single task that owns the connection registry and fans
//!   envelopes out to every connection whose filter matches
//! - **Connection**: bounded outbound queue plus the reader/writer pumps
//! - **Filter**: per-connection subscription predicate
//! - **Producer**: per-connection periodic publishers (metrics)
//! - **Handler**: origin and identity checks, then the upgrade
//!
//! ## Streams
//!
//! - `/ws/sessions` - session events for the caller
//! - `/ws/notifications` - notifications for the caller
//! - `/ws/metrics` - platform counters (admin, operator)
//! - `/ws/alerts` - platform alerts (admin, operator)
//!
//! ## Example
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8080/ws/sessions?token=...');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({type: 'subscribe', filters: {resourceIds: ['s1']}}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   console.log(msg.type, msg.event, msg.data);
//! };
//! ```

mod connection;
mod filter;
mod handler;
mod hub;
mod messages;
mod origin;
mod producer;

pub use connection::{
    inbound_pump, outbound_pump, ClientConnection, DeliveryError, InboundExit, OutboundExit,
    OutboundFrame, OutboundQueue, OutboundSender, PumpConfig, StreamKind,
};
pub use filter::SubscriptionFilter;
pub use handler::{
    alert_updates, metrics_updates, notification_updates, session_updates, UpgradeQuery,
    ALERT_EVENTS, METRICS_EVENTS, NOTIFICATION_EVENTS,
};
pub use hub::{
    ConnectionId, ConnectionInfo, FilterUpdate, Hub, HubConfig, HubError, HubStats,
    HubStatsSnapshot,
};
pub use messages::{ClientMessage, Envelope, FilterPatch, Payload};
pub use origin::{OriginPolicy, DEFAULT_ALLOWED_ORIGINS};
pub use producer::{MetricsProducer, ProducerExit};
