//! Periodic producers
//!
//! A producer is bound to one connection and writes straight into its
//! outbound queue, bypassing fan-out. It stops as soon as the connection
//! is torn down or its queue fills up.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::connection::{DeliveryError, OutboundSender};
use super::hub::HubStats;
use super::messages::Envelope;
use crate::store::MetricsSource;

/// Why a producer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerExit {
    /// The connection was torn down
    Cancelled,
    /// The connection stopped draining its queue
    QueueFull,
}

/// Publishes session counters to a single metrics-stream connection
pub struct MetricsProducer {
    source: Arc<dyn MetricsSource>,
    interval: Duration,
}

impl MetricsProducer {
    pub fn new(source: Arc<dyn MetricsSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Run on a background task until the connection goes away
    pub fn spawn(
        self,
        connection_id: String,
        sender: OutboundSender,
        stats: Arc<HubStats>,
    ) -> JoinHandle<ProducerExit> {
        tokio::spawn(async move {
            let exit = self.run(&connection_id, sender).await;
            stats.inc_producers_stopped();
            tracing::debug!(connection_id = %connection_id, reason = ?exit, "Metrics producer stopped");
            exit
        })
    }

    async fn run(&self, connection_id: &str, sender: OutboundSender) -> ProducerExit {
        let mut ticker = tokio::time::interval(self.interval);

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = sender.closed() => return ProducerExit::Cancelled,
                _ = ticker.tick() => {}
            }

            let counts = match self.source.session_counts().await {
                Ok(counts) => counts,
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Metrics query failed");
                    continue;
                }
            };

            let envelope = Envelope::metrics("metrics.sessions", counts.to_payload());
            let frame = match envelope.to_json() {
                Ok(json) => json.into(),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize metrics envelope");
                    continue;
                }
            };

            match sender.try_send(frame) {
                Ok(()) => {}
                Err(DeliveryError::Closed) => return ProducerExit::Cancelled,
                Err(DeliveryError::Full) => {
                    tracing::warn!(connection_id = %connection_id, "Metrics consumer not keeping up");
                    return ProducerExit::QueueFull;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SessionCounts, StoreError};
    use crate::websocket::connection::{ClientConnection, StreamKind};
    use crate::websocket::filter::SubscriptionFilter;
    use async_trait::async_trait;
    use serde_json::Value;

    struct FixedSource;

    #[async_trait]
    impl MetricsSource for FixedSource {
        async fn session_counts(&self) -> Result<SessionCounts, StoreError> {
            Ok(SessionCounts {
                total: 5,
                running: 3,
                hibernated: 1,
            })
        }
    }

    fn producer() -> MetricsProducer {
        MetricsProducer::new(Arc::new(FixedSource), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_metrics_snapshot() {
        let (conn, mut queue) =
            ClientConnection::new("admin", StreamKind::Metrics, SubscriptionFilter::default(), 8);
        let stats = Arc::new(HubStats::default());
        let handle = producer().spawn(conn.id.clone(), conn.sender(), Arc::clone(&stats));

        let frame = queue.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "metrics");
        assert_eq!(value["event"], "metrics.sessions");
        assert_eq!(value["data"]["total"], 5);
        assert_eq!(value["data"]["running"], 3);
        assert_eq!(value["data"]["hibernated"], 1);

        conn.close();
        assert_eq!(handle.await.unwrap(), ProducerExit::Cancelled);
        assert_eq!(stats.snapshot().producers_stopped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_queue_full() {
        let (conn, _queue) =
            ClientConnection::new("admin", StreamKind::Metrics, SubscriptionFilter::default(), 2);
        let handle = producer().spawn(conn.id.clone(), conn.sender(), Arc::new(HubStats::default()));

        assert_eq!(handle.await.unwrap(), ProducerExit::QueueFull);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_enqueues_after_teardown() {
        let (conn, mut queue) =
            ClientConnection::new("admin", StreamKind::Metrics, SubscriptionFilter::default(), 8);
        conn.close();
        let handle = producer().spawn(conn.id.clone(), conn.sender(), Arc::new(HubStats::default()));
        drop(conn);

        assert_eq!(handle.await.unwrap(), ProducerExit::Cancelled);
        assert!(queue.recv().await.is_none());
    }
}
