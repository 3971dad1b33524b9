//! At-least-once delivery of persisted job events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::EventSink;
use crate::cancellation::CancellationToken;
use crate::store::{JobStore, StoreResult};

/// Counters of the notifier.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    delivered: AtomicU64,
    failed: AtomicU64,
    sweeps: AtomicU64,
}

impl DeliveryMetrics {
    /// Number of events delivered.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of failed delivery attempts.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Number of completed sweeps.
    #[must_use]
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Failed attempts as a percentage of all attempts.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let delivered = self.delivered();
        let failed = self.failed();
        let total = delivered + failed;
        if total == 0 {
            0.0
        } else {
            (failed as f64 / total as f64) * 100.0
        }
    }

    /// Converts metrics to a JSON object.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "delivered": self.delivered(),
            "failed": self.failed(),
            "sweeps": self.sweeps(),
            "failure_rate_percent": (self.failure_rate() * 100.0).round() / 100.0
        })
    }
}

/// Delivers undelivered events from the store to a sink.
///
/// An event is marked delivered only after the sink accepted it, so a
/// crash between the two repeats the delivery rather than losing it.
pub struct EventNotifier {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn EventSink>,
    batch_size: usize,
    metrics: Arc<DeliveryMetrics>,
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("batch_size", &self.batch_size)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl EventNotifier {
    /// Creates a notifier.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            sink,
            batch_size: 100,
            metrics: Arc::new(DeliveryMetrics::default()),
        }
    }

    /// Sets how many events one sweep handles.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The notifier's counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Delivers one batch. Returns the number of events delivered.
    pub async fn run_once(&self) -> StoreResult<usize> {
        let pending = self.store.pending_events(self.batch_size).await?;
        let mut delivered = 0;
        for event in pending {
            match self.sink.deliver(&event).await {
                Ok(()) => {
                    self.store.mark_event_delivered(event.id).await?;
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(e) => {
                    warn!(
                        job_id = %event.job_id,
                        sequence = event.sequence,
                        attempts = event.attempts + 1,
                        error = %e,
                        "Event delivery failed"
                    );
                    self.store.record_delivery_failure(event.id, &e.to_string()).await?;
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.metrics.sweeps.fetch_add(1, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Sweeps every `interval` until `token` is cancelled.
    pub fn spawn(self, interval: Duration, token: Arc<CancellationToken>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "Event notifier sweep failed");
                        }
                    }
                }
            }
            debug!("Event notifier stopped");
        })
    }
}
