//! Event sink trait and implementations.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, Level};

use crate::core::JobEventKind;
use crate::store::{JobEvent, JobId};

/// Error returned when a sink could not take an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("event delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Trait for sinks receiving job events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &JobEvent);

    /// Tries to emit an event without blocking.
    ///
    /// This method never fails. Errors are logged but suppressed.
    fn try_emit(&self, event: &JobEvent);

    /// Delivers an event, reporting failure.
    ///
    /// Used by the at-least-once notifier. Sinks that cannot fail keep
    /// the default.
    async fn deliver(&self, event: &JobEvent) -> Result<(), DeliveryError> {
        self.emit(event).await;
        Ok(())
    }
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &JobEvent) {}

    fn try_emit(&self, _event: &JobEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    /// The log level to use.
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &JobEvent) {
        if self.level == Level::DEBUG {
            debug!(
                job_id = %event.job_id,
                sequence = event.sequence,
                kind = %event.kind,
                payload = %event.payload,
                "Job event"
            );
        } else {
            info!(
                job_id = %event.job_id,
                sequence = event.sequence,
                kind = %event.kind,
                "Job event"
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &JobEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &JobEvent) {
        self.log_event(event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<JobEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events of one kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: JobEventKind) -> Vec<JobEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns the events of one job.
    #[must_use]
    pub fn events_for(&self, job_id: JobId) -> Vec<JobEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &JobEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &JobEvent) {
        self.events.write().push(event.clone());
    }
}

/// Publishes events on one broadcast channel per job.
///
/// Channels are created on first use and removed by
/// [`BroadcastEventSink::close`]; receivers then drain what was sent and
/// see the channel closed.
#[derive(Debug)]
pub struct BroadcastEventSink {
    channels: DashMap<JobId, broadcast::Sender<JobEvent>>,
    capacity: usize,
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastEventSink {
    /// Creates a sink whose channels buffer `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, job_id: JobId) -> broadcast::Sender<JobEvent> {
        self.channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribes to the future events of a job.
    #[must_use]
    pub fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<JobEvent> {
        self.sender(job_id).subscribe()
    }

    /// Drops the channel of a job.
    pub fn close(&self, job_id: JobId) {
        self.channels.remove(&job_id);
    }

    /// Number of open channels.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    fn publish(&self, event: &JobEvent) {
        if let Some(sender) = self.channels.get(&event.job_id) {
            // No receivers is fine: history is read from the store.
            let _ = sender.send(event.clone());
        }
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: &JobEvent) {
        self.publish(event);
    }

    fn try_emit(&self, event: &JobEvent) {
        self.publish(event);
    }
}

/// Forwards every event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutEventSink {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: &JobEvent) {
        for sink in &self.sinks {
            sink.emit(event).await;
        }
    }

    fn try_emit(&self, event: &JobEvent) {
        for sink in &self.sinks {
            sink.try_emit(event);
        }
    }

    async fn deliver(&self, event: &JobEvent) -> Result<(), DeliveryError> {
        for sink in &self.sinks {
            sink.deliver(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(job_id: JobId, sequence: u64, kind: JobEventKind) -> JobEvent {
        JobEvent::new(job_id, sequence, kind, json!({"n": sequence}))
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        let e = event(JobId::new(), 0, JobEventKind::Progress);
        NoOpEventSink.emit(&e).await;
        LoggingEventSink::default().emit(&e).await;
        LoggingEventSink::debug().try_emit(&e);
        assert!(NoOpEventSink.deliver(&e).await.is_ok());
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        let job = JobId::new();
        sink.emit(&event(job, 0, JobEventKind::StatusChange)).await;
        sink.try_emit(&event(job, 1, JobEventKind::Progress));
        sink.try_emit(&event(JobId::new(), 0, JobEventKind::Progress));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_kind(JobEventKind::Progress).len(), 2);
        assert_eq!(sink.events_for(job).len(), 2);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_per_job() {
        let sink = BroadcastEventSink::new(8);
        let a = JobId::new();
        let b = JobId::new();
        let mut rx_a = sink.subscribe(a);
        let mut rx_b = sink.subscribe(b);

        sink.emit(&event(a, 0, JobEventKind::Progress)).await;
        sink.emit(&event(b, 0, JobEventKind::Progress)).await;
        sink.emit(&event(a, 1, JobEventKind::Complete)).await;

        assert_eq!(rx_a.recv().await.unwrap().sequence, 0);
        assert_eq!(rx_a.recv().await.unwrap().sequence, 1);
        assert_eq!(rx_b.recv().await.unwrap().job_id, b);

        sink.close(a);
        assert!(rx_a.recv().await.is_err());
        assert_eq!(sink.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_drops() {
        let sink = BroadcastEventSink::default();
        sink.emit(&event(JobId::new(), 0, JobEventKind::Progress)).await;
        assert_eq!(sink.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_fanout() {
        let first = Arc::new(CollectingEventSink::new());
        let second = Arc::new(CollectingEventSink::new());
        let fanout = FanoutEventSink::new()
            .with_sink(first.clone())
            .with_sink(second.clone());

        fanout.emit(&event(JobId::new(), 0, JobEventKind::Error)).await;
        fanout.try_emit(&event(JobId::new(), 1, JobEventKind::Error));
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
    }
}
