//! Job event fan-out.
//!
//! Events are persisted by the interpreter together with each step's
//! commit and then published to an [`EventSink`]. The
//! [`BroadcastEventSink`] backs live event streams; the
//! [`EventNotifier`] redelivers persisted events at least once.

mod notifier;
mod sink;

pub use notifier::{DeliveryMetrics, EventNotifier};
pub use sink::{
    BroadcastEventSink, CollectingEventSink, DeliveryError, EventSink, FanoutEventSink,
    LoggingEventSink, NoOpEventSink,
};
