//! In-process event bus and event sinks.
//!
//! The bus is the only channel between the scheduler, the coordinator and
//! outside observers. Sinks such as [`LoggingEventSink`] attach to it as
//! ordinary subscribers.

mod bus;
mod metrics;
mod sink;
mod subscription;

pub use bus::{EventBus, ShutdownReport};
pub use metrics::{BusMetrics, BusMetricsSnapshot, QueueDepths};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink};
pub use subscription::{EventHandler, FnHandler, KindFilter, SubscriptionId};
