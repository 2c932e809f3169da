//! Event sink trait and implementations.

use super::subscription::EventHandler;
use crate::core::{Event, EventKind, RunKey};
use crate::errors::HandlerError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, Level};

/// Trait for event sinks that observe everything published on the bus.
///
/// Sinks are attached with [`super::EventBus::attach_sink`] and run as
/// ordinary subscribers, so they see events in dispatch order.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "sink"
    }

    /// Receives one event.
    async fn emit(&self, event: &Event);
}

/// Adapts an [`EventSink`] to the subscriber interface.
pub(crate) struct SinkHandler {
    name: String,
    sink: Arc<dyn EventSink>,
}

impl SinkHandler {
    pub(crate) fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            name: format!("sink:{}", sink.name()),
            sink,
        }
    }
}

#[async_trait]
impl EventHandler for SinkHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.sink.emit(event).await;
        Ok(())
    }
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

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &Event) {
        let run_key = event.run_key.as_ref().map_or("-", RunKey::as_str);
        let payload = serde_json::to_string(&event.payload).unwrap_or_default();
        if self.level == Level::DEBUG {
            debug!(
                event_id = %event.id,
                event_kind = %event.kind(),
                priority = %event.priority,
                run_key = %run_key,
                payload = %payload,
                "Event: {}", event.kind()
            );
        } else {
            info!(
                event_id = %event.id,
                event_kind = %event.kind(),
                priority = %event.priority,
                run_key = %run_key,
                payload = %payload,
                "Event: {}", event.kind()
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    fn name(&self) -> &str {
        "logging"
    }

    async fn emit(&self, event: &Event) {
        self.log_event(event);
    }
}

/// A collecting event sink for testing and inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<Event>>,
    grew: Notify,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event without going through the bus.
    pub fn push(&self, event: Event) {
        self.events.write().push(event);
        self.grew.notify_waiters();
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Returns the kinds of all collected events, in arrival order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(Event::kind).collect()
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
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Returns the events attached to a run.
    #[must_use]
    pub fn events_for_run(&self, run_key: &RunKey) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.run_key.as_ref() == Some(run_key))
            .cloned()
            .collect()
    }

    /// Waits until at least `count` events have been collected.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_len(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let grew = self.grew.notified();
                if self.len() >= count {
                    return;
                }
                grew.await;
            }
        })
        .await
        .is_ok()
    }

    /// Waits for the first event of `kind`, including ones already collected.
    pub async fn wait_for_kind(&self, kind: EventKind, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, async {
            loop {
                let grew = self.grew.notified();
                if let Some(event) = self.events.read().iter().find(|e| e.kind() == kind) {
                    return event.clone();
                }
                grew.await;
            }
        })
        .await
        .ok()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn emit(&self, event: &Event) {
        self.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventPayload;

    fn status_event(state: &str) -> Event {
        Event::new(EventPayload::ComponentStatus {
            component: "scheduler".into(),
            state: state.into(),
        })
    }

    #[tokio::test]
    async fn test_logging_sink() {
        let sink = LoggingEventSink::default();
        sink.emit(&status_event("running")).await;
        LoggingEventSink::debug().emit(&status_event("stopped")).await;
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&status_event("running")).await;
        sink.emit(&status_event("stopped").for_run(RunKey::new("r1"))).await;

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of_kind(EventKind::ComponentStatus).len(), 2);
        assert_eq!(sink.events_for_run(&RunKey::new("r1")).len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_len_wakes_on_push() {
        let sink = Arc::new(CollectingEventSink::new());
        let pusher = {
            let sink = sink.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                sink.push(status_event("running"));
            })
        };

        assert!(sink.wait_for_len(1, Duration::from_secs(1)).await);
        pusher.await.unwrap();
        assert!(!sink.wait_for_len(5, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_sink_handler_forwards() {
        let sink = Arc::new(CollectingEventSink::new());
        let handler = SinkHandler::new(sink.clone());

        assert_eq!(handler.name(), "sink:collecting");
        handler.handle(&status_event("running")).await.unwrap();
        assert_eq!(sink.len(), 1);
    }
}
