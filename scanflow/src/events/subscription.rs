//! Subscriber registration types.

use crate::core::{Event, EventKind};
use crate::errors::HandlerError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies a subscription so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Selects which event kinds a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KindFilter {
    /// Every event.
    #[default]
    All,
    /// Only the listed kinds.
    Kinds(BTreeSet<EventKind>),
}

impl KindFilter {
    /// Matches a single kind.
    #[must_use]
    pub fn only(kind: EventKind) -> Self {
        Self::Kinds(BTreeSet::from([kind]))
    }

    /// Matches any of the given kinds.
    #[must_use]
    pub fn any_of(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self::Kinds(kinds.into_iter().collect())
    }

    /// Returns true if events of `kind` pass the filter.
    #[must_use]
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

/// A bus subscriber.
///
/// Handlers run on the bus dispatch worker, one at a time. A handler that
/// returns an error, panics or exceeds the handler timeout is logged and
/// counted; other handlers still receive the event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and `HandlerFailed` diagnostics.
    fn name(&self) -> &str;

    /// Handles one event.
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

type BoxedHandlerFn =
    dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>> + Send + Sync;

/// Adapts an async closure into an [`EventHandler`].
///
/// The closure receives an owned clone of the event.
pub struct FnHandler {
    name: String,
    func: Box<BoxedHandlerFn>,
}

impl FnHandler {
    /// Creates a new function handler.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(move |event| Box::pin(func(event))),
        }
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.func)(event.clone()).await
    }
}

/// A registered handler with its filter.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) filter: KindFilter,
    pub(crate) handler: Arc<dyn EventHandler>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_filter_matching() {
        assert!(KindFilter::All.matches(EventKind::QuotaWarning));

        let filter = KindFilter::any_of([EventKind::RunCompleted, EventKind::RunFailed]);
        assert!(filter.matches(EventKind::RunFailed));
        assert!(!filter.matches(EventKind::RunStarted));
    }

    #[tokio::test]
    async fn test_fn_handler_invokes_closure() {
        use crate::core::EventPayload;

        let handler = FnHandler::new("echo", |event: Event| async move {
            if event.kind() == EventKind::ComponentStatus {
                Ok(())
            } else {
                Err(HandlerError::new("unexpected kind"))
            }
        });

        let event = Event::new(EventPayload::ComponentStatus {
            component: "bus".into(),
            state: "running".into(),
        });
        assert_eq!(handler.name(), "echo");
        assert!(handler.handle(&event).await.is_ok());
    }
}
