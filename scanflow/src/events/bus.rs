//! Priority event bus with a single dispatch worker.

use super::metrics::{BusMetrics, BusMetricsSnapshot, QueueDepths};
use super::sink::{EventSink, SinkHandler};
use super::subscription::{EventHandler, FnHandler, KindFilter, Subscription, SubscriptionId};
use crate::config::BusConfig;
use crate::core::{Event, EventKind, EventPayload, EventPriority};
use crate::errors::{HandlerError, ScanflowError};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of [`EventBus::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Events dispatched over the bus lifetime.
    pub delivered: u64,
    /// Queued or in-flight events discarded by this shutdown.
    pub dropped: u64,
    /// True if a draining shutdown gave up after the drain timeout.
    pub timed_out: bool,
}

/// In-process publish/subscribe bus.
///
/// Each priority tier has its own bounded FIFO queue. One dispatch worker
/// always drains the highest non-empty tier first and delivers each event to
/// every matching subscriber before taking the next one, so an in-flight
/// delivery is never preempted.
///
/// Capacity is tracked with one semaphore per tier: a publisher takes a
/// permit before enqueuing and the worker returns it when it dequeues.
/// Publishing before [`EventBus::start`] is allowed; events wait in the queues.
pub struct EventBus {
    config: BusConfig,
    queues: Mutex<[VecDeque<Event>; EventPriority::TIERS]>,
    capacity: [Semaphore; EventPriority::TIERS],
    ready: Notify,
    subscribers: RwLock<Vec<Subscription>>,
    accepting: AtomicBool,
    draining: AtomicBool,
    running: AtomicBool,
    in_flight: AtomicBool,
    metrics: BusMetrics,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Creates a bus. The dispatch worker is not started yet.
    #[must_use]
    pub fn new(config: BusConfig) -> Arc<Self> {
        let capacity = std::array::from_fn(|_| Semaphore::new(config.queue_capacity));
        Arc::new(Self {
            config,
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            capacity,
            ready: Notify::new(),
            subscribers: RwLock::new(Vec::new()),
            accepting: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            running: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            metrics: BusMetrics::default(),
            worker: Mutex::new(None),
        })
    }

    /// Returns the bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Starts the dispatch worker. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        if !self.is_accepting() {
            warn!("Event bus already shut down, not starting");
            return;
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let bus = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { bus.run_worker().await }));
        info!(
            queue_capacity = self.config.queue_capacity,
            publish_timeout_ms = self.config.publish_timeout_ms,
            "Event bus started"
        );
    }

    /// Registers a handler for every future event matching `filter`.
    pub fn subscribe(&self, filter: KindFilter, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId::new();
        debug!(subscriber = handler.name(), subscription_id = %id, "Subscribed");
        self.subscribers.write().push(Subscription { id, filter, handler });
        id
    }

    /// Registers an async closure as a handler.
    pub fn subscribe_fn<F, Fut>(&self, name: impl Into<String>, filter: KindFilter, func: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(filter, Arc::new(FnHandler::new(name, func)))
    }

    /// Forwards every event to `sink`.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        self.subscribe(KindFilter::All, Arc::new(SinkHandler::new(sink)))
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    /// Enqueues an event for asynchronous delivery.
    ///
    /// Waits up to the publish timeout for room in the event's priority
    /// queue, then fails with [`ScanflowError::Overflow`]. Never waits on
    /// handler execution.
    pub async fn publish(&self, event: Event) -> Result<(), ScanflowError> {
        if !self.is_accepting() {
            return Err(ScanflowError::BusShutdown);
        }
        let priority = event.priority;
        let semaphore = &self.capacity[priority.tier()];
        match tokio::time::timeout(self.config.publish_timeout(), semaphore.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => return Err(ScanflowError::BusShutdown),
            Err(_) => return Err(self.overflow(&event, self.config.publish_timeout_ms)),
        }
        self.enqueue(event)
    }

    /// Enqueues an event only if there is room right now.
    pub fn try_publish(&self, event: Event) -> Result<(), ScanflowError> {
        if !self.is_accepting() {
            return Err(ScanflowError::BusShutdown);
        }
        match self.capacity[event.priority.tier()].try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::Closed) => return Err(ScanflowError::BusShutdown),
            Err(TryAcquireError::NoPermits) => return Err(self.overflow(&event, 0)),
        }
        self.enqueue(event)
    }

    /// Waits for the next event that passes `filter` and `predicate`.
    ///
    /// Only events dispatched after the call are considered.
    pub async fn wait_for<P>(&self, filter: KindFilter, predicate: P, timeout: Duration) -> Option<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.subscribe(
            filter,
            Arc::new(Waiter {
                predicate: Box::new(predicate),
                tx: Mutex::new(Some(tx)),
            }),
        );
        let event = tokio::time::timeout(timeout, rx).await.ok().and_then(Result::ok);
        self.unsubscribe(id);
        event
    }

    /// Waits for the next event of `kind`.
    pub async fn wait_for_kind(&self, kind: EventKind, timeout: Duration) -> Option<Event> {
        self.wait_for(KindFilter::only(kind), |_| true, timeout).await
    }

    /// Returns whether publishes are accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Returns whether the dispatch worker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the raw counters.
    #[must_use]
    pub fn counters(&self) -> &BusMetrics {
        &self.metrics
    }

    /// Returns a point-in-time snapshot of counters and queue depths.
    #[must_use]
    pub fn metrics(&self) -> BusMetricsSnapshot {
        let queue_depths = {
            let queues = self.queues.lock();
            QueueDepths {
                critical: queues[EventPriority::Critical.tier()].len(),
                high: queues[EventPriority::High.tier()].len(),
                normal: queues[EventPriority::Normal.tier()].len(),
                low: queues[EventPriority::Low.tier()].len(),
            }
        };
        BusMetricsSnapshot {
            accepting: self.is_accepting(),
            running: self.is_running(),
            subscribers: self.subscribers.read().len(),
            queue_depths,
            published: self.metrics.published(),
            delivered: self.metrics.delivered(),
            handler_failures: self.metrics.handler_failures(),
            overflowed: self.metrics.overflowed(),
            dropped: self.metrics.dropped(),
            diagnostics_dropped: self.metrics.diagnostics_dropped(),
        }
    }

    /// Stops accepting publishes and stops the dispatch worker.
    ///
    /// With `drain`, already-queued events are delivered first, bounded by
    /// the drain timeout. Whatever is still queued or in flight afterwards is
    /// discarded and counted in the report. Events queued on a bus that was
    /// never started cannot be drained and are dropped.
    pub async fn shutdown(&self, drain: bool) -> ShutdownReport {
        {
            let _queues = self.queues.lock();
            self.accepting.store(false, Ordering::SeqCst);
            if drain {
                self.draining.store(true, Ordering::SeqCst);
            }
        }
        for semaphore in &self.capacity {
            semaphore.close();
        }

        let mut timed_out = false;
        let worker = self.worker.lock().take();
        if let Some(mut handle) = worker {
            if drain {
                self.ready.notify_one();
                if tokio::time::timeout(self.config.drain_timeout(), &mut handle).await.is_err() {
                    timed_out = true;
                    warn!(drain_timeout_ms = self.config.drain_timeout_ms, "Event bus drain timed out");
                    handle.abort();
                    let _ = handle.await;
                }
            } else {
                handle.abort();
                let _ = handle.await;
            }
        }
        self.running.store(false, Ordering::SeqCst);

        let queued: usize = self.queues.lock().iter_mut().map(|q| {
            let n = q.len();
            q.clear();
            n
        }).sum();
        let in_flight = u64::from(self.in_flight.swap(false, Ordering::SeqCst));
        let dropped = u64::try_from(queued).unwrap_or(u64::MAX) + in_flight;
        if dropped > 0 {
            self.metrics.record_dropped(dropped);
        }

        let report = ShutdownReport {
            delivered: self.metrics.delivered(),
            dropped,
            timed_out,
        };
        info!(
            drain,
            delivered = report.delivered,
            dropped = report.dropped,
            timed_out = report.timed_out,
            "Event bus shut down"
        );
        report
    }

    fn overflow(&self, event: &Event, timeout_ms: u64) -> ScanflowError {
        self.metrics.record_overflow();
        warn!(
            priority = %event.priority,
            event_kind = %event.kind(),
            timeout_ms,
            "Event bus queue full, publish rejected"
        );
        ScanflowError::Overflow {
            priority: event.priority,
            timeout_ms,
        }
    }

    fn enqueue(&self, event: Event) -> Result<(), ScanflowError> {
        let tier = event.priority.tier();
        {
            let mut queues = self.queues.lock();
            if !self.is_accepting() {
                drop(queues);
                self.capacity[tier].add_permits(1);
                return Err(ScanflowError::BusShutdown);
            }
            queues[tier].push_back(event);
        }
        self.metrics.record_published();
        self.ready.notify_one();
        Ok(())
    }

    fn next_event(&self) -> Option<Event> {
        let mut queues = self.queues.lock();
        for (tier, queue) in queues.iter_mut().enumerate() {
            if let Some(event) = queue.pop_front() {
                self.in_flight.store(true, Ordering::SeqCst);
                self.capacity[tier].add_permits(1);
                return Some(event);
            }
        }
        None
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            if let Some(event) = self.next_event() {
                self.dispatch(&event).await;
                self.in_flight.store(false, Ordering::SeqCst);
                continue;
            }
            if self.draining.load(Ordering::SeqCst) {
                break;
            }
            self.ready.notified().await;
        }
        self.running.store(false, Ordering::SeqCst);
        debug!("Event bus worker exited");
    }

    async fn dispatch(&self, event: &Event) {
        let matching: Vec<Subscription> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.filter.matches(event.kind()))
            .cloned()
            .collect();

        for subscription in &matching {
            if let Err(error) = self.invoke(subscription, event).await {
                self.metrics.record_handler_failure();
                warn!(
                    subscriber = subscription.handler.name(),
                    event_kind = %event.kind(),
                    event_id = %event.id,
                    error = %error,
                    "Event handler failed"
                );
                self.report_handler_failure(subscription, event, error);
            }
        }
        self.metrics.record_delivered();
    }

    async fn invoke(&self, subscription: &Subscription, event: &Event) -> Result<(), HandlerError> {
        let call = AssertUnwindSafe(subscription.handler.handle(event)).catch_unwind();
        match tokio::time::timeout(self.config.handler_timeout(), call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(HandlerError::new(format!(
                "handler timed out after {}ms",
                self.config.handler_timeout_ms
            ))),
        }
    }

    fn report_handler_failure(&self, subscription: &Subscription, event: &Event, error: HandlerError) {
        // A failure while handling a diagnostic is only counted.
        if !self.config.emit_handler_diagnostics || event.kind() == EventKind::HandlerFailed {
            return;
        }
        let mut diagnostic = Event::new(EventPayload::HandlerFailed {
            subscriber: subscription.handler.name().to_string(),
            failed_kind: event.kind(),
            failed_event_id: event.id,
            error: error.message,
        });
        if let Some(run_key) = &event.run_key {
            diagnostic = diagnostic.for_run(run_key.clone());
        }
        if let Err(e) = self.publish_diagnostic(diagnostic) {
            self.metrics.record_diagnostic_dropped();
            debug!(error = %e, "Handler failure diagnostic dropped");
        }
    }

    /// Like [`EventBus::try_publish`], but a draining bus still takes the
    /// diagnostic so it is delivered before the worker exits.
    fn publish_diagnostic(&self, event: Event) -> Result<(), ScanflowError> {
        match self.try_publish(event.clone()) {
            Err(ScanflowError::BusShutdown) if self.draining.load(Ordering::SeqCst) => {
                self.queues.lock()[event.priority.tier()].push_back(event);
                self.metrics.record_published();
                Ok(())
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("accepting", &self.is_accepting())
            .field("running", &self.is_running())
            .field("subscribers", &self.subscribers.read().len())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// One-shot subscriber behind [`EventBus::wait_for`].
struct Waiter {
    predicate: Predicate,
    tx: Mutex<Option<oneshot::Sender<Event>>>,
}

#[async_trait]
impl EventHandler for Waiter {
    fn name(&self) -> &str {
        "wait_for"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        if (self.predicate)(event) {
            if let Some(tx) = self.tx.lock().take() {
                let _ = tx.send(event.clone());
            }
        }
        Ok(())
    }
}
