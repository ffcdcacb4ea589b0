use crate::event::{event_types, Event, EventPriority};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskweave_core::{TaskweaveError, TaskweaveResult};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the bus whose delivery worker is running the current task.
    static DELIVERING_FOR: u64;
}

/// Boxed future returned by asynchronous handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = TaskweaveResult<()>> + Send>>;

type SyncHandlerFn = dyn Fn(&Event) -> TaskweaveResult<()> + Send + Sync;
type AsyncHandlerFn = dyn Fn(Event) -> HandlerFuture + Send + Sync;

/// Event bus tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum queued events awaiting asynchronous delivery. `publish` waits when
    /// full, except from handlers running on the delivery worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of recent events kept for [`EventBus::history`].
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Budget for a single asynchronous handler invocation.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_history_size() -> usize {
    1000
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            history_size: default_history_size(),
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}

enum Handler {
    Sync(Box<SyncHandlerFn>),
    Async(Box<AsyncHandlerFn>),
}

struct Subscription {
    id: u64,
    priority: i32,
    handler: Handler,
    active: AtomicBool,
}

impl Subscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn is_sync(&self) -> bool {
        matches!(self.handler, Handler::Sync(_))
    }
}

/// Returned by `subscribe`; pass to [`EventBus::unsubscribe`] to remove the handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    event_type: String,
}

impl SubscriptionHandle {
    /// Identifier unique within this bus.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Event type the handler was registered for.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

/// Counters and gauges describing bus activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    /// `false` once `shutdown` has begun.
    pub running: bool,
    /// Events accepted by `publish`, failure notices included.
    pub published: u64,
    /// Handler invocations that returned `Ok`.
    pub delivered: u64,
    /// Handler invocations that errored, panicked or timed out.
    pub handler_failures: u64,
    /// Registered handlers across all event types.
    pub subscribers: usize,
    /// Events waiting for asynchronous delivery.
    pub queue_depth: usize,
    /// Slots for events published outside the delivery worker.
    pub queue_capacity: usize,
}

/// An event plus the asynchronous subscribers it was published to.
struct Envelope {
    event: Event,
    subscribers: Vec<Arc<Subscription>>,
    /// Queue slot held until the worker picks the envelope up. Events
    /// published by the worker's own handlers carry none.
    slot: Option<OwnedSemaphorePermit>,
}

/// State shared between the bus handle and its delivery worker.
struct Shared {
    id: u64,
    subscriptions: RwLock<HashMap<String, Vec<Arc<Subscription>>>>,
    history: Mutex<VecDeque<Event>>,
    history_size: usize,
    handler_timeout: Duration,
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
    queued: AtomicUsize,
}

impl Shared {
    /// Subscribers for `event_type` (exact and wildcard), highest priority
    /// first, ties in registration order.
    fn snapshot(&self, event_type: &str) -> Vec<Arc<Subscription>> {
        let subscriptions = self.subscriptions.read();
        let mut subs: Vec<Arc<Subscription>> = Vec::new();
        if let Some(exact) = subscriptions.get(event_type) {
            subs.extend(exact.iter().cloned());
        }
        if event_type != event_types::WILDCARD {
            if let Some(all) = subscriptions.get(event_types::WILDCARD) {
                subs.extend(all.iter().cloned());
            }
        }
        subs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        subs
    }

    fn remember(&self, event: &Event) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.history_size == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.history_size {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    fn run_sync(&self, sub: &Subscription, event: &Event) -> Result<(), String> {
        let Handler::Sync(handler) = &sub.handler else {
            return Ok(());
        };
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
        self.settle(outcome)
    }

    async fn run_async(&self, sub: &Subscription, event: Event) -> Result<(), String> {
        let Handler::Async(handler) = &sub.handler else {
            return Ok(());
        };
        let future = AssertUnwindSafe(handler(event)).catch_unwind();
        match tokio::time::timeout(self.handler_timeout, future).await {
            Ok(outcome) => self.settle(outcome),
            Err(_) => Err(format!(
                "handler timed out after {}ms",
                self.handler_timeout.as_millis()
            )),
        }
    }

    fn settle(
        &self,
        outcome: Result<TaskweaveResult<()>, Box<dyn std::any::Any + Send>>,
    ) -> Result<(), String> {
        match outcome {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    /// Logs a handler failure and builds the notice for `bus.handler_failed`
    /// subscribers. Failures while delivering a notice produce no new notice.
    fn failure_notice(&self, event: &Event, sub: &Subscription, reason: String) -> Option<Event> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let err = TaskweaveError::EventHandlerFailure {
            event_type: event.event_type.clone(),
            reason: reason.clone(),
        };
        warn!(
            event_id = %event.id,
            subscription = sub.id,
            error = %err,
            "Event handler failed"
        );
        if event.is_failure_notice() {
            return None;
        }
        let mut notice = Event::new(
            event_types::HANDLER_FAILED,
            "event_bus",
            serde_json::json!({
                "event_id": event.id,
                "event_type": event.event_type,
                "subscription_id": sub.id,
                "reason": reason,
            }),
        )
        .with_priority(EventPriority::High);
        notice.correlation_id = event.correlation_id.clone();
        Some(notice)
    }

    /// Delivers a failure notice to every subscriber inline. Used by the worker,
    /// which holds no sender of its own.
    async fn deliver_notice_inline(&self, notice: Event) {
        self.remember(&notice);
        for sub in self.snapshot(&notice.event_type) {
            if !sub.is_active() {
                continue;
            }
            let outcome = if sub.is_sync() {
                self.run_sync(&sub, &notice)
            } else {
                self.run_async(&sub, notice.clone()).await
            };
            if let Err(reason) = outcome {
                let _ = self.failure_notice(&notice, &sub, reason);
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Asynchronous publish/subscribe channel with priority-ordered delivery.
///
/// Synchronous handlers run inline inside [`publish`](EventBus::publish);
/// asynchronous handlers run on a single delivery worker, one event at a time,
/// in the order events were accepted. For each event, handlers run in
/// descending priority with ties broken by registration order.
///
/// The queue holds at most `queue_capacity` events from outside publishers.
/// A handler running on the delivery worker never waits for a slot: its
/// events are queued straight away, so a handler that publishes cannot
/// stall the worker it runs on.
pub struct EventBus {
    shared: Arc<Shared>,
    sender: RwLock<Option<mpsc::UnboundedSender<Envelope>>>,
    slots: Arc<Semaphore>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl EventBus {
    /// Create a bus and spawn its delivery worker on the current tokio runtime.
    pub fn start(config: BusConfig) -> Arc<Self> {
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        let id = NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            id,
            subscriptions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_size: config.history_size,
            handler_timeout: Duration::from_millis(config.handler_timeout_ms),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
        });

        let worker = tokio::spawn(DELIVERING_FOR.scope(id, Self::deliver(shared.clone(), rx)));
        info!(queue_capacity, "Event bus started");

        Arc::new(Self {
            shared,
            sender: RwLock::new(Some(tx)),
            slots: Arc::new(Semaphore::new(queue_capacity)),
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            queue_capacity,
        })
    }

    async fn deliver(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            shared.queued.fetch_sub(1, Ordering::Relaxed);
            let Envelope {
                event,
                subscribers,
                slot,
            } = envelope;
            drop(slot);
            for sub in &subscribers {
                if !sub.is_active() {
                    continue;
                }
                if let Err(reason) = shared.run_async(sub, event.clone()).await {
                    if let Some(notice) = shared.failure_notice(&event, sub, reason) {
                        shared.deliver_notice_inline(notice).await;
                    }
                }
            }
        }
        debug!("Event bus worker drained");
    }

    /// Register a synchronous handler, invoked inline by `publish`.
    pub fn subscribe<F>(
        &self,
        event_type: impl Into<String>,
        priority: i32,
        handler: F,
    ) -> TaskweaveResult<SubscriptionHandle>
    where
        F: Fn(&Event) -> TaskweaveResult<()> + Send + Sync + 'static,
    {
        self.insert(event_type.into(), priority, Handler::Sync(Box::new(handler)))
    }

    /// Register an asynchronous handler, invoked by the delivery worker.
    pub fn subscribe_async<F, Fut>(
        &self,
        event_type: impl Into<String>,
        priority: i32,
        handler: F,
    ) -> TaskweaveResult<SubscriptionHandle>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskweaveResult<()>> + Send + 'static,
    {
        let boxed: Box<AsyncHandlerFn> = Box::new(move |event| Box::pin(handler(event)));
        self.insert(event_type.into(), priority, Handler::Async(boxed))
    }

    fn insert(
        &self,
        event_type: String,
        priority: i32,
        handler: Handler,
    ) -> TaskweaveResult<SubscriptionHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskweaveError::BusClosed);
        }
        if event_type.trim().is_empty() {
            return Err(TaskweaveError::InvalidArgument(
                "event type must not be empty".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription {
            id,
            priority,
            handler,
            active: AtomicBool::new(true),
        });

        let mut subscriptions = self.shared.subscriptions.write();
        let list = subscriptions.entry(event_type.clone()).or_default();
        // First slot with a strictly lower priority keeps equal priorities in
        // registration order.
        let pos = list
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(list.len());
        list.insert(pos, sub);

        debug!(event_type = %event_type, subscription = id, priority, "Handler subscribed");
        Ok(SubscriptionHandle { id, event_type })
    }

    /// Remove a handler. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscriptions = self.shared.subscriptions.write();
        let Some(list) = subscriptions.get_mut(&handle.event_type) else {
            return false;
        };
        let Some(pos) = list.iter().position(|s| s.id == handle.id) else {
            return false;
        };
        let sub = list.remove(pos);
        sub.active.store(false, Ordering::Release);
        if list.is_empty() {
            subscriptions.remove(&handle.event_type);
        }
        true
    }

    /// Publish an event.
    ///
    /// Synchronous handlers have all run when this returns. Asynchronous
    /// handlers are queued; if the queue is full this waits for room, unless
    /// called from a handler running on this bus's delivery worker.
    pub async fn publish(&self, event: Event) -> TaskweaveResult<()> {
        let sender = self
            .sender
            .read()
            .clone()
            .ok_or(TaskweaveError::BusClosed)?;

        let subscribers = self.shared.snapshot(&event.event_type);
        self.shared.remember(&event);

        let mut notices = Vec::new();
        let mut deferred = Vec::new();
        for sub in subscribers {
            if !sub.is_sync() {
                deferred.push(sub);
                continue;
            }
            if !sub.is_active() {
                continue;
            }
            if let Err(reason) = self.shared.run_sync(&sub, &event) {
                if let Some(notice) = self.shared.failure_notice(&event, &sub, reason) {
                    notices.push(notice);
                }
            }
        }

        if !deferred.is_empty() {
            self.enqueue(&sender, event, deferred).await?;
        }

        for notice in notices {
            self.publish_notice(&sender, notice).await;
        }
        Ok(())
    }

    async fn publish_notice(&self, sender: &mpsc::UnboundedSender<Envelope>, notice: Event) {
        let subscribers = self.shared.snapshot(&notice.event_type);
        self.shared.remember(&notice);
        let mut deferred = Vec::new();
        for sub in subscribers {
            if !sub.is_sync() {
                deferred.push(sub);
            } else if sub.is_active() {
                if let Err(reason) = self.shared.run_sync(&sub, &notice) {
                    let _ = self.shared.failure_notice(&notice, &sub, reason);
                }
            }
        }
        if !deferred.is_empty() && self.enqueue(sender, notice, deferred).await.is_err() {
            error!("Event bus closed while queueing a handler failure notice");
        }
    }

    fn on_worker(&self) -> bool {
        DELIVERING_FOR
            .try_with(|id| *id == self.shared.id)
            .unwrap_or(false)
    }

    async fn enqueue(
        &self,
        sender: &mpsc::UnboundedSender<Envelope>,
        event: Event,
        subscribers: Vec<Arc<Subscription>>,
    ) -> TaskweaveResult<()> {
        let slot = if self.on_worker() {
            None
        } else {
            let permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| TaskweaveError::BusClosed)?;
            Some(permit)
        };
        self.shared.queued.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            event,
            subscribers,
            slot,
        };
        if sender.send(envelope).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskweaveError::BusClosed);
        }
        Ok(())
    }

    /// Stop accepting events and subscribers, deliver everything already
    /// accepted, and wait for the worker to finish.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.write().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Event bus worker terminated abnormally");
            }
        }
        info!("Event bus stopped");
    }

    /// Whether the bus still accepts events and subscribers.
    pub fn is_running(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Most recent events, oldest first, optionally filtered by type.
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.shared.history.lock();
        let matching: Vec<&Event> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Snapshot of the bus counters.
    pub fn stats(&self) -> BusStats {
        let subscribers = self
            .shared
            .subscriptions
            .read()
            .values()
            .map(Vec::len)
            .sum();
        let queue_depth = self.shared.queued.load(Ordering::Relaxed);
        BusStats {
            running: self.is_running(),
            published: self.shared.published.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            handler_failures: self.shared.failures.load(Ordering::Relaxed),
            subscribers,
            queue_depth,
            queue_capacity: self.queue_capacity,
        }
    }
}
