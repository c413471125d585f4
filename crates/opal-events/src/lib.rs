//! In-process event bus for Opal: listener registry plus async dispatch queue.
//!
//! Emission is decoupled from dispatch through a bounded FIFO queue drained by
//! a background task; all subscribers of an event run concurrently and their
//! completions are awaited jointly before the next event is dequeued. Handler
//! failures are isolated per subscriber and counted, never propagated.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use futures_util::{future::join_all, FutureExt};
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

use opal_core::{current_unix_timestamp_ms, FailureCounter, FailureCounterSnapshot};

mod event_names;
pub use event_names::*;


const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_DRAIN_INTERVAL_MS: u64 = 10;
const DEFAULT_FAILURE_THRESHOLD: u64 = 50;

/// Enumerates supported `EventBusError` values.
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("invalid event bus argument: {0}")]
    Validation(String),
    #[error("timed out after {timeout_ms}ms waiting for '{name}'")]
    Timeout { name: String, timeout_ms: u64 },
}

/// Public struct `EventEnvelope` used across Opal components.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub name: String,
    pub payload: Value,
    pub timestamp_unix_ms: u64,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            timestamp_unix_ms: current_unix_timestamp_ms(),
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;
type EventHandler = Arc<dyn Fn(EventEnvelope) -> HandlerFuture + Send + Sync>;
type SoftResetHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct RegisteredListener {
    id: u64,
    handler: EventHandler,
}

/// Public struct `EventBusConfig` used across Opal components.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub queue_capacity: usize,
    pub drain_interval: Duration,
    pub failure_threshold: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_interval: Duration::from_millis(DEFAULT_DRAIN_INTERVAL_MS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Public struct `DispatchMetrics` used across Opal components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    pub enqueued: u64,
    pub dropped_full: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
    pub handler_panics: u64,
}

#[derive(Default)]
struct DispatchMetricsInner {
    enqueued: AtomicU64,
    dropped_full: AtomicU64,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
    handler_panics: AtomicU64,
}

impl DispatchMetricsInner {
    fn snapshot(&self) -> DispatchMetrics {
        DispatchMetrics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

struct EventBusInner {
    config: EventBusConfig,
    registry: Mutex<HashMap<String, Vec<RegisteredListener>>>,
    next_listener_id: AtomicU64,
    queue: Mutex<std::collections::VecDeque<EventEnvelope>>,
    draining: AtomicBool,
    metrics: DispatchMetricsInner,
    failure_counter: FailureCounter,
    soft_reset_hooks: Mutex<Vec<SoftResetHook>>,
}

/// Handle returned from `subscribe`; dropping it does not unsubscribe.
#[derive(Clone)]
pub struct ListenerHandle {
    inner: Weak<EventBusInner>,
    name: String,
    id: u64,
}

impl ListenerHandle {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_listener(&self.name, self.id);
        }
    }
}

/// Handle for the background drain task; `shutdown` stops it cleanly.
pub struct DrainHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl DrainHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

/// Public struct `EventBus` used across Opal components.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let failure_threshold = config.failure_threshold;
        Self {
            inner: Arc::new(EventBusInner {
                config,
                registry: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                queue: Mutex::new(std::collections::VecDeque::new()),
                draining: AtomicBool::new(false),
                metrics: DispatchMetricsInner::default(),
                failure_counter: FailureCounter::new(failure_threshold),
                soft_reset_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers `handler` for every future dispatch of `name`.
    ///
    /// Registration order is preserved; dispatch snapshots the list, so
    /// unsubscribing mid-dispatch never affects the in-flight event.
    pub fn subscribe<F, Fut>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<ListenerHandle, EventBusError>
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        validate_event_name(name)?;
        let boxed: EventHandler = Arc::new(move |envelope| Box::pin(handler(envelope)));
        Ok(self.register(name, boxed))
    }

    /// Registers a handler that unsubscribes itself after its first delivery.
    pub fn once<F, Fut>(&self, name: &str, handler: F) -> Result<ListenerHandle, EventBusError>
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        validate_event_name(name)?;
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let fired = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&self.inner);
        let name_owned = name.to_string();
        let boxed: EventHandler = Arc::new(move |envelope| {
            if fired.swap(true, Ordering::SeqCst) {
                return Box::pin(async { Ok(()) });
            }
            if let Some(inner) = weak.upgrade() {
                inner.remove_listener(&name_owned, id);
            }
            Box::pin(handler(envelope))
        });
        self.register_with_id(name, id, boxed);
        Ok(ListenerHandle {
            inner: Arc::downgrade(&self.inner),
            name: name.to_string(),
            id,
        })
    }

    /// Resolves with the first `name` envelope or fails with `Timeout`.
    ///
    /// The temporary subscription is removed on either outcome.
    pub async fn wait_for(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<EventEnvelope, EventBusError> {
        validate_event_name(name)?;
        let (tx, rx) = oneshot::channel::<EventEnvelope>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let handle = self.once(name, move |envelope| {
            let slot = Arc::clone(&slot);
            async move {
                if let Some(sender) = slot.lock().ok().and_then(|mut guard| guard.take()) {
                    let _ = sender.send(envelope);
                }
                Ok(())
            }
        })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            _ => {
                handle.unsubscribe();
                Err(EventBusError::Timeout {
                    name: name.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Appends an event to the dispatch queue.
    ///
    /// The queue is bounded; overflow sheds the event and counts it in
    /// `dropped_full` rather than blocking the emitter.
    pub fn emit(&self, name: &str, payload: Value) -> Result<(), EventBusError> {
        validate_event_name(name)?;
        let envelope = EventEnvelope::new(name, payload);
        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if queue.len() >= self.inner.config.queue_capacity {
            drop(queue);
            self.inner.metrics.dropped_full.fetch_add(1, Ordering::Relaxed);
            warn!(event = name, "event queue full; shedding event");
            return Ok(());
        }
        queue.push_back(envelope);
        drop(queue);
        self.inner.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Dispatches immediately, bypassing the queue.
    ///
    /// Reserved for the few emitters whose continuation depends on subscriber
    /// completion ordering; everything else goes through `emit`.
    pub async fn emit_sync(&self, name: &str, payload: Value) -> Result<(), EventBusError> {
        validate_event_name(name)?;
        let envelope = EventEnvelope::new(name, payload);
        self.inner.dispatch(envelope).await;
        Ok(())
    }

    /// Spawns the background drain task on a fixed short interval.
    pub fn start_drain(&self) -> DrainHandle {
        let inner = Arc::clone(&self.inner);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.drain_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => inner.drain_queue().await,
                }
            }
            debug!("event bus drain task stopped");
        });
        DrainHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Drains the queue to empty once; used where deterministic flushing
    /// matters more than the background interval.
    pub async fn drain_now(&self) {
        self.inner.drain_queue().await;
    }

    /// Registers a hook invoked when the handled-failure threshold trips.
    pub fn on_soft_reset(&self, hook: impl Fn() + Send + Sync + 'static) {
        let mut hooks = self
            .inner
            .soft_reset_hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        hooks.push(Arc::new(hook));
    }

    pub fn metrics(&self) -> DispatchMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn failure_snapshot(&self) -> FailureCounterSnapshot {
        self.inner.failure_counter.snapshot()
    }

    pub fn queued_len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn register(&self, name: &str, handler: EventHandler) -> ListenerHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.register_with_id(name, id, handler);
        ListenerHandle {
            inner: Arc::downgrade(&self.inner),
            name: name.to_string(),
            id,
        }
    }

    fn register_with_id(&self, name: &str, id: u64, handler: EventHandler) {
        let mut registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry
            .entry(name.to_string())
            .or_default()
            .push(RegisteredListener { id, handler });
    }
}

impl EventBusInner {
    fn remove_listener(&self, name: &str, id: u64) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listeners) = registry.get_mut(name) {
            listeners.retain(|listener| listener.id != id);
            if listeners.is_empty() {
                registry.remove(name);
            }
        }
    }

    fn snapshot_listeners(&self, name: &str) -> Vec<RegisteredListener> {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.get(name).cloned().unwrap_or_default()
    }

    async fn drain_queue(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let next = {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                queue.pop_front()
            };
            let Some(envelope) = next else {
                break;
            };
            self.dispatch(envelope).await;
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    async fn dispatch(&self, envelope: EventEnvelope) {
        let listeners = self.snapshot_listeners(&envelope.name);
        if listeners.is_empty() {
            self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let invocations = listeners.into_iter().map(|listener| {
            let envelope = envelope.clone();
            async move {
                AssertUnwindSafe((listener.handler)(envelope))
                    .catch_unwind()
                    .await
            }
        });
        let outcomes = join_all(invocations).await;
        self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
        for outcome in outcomes {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(event = %envelope.name, %error, "event handler failed");
                    self.note_handled_failure();
                }
                Err(_panic) => {
                    self.metrics.handler_panics.fetch_add(1, Ordering::Relaxed);
                    warn!(event = %envelope.name, "event handler panicked");
                    self.note_handled_failure();
                }
            }
        }
    }

    fn note_handled_failure(&self) {
        if self.failure_counter.record_failure() {
            info!("handled-failure threshold tripped; running soft reset hooks");
            let hooks = {
                let guard = self
                    .soft_reset_hooks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.clone()
            };
            for hook in hooks {
                hook();
            }
        }
    }
}

fn validate_event_name(name: &str) -> Result<(), EventBusError> {
    if name.trim().is_empty() {
        return Err(EventBusError::Validation(
            "event name must be non-empty".to_string(),
        ));
    }
    Ok(())
}
