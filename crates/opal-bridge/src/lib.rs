//! Bridge between the host application's event source and the Opal bus.
//!
//! Binding follows an unbound -> bound -> active state machine with
//! fixed-delay retries while the host context is unavailable. Once active,
//! selected host events are proxied verbatim onto the internal bus while
//! message-lifecycle notifications are intercepted into the pipeline. A
//! redundant polling fallback diffs the visible conversation length to catch
//! notifications the host failed to deliver; both paths converge on the same
//! idempotent pipeline entry point.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

use opal_core::current_unix_timestamp_ms;
use opal_events::{
    EventBus, EVENT_CHAT_CHANGED, EVENT_MESSAGE_DELETED, EVENT_MESSAGE_RECEIVED,
    EVENT_MESSAGE_SENT, EVENT_SYSTEM_READY, MESSAGE_LIFECYCLE_EVENTS,
};
use opal_pipeline::{ChatMessage, MessagePipeline, PipelineOutcome};

mod host_contract;
pub use host_contract::{
    HostContextProvider, HostContextSnapshot, HostEventSource, HostNotificationHandler,
};


const DEFAULT_BIND_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SWITCH_GRACE_MS: u64 = 2_000;

/// Enumerates supported `BridgeState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unbound,
    Bound,
    Active,
}

impl BridgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Active => "active",
        }
    }
}

/// Public struct `HostEventBridgeConfig` used across Opal components.
#[derive(Debug, Clone)]
pub struct HostEventBridgeConfig {
    pub bind_retry_delay: Duration,
    pub poll_interval: Duration,
    /// Polling stays suspended this long after a conversation switch so the
    /// host can settle.
    pub switch_grace: Duration,
}

impl Default for HostEventBridgeConfig {
    fn default() -> Self {
        Self {
            bind_retry_delay: Duration::from_millis(DEFAULT_BIND_RETRY_DELAY_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            switch_grace: Duration::from_millis(DEFAULT_SWITCH_GRACE_MS),
        }
    }
}

/// Public struct `BridgePollReport` used across Opal components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgePollReport {
    pub polled_cycles: u64,
    pub suspended_cycles: u64,
    pub routed_messages: u64,
    pub conversation_switches: u64,
}

#[derive(Default)]
struct BridgePollReportInner {
    polled_cycles: AtomicU64,
    suspended_cycles: AtomicU64,
    routed_messages: AtomicU64,
    conversation_switches: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PollBaseline {
    conversation_id: Option<String>,
    message_count: usize,
}

/// Handle for the bridge background tasks; `shutdown` stops both cleanly.
pub struct BridgeHandle {
    bind_shutdown: oneshot::Sender<()>,
    poll_shutdown: oneshot::Sender<()>,
    bind_join: JoinHandle<()>,
    poll_join: JoinHandle<()>,
}

impl BridgeHandle {
    pub async fn shutdown(self) {
        let _ = self.bind_shutdown.send(());
        let _ = self.poll_shutdown.send(());
        let _ = self.bind_join.await;
        let _ = self.poll_join.await;
    }
}

/// Public struct `HostEventBridge` used across Opal components.
#[derive(Clone)]
pub struct HostEventBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    bus: EventBus,
    pipeline: Arc<MessagePipeline>,
    host: Arc<dyn HostContextProvider>,
    config: HostEventBridgeConfig,
    state: Mutex<BridgeState>,
    baseline: Mutex<Option<PollBaseline>>,
    suspended_until_unix_ms: AtomicU64,
    report: BridgePollReportInner,
}

impl HostEventBridge {
    pub fn new(
        bus: EventBus,
        pipeline: Arc<MessagePipeline>,
        host: Arc<dyn HostContextProvider>,
        config: HostEventBridgeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                bus,
                pipeline,
                host,
                config,
                state: Mutex::new(BridgeState::Unbound),
                baseline: Mutex::new(None),
                suspended_until_unix_ms: AtomicU64::new(0),
                report: BridgePollReportInner::default(),
            }),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn poll_report(&self) -> BridgePollReport {
        BridgePollReport {
            polled_cycles: self.inner.report.polled_cycles.load(Ordering::Relaxed),
            suspended_cycles: self.inner.report.suspended_cycles.load(Ordering::Relaxed),
            routed_messages: self.inner.report.routed_messages.load(Ordering::Relaxed),
            conversation_switches: self
                .inner
                .report
                .conversation_switches
                .load(Ordering::Relaxed),
        }
    }

    /// Spawns the bind-retry task and the polling fallback task.
    pub fn start(&self) -> BridgeHandle {
        let (bind_tx, mut bind_rx) = oneshot::channel::<()>();
        let bind_inner = Arc::clone(&self.inner);
        let bind_join = tokio::spawn(async move {
            loop {
                if let Some(context) = bind_inner.host.context().await {
                    bind_inner.bind(context);
                    let _ = bind_inner.bus.emit(EVENT_SYSTEM_READY, json!({}));
                    break;
                }
                debug!("host context unavailable; retrying bind");
                tokio::select! {
                    _ = &mut bind_rx => return,
                    _ = tokio::time::sleep(bind_inner.config.bind_retry_delay) => {}
                }
            }
        });

        let (poll_tx, mut poll_rx) = oneshot::channel::<()>();
        let poll_inner = Arc::clone(&self.inner);
        let poll_join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_inner.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut poll_rx => break,
                    _ = ticker.tick() => poll_inner.poll_once().await,
                }
            }
        });

        BridgeHandle {
            bind_shutdown: bind_tx,
            poll_shutdown: poll_tx,
            bind_join,
            poll_join,
        }
    }

    /// Attempts one bind immediately; used where retry timing is external.
    pub async fn bind_now(&self) -> bool {
        match self.inner.host.context().await {
            Some(context) => {
                self.inner.bind(context);
                let _ = self.inner.bus.emit(EVENT_SYSTEM_READY, json!({}));
                true
            }
            None => false,
        }
    }

    /// Runs one polling-fallback cycle immediately.
    pub async fn poll_now(&self) {
        self.inner.poll_once().await;
    }
}

impl BridgeInner {
    fn bind(self: &Arc<Self>, context: HostContextSnapshot) {
        self.set_state(BridgeState::Bound);
        for name in &context.proxied_event_names {
            if MESSAGE_LIFECYCLE_EVENTS.contains(&name.as_str()) {
                continue;
            }
            let bus = self.bus.clone();
            let proxied = name.clone();
            context.event_source.on(
                name,
                Arc::new(move |payload| {
                    let _ = bus.emit(&proxied, payload);
                }),
            );
        }
        for name in MESSAGE_LIFECYCLE_EVENTS {
            let inner = Arc::clone(self);
            let lifecycle = name.to_string();
            context.event_source.on(
                name,
                Arc::new(move |payload| {
                    let inner = Arc::clone(&inner);
                    let lifecycle = lifecycle.clone();
                    tokio::spawn(async move {
                        inner.route_lifecycle(&lifecycle, payload).await;
                    });
                }),
            );
        }
        self.set_state(BridgeState::Active);
        info!("host event bridge active");
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = next;
    }

    async fn route_lifecycle(&self, name: &str, payload: Value) {
        if name == EVENT_MESSAGE_DELETED {
            self.route_deletion(payload).await;
            return;
        }
        match self.pipeline.process_raw(&payload, false).await {
            PipelineOutcome::Stored { .. } => {
                // Only a successful store forwards the lifecycle event; plain
                // conversational turns never trigger downstream rendering.
                let _ = self.bus.emit(name, payload);
            }
            PipelineOutcome::Failed { reason } => {
                warn!(event = name, reason, "lifecycle message failed in pipeline");
            }
            PipelineOutcome::Skipped(reason) => {
                debug!(event = name, reason = reason.as_str(), "lifecycle message skipped");
            }
        }
    }

    async fn route_deletion(&self, payload: Value) {
        // The refreshed context is the secondary source of truth for the tail.
        let messages = match self.host.context().await {
            Some(context) => context.messages,
            None => Vec::new(),
        };
        let candidate = self.pipeline.handle_deletion(&payload, &messages).await;
        if !candidate.inferred_is_user {
            let _ = self.bus.emit(EVENT_MESSAGE_DELETED, payload);
        }
    }

    async fn poll_once(&self) {
        self.report.polled_cycles.fetch_add(1, Ordering::Relaxed);
        let now = current_unix_timestamp_ms();
        if now < self.suspended_until_unix_ms.load(Ordering::SeqCst) {
            self.report.suspended_cycles.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(context) = self.host.context().await else {
            return;
        };

        enum PollAction {
            Settle,
            Switch { conversation_id: Option<String> },
            NewMessages(Vec<ChatMessage>),
            None,
        }

        let action = {
            let mut baseline = self
                .baseline
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match baseline.as_mut() {
                None => {
                    // First sighting: remember the current length so
                    // pre-existing history is never reprocessed.
                    *baseline = Some(PollBaseline {
                        conversation_id: context.conversation_id.clone(),
                        message_count: context.messages.len(),
                    });
                    PollAction::Settle
                }
                Some(baseline) if baseline.conversation_id != context.conversation_id => {
                    // Reset to the new conversation's current length, never
                    // to zero.
                    baseline.conversation_id = context.conversation_id.clone();
                    baseline.message_count = context.messages.len();
                    PollAction::Switch {
                        conversation_id: context.conversation_id.clone(),
                    }
                }
                Some(baseline) if context.messages.len() > baseline.message_count => {
                    let fresh = context.messages[baseline.message_count..].to_vec();
                    baseline.message_count = context.messages.len();
                    PollAction::NewMessages(fresh)
                }
                Some(baseline) => {
                    baseline.message_count = context.messages.len();
                    PollAction::None
                }
            }
        };

        match action {
            PollAction::Settle | PollAction::None => {}
            PollAction::Switch { conversation_id } => {
                self.report
                    .conversation_switches
                    .fetch_add(1, Ordering::Relaxed);
                self.suspended_until_unix_ms.store(
                    now.saturating_add(
                        u64::try_from(self.config.switch_grace.as_millis()).unwrap_or(u64::MAX),
                    ),
                    Ordering::SeqCst,
                );
                self.pipeline.clear_processed_cache();
                let _ = self.bus.emit(
                    EVENT_CHAT_CHANGED,
                    json!({ "conversation_id": conversation_id }),
                );
            }
            PollAction::NewMessages(fresh) => {
                for message in fresh {
                    if !self.pipeline.has_complete_block(&message.content) {
                        continue;
                    }
                    let outcome = self.pipeline.process_message(&message, false).await;
                    if outcome.is_stored() {
                        self.report.routed_messages.fetch_add(1, Ordering::Relaxed);
                        let forwarded = if message.is_host_authored {
                            EVENT_MESSAGE_RECEIVED
                        } else {
                            EVENT_MESSAGE_SENT
                        };
                        let _ = self.bus.emit(
                            forwarded,
                            json!({
                                "mes": message.content,
                                "messageId": message.identity,
                                "is_user": !message.is_host_authored,
                                "polled": true,
                            }),
                        );
                    }
                }
            }
        }
    }
}
