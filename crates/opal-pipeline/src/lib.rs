//! Message-driven extraction pipeline for Opal.
//!
//! For each candidate message: detect a complete embedded data block,
//! deduplicate by message identity, parse through the collaborator parser,
//! and merge parsed panel data into the persisted per-conversation state.
//! Parse failure preserves existing state and emits a diagnostic instead of
//! clearing data. Deletions are classified by the inference engine before any
//! rollback becomes eligible.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde_json::{json, Value};
use tracing::{debug, warn};

use opal_core::{current_unix_timestamp_ms, fallback_message_identity, sha256_hex};
use opal_events::{EventBus, EVENT_DATA_STORED, EVENT_PARSE_FAILED, EVENT_ROLLBACK_ELIGIBLE};

mod chat_state;
mod data_block;
mod deletion;
mod parser;

pub use chat_state::{
    AlwaysEnabled, ChatState, ChatStateStore, FieldChange, HistoryEntry, MemoryChatStateStore,
    PluginConfig,
};
pub use data_block::{
    extract_data_block, extract_is_host_authored, extract_message_content,
    extract_message_identity, extract_message_timestamp, has_complete_data_block, ChatMessage,
    CONTENT_FIELD_CANDIDATES, DATA_BLOCK_CLOSE_TAG, DATA_BLOCK_OPEN_TAG,
};
pub use deletion::{
    DeletionCandidate, DeletionInferenceEngine, InferenceConfidence, InferenceStrategy,
    DELETION_IDENTITY_FIELDS,
};
pub use parser::{
    BlockParser, JsonBlockParser, NoopOperationExecutor, OperationExecutor, PanelFieldValue,
    PanelFields, ParseFailure, ParsedBlock,
};


const DEFAULT_HISTORY_CAP: usize = 100;
const DEFAULT_HISTORY_TRIM_TO: usize = 50;

/// Enumerates supported `PipelineSkipReason` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineSkipReason {
    PluginDisabled,
    NoContent,
    NoDataBlock,
    NoPanelData,
    AlreadyProcessed,
    NoConversation,
}

impl PipelineSkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PluginDisabled => "plugin_disabled",
            Self::NoContent => "no_content",
            Self::NoDataBlock => "no_data_block",
            Self::NoPanelData => "no_panel_data",
            Self::AlreadyProcessed => "already_processed",
            Self::NoConversation => "no_conversation",
        }
    }
}

/// Enumerates supported `PipelineOutcome` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Skipped(PipelineSkipReason),
    Stored { panels: Vec<String> },
    Failed { reason: String },
}

impl PipelineOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// Cache entry preventing re-processing of an already-handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMessageRecord {
    pub message_identity: String,
    pub block_hash: String,
    pub result_hash: Option<String>,
}

/// Public struct `PipelineMetrics` used across Opal components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub processed: u64,
    pub stored: u64,
    pub skipped: u64,
    pub parse_failures: u64,
}

#[derive(Default)]
struct PipelineMetricsInner {
    processed: AtomicU64,
    stored: AtomicU64,
    skipped: AtomicU64,
    parse_failures: AtomicU64,
}

/// Public struct `PipelineConfig` used across Opal components.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub open_tag: String,
    pub close_tag: String,
    pub content_fields: Vec<String>,
    pub history_cap: usize,
    pub history_trim_to: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            open_tag: DATA_BLOCK_OPEN_TAG.to_string(),
            close_tag: DATA_BLOCK_CLOSE_TAG.to_string(),
            content_fields: CONTENT_FIELD_CANDIDATES
                .iter()
                .map(|field| field.to_string())
                .collect(),
            history_cap: DEFAULT_HISTORY_CAP,
            history_trim_to: DEFAULT_HISTORY_TRIM_TO,
        }
    }
}

/// Public struct `MessagePipeline` used across Opal components.
pub struct MessagePipeline {
    bus: EventBus,
    store: Arc<dyn ChatStateStore>,
    plugin_config: Arc<dyn PluginConfig>,
    parser: Arc<dyn BlockParser>,
    operations: Arc<dyn OperationExecutor>,
    engine: DeletionInferenceEngine,
    config: PipelineConfig,
    processed: Mutex<HashMap<String, ProcessedMessageRecord>>,
    merge_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: PipelineMetricsInner,
}

impl MessagePipeline {
    pub fn new(
        bus: EventBus,
        store: Arc<dyn ChatStateStore>,
        plugin_config: Arc<dyn PluginConfig>,
        parser: Arc<dyn BlockParser>,
        operations: Arc<dyn OperationExecutor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            bus,
            store,
            plugin_config,
            parser,
            operations,
            engine: DeletionInferenceEngine,
            config,
            processed: Mutex::new(HashMap::new()),
            merge_locks: Mutex::new(HashMap::new()),
            metrics: PipelineMetricsInner::default(),
        }
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            processed: self.metrics.processed.load(Ordering::Relaxed),
            stored: self.metrics.stored.load(Ordering::Relaxed),
            skipped: self.metrics.skipped.load(Ordering::Relaxed),
            parse_failures: self.metrics.parse_failures.load(Ordering::Relaxed),
        }
    }

    /// Returns true when `content` carries a complete data block.
    pub fn has_complete_block(&self, content: &str) -> bool {
        has_complete_data_block(content, &self.config.open_tag, &self.config.close_tag)
    }

    /// Clears the processed-message cache; called on conversation switch and
    /// by the soft-reset circuit breaker. Idle per-conversation merge locks
    /// are pruned with it; a lock held by an in-flight merge survives.
    pub fn clear_processed_cache(&self) {
        let mut processed = self
            .processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !processed.is_empty() {
            debug!(entries = processed.len(), "clearing processed-message cache");
        }
        processed.clear();
        let mut locks = self
            .merge_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn merge_lock_count(&self) -> usize {
        self.merge_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Hooks the processed-message cache into the bus soft-reset breaker, so
    /// a tripped failure threshold clears this transient cache.
    pub fn install_soft_reset_hook(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bus.on_soft_reset(move || {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.clear_processed_cache();
            }
        });
    }

    /// Normalizes a loose host payload into a `ChatMessage` and processes it.
    pub async fn process_raw(&self, raw: &Value, force: bool) -> PipelineOutcome {
        let candidates: Vec<&str> = self
            .config
            .content_fields
            .iter()
            .map(String::as_str)
            .collect();
        let Some(content) = extract_message_content(raw, &candidates) else {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::Skipped(PipelineSkipReason::NoContent);
        };
        let message = ChatMessage {
            identity: extract_message_identity(raw),
            content,
            is_host_authored: extract_is_host_authored(raw),
            timestamp_unix_ms: extract_message_timestamp(raw),
        };
        self.process_message(&message, force).await
    }

    /// Single idempotent entry point for both live and polled candidates.
    pub async fn process_message(&self, message: &ChatMessage, force: bool) -> PipelineOutcome {
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        if !self.plugin_config.is_plugin_enabled() {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::Skipped(PipelineSkipReason::PluginDisabled);
        }
        if message.content.is_empty() {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::Skipped(PipelineSkipReason::NoContent);
        }
        let Some(block) =
            extract_data_block(&message.content, &self.config.open_tag, &self.config.close_tag)
        else {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::Skipped(PipelineSkipReason::NoDataBlock);
        };

        // The fallback must be stable across delivery paths, so it hashes the
        // content plus the host-reported timestamp, never the local clock.
        let identity = message.identity.clone().unwrap_or_else(|| {
            fallback_message_identity(&message.content, message.timestamp_unix_ms.unwrap_or(0))
        });
        let block_hash = sha256_hex(block);
        if !force && self.is_already_processed(&identity, &block_hash) {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::Skipped(PipelineSkipReason::AlreadyProcessed);
        }

        let parsed = match self.parser.parse(block) {
            Ok(parsed) => parsed,
            Err(failure) => {
                // Non-destructive policy: existing state is never cleared on
                // a bad block.
                self.metrics.parse_failures.fetch_add(1, Ordering::Relaxed);
                self.record_processed(&identity, &block_hash, None);
                let _ = self.bus.emit(
                    EVENT_PARSE_FAILED,
                    json!({
                        "message_identity": identity,
                        "reason": failure.to_string(),
                    }),
                );
                return PipelineOutcome::Failed {
                    reason: failure.to_string(),
                };
            }
        };

        if !parsed.operations.is_empty() {
            if let Err(error) = self.operations.execute(&parsed.operations).await {
                warn!(%error, "operation executor failed; continuing with panel merge");
            }
        }
        if parsed.panels.is_empty() {
            self.record_processed(&identity, &block_hash, None);
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::Skipped(PipelineSkipReason::NoPanelData);
        }

        let Some(conversation_id) = self.store.current_conversation_id() else {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::Skipped(PipelineSkipReason::NoConversation);
        };

        match self.merge_parsed(&conversation_id, &identity, &parsed).await {
            Ok(panels) if panels.is_empty() => {
                self.record_processed(&identity, &block_hash, None);
                self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
                PipelineOutcome::Skipped(PipelineSkipReason::NoPanelData)
            }
            Ok(panels) => {
                let result_hash = sha256_hex(&format!("{parsed:?}"));
                self.record_processed(&identity, &block_hash, Some(result_hash));
                self.metrics.stored.fetch_add(1, Ordering::Relaxed);
                let _ = self.bus.emit(
                    EVENT_DATA_STORED,
                    json!({
                        "conversation_id": conversation_id,
                        "message_identity": identity,
                        "panels": panels,
                    }),
                );
                PipelineOutcome::Stored { panels }
            }
            Err(error) => {
                warn!(%error, conversation_id, "panel merge failed; state preserved");
                PipelineOutcome::Failed {
                    reason: error.to_string(),
                }
            }
        }
    }

    /// Classifies a deletion and, when rollback-eligible, reverts history
    /// contributions and emits the downstream event.
    pub async fn handle_deletion(
        &self,
        notification: &Value,
        messages: &[ChatMessage],
    ) -> DeletionCandidate {
        let candidate = self.engine.classify(notification, messages);
        debug!(
            strategy = candidate.strategy.as_str(),
            confidence = candidate.confidence.as_str(),
            inferred_is_user = candidate.inferred_is_user,
            "deletion classified"
        );
        if candidate.inferred_is_user {
            // User-authored deletions never warrant a rollback.
            return candidate;
        }
        // The refreshed tail no longer contains the deleted message, so the
        // newest history entry missing from it names the contribution to
        // revert.
        let tail = tail_identities(messages);
        if let Some(identity) = self.latest_vanished_identity(&tail).await {
            match self.apply_rollback(&identity).await {
                Ok(true) => debug!(%identity, "reverted deleted message contribution"),
                Ok(false) => {}
                Err(error) => warn!(%error, %identity, "rollback application failed"),
            }
        }
        let _ = self
            .bus
            .emit(EVENT_ROLLBACK_ELIGIBLE, candidate.to_payload());
        candidate
    }

    async fn latest_vanished_identity(&self, tail: &HashSet<String>) -> Option<String> {
        let conversation_id = self.store.current_conversation_id()?;
        let state = self.store.state(&conversation_id).await.ok()?;
        state
            .history
            .iter()
            .rev()
            .find(|entry| !tail.contains(&entry.message_identity))
            .map(|entry| entry.message_identity.clone())
    }

    /// Reverts the panel contributions recorded in history for one message.
    ///
    /// Returns true when any entry was reverted. Only fields attributed to
    /// the message are touched.
    pub async fn apply_rollback(&self, message_identity: &str) -> anyhow::Result<bool> {
        let Some(conversation_id) = self.store.current_conversation_id() else {
            return Ok(false);
        };
        let lock = self.merge_lock(&conversation_id);
        let _guard = lock.lock().await;

        let mut state = self.store.state(&conversation_id).await?;
        let mut reverted = false;
        let mut remaining = Vec::with_capacity(state.history.len());
        for entry in state.history.drain(..) {
            if entry.message_identity != message_identity {
                remaining.push(entry);
                continue;
            }
            for change in entry.changes.iter().rev() {
                let panel = state.panels.entry(change.panel.clone()).or_default();
                match &change.previous {
                    Some(previous) => {
                        panel.insert(change.field.clone(), previous.clone());
                    }
                    None => {
                        panel.remove(&change.field);
                    }
                }
                if panel.is_empty() {
                    state.panels.remove(&change.panel);
                }
            }
            reverted = true;
        }
        if !reverted {
            return Ok(false);
        }
        state.history = remaining;
        state.last_updated_unix_ms = current_unix_timestamp_ms();
        self.store.set_state(&conversation_id, state).await?;
        Ok(true)
    }

    async fn merge_parsed(
        &self,
        conversation_id: &str,
        message_identity: &str,
        parsed: &ParsedBlock,
    ) -> anyhow::Result<Vec<String>> {
        // Merges for one conversation are serialized; two concurrent merges
        // to the same state would race.
        let lock = self.merge_lock(conversation_id);
        let _guard = lock.lock().await;

        let mut state = self.store.state(conversation_id).await?;
        let mut changes = Vec::new();
        let mut panel_names = Vec::new();
        for (panel, incoming) in &parsed.panels {
            let existing = state.panels.get(panel).cloned().unwrap_or_default();
            let merged = self
                .store
                .merge_enabled_fields(panel, &existing, incoming);
            let mut panel_changes = Vec::new();
            for (field, applied) in &merged {
                let previous = existing.get(field);
                if previous != Some(applied) {
                    panel_changes.push(FieldChange {
                        panel: panel.clone(),
                        field: field.clone(),
                        previous: previous.cloned(),
                        applied: applied.clone(),
                    });
                }
            }
            // A panel whose fields were all filtered out or unchanged leaves
            // no trace in the report or the history log.
            if panel_changes.is_empty() {
                continue;
            }
            changes.extend(panel_changes);
            panel_names.push(panel.clone());
            state.panels.insert(panel.clone(), merged);
        }
        if panel_names.is_empty() {
            return Ok(Vec::new());
        }

        state.last_updated_unix_ms = current_unix_timestamp_ms();
        state.history.push(HistoryEntry {
            timestamp_unix_ms: state.last_updated_unix_ms,
            message_identity: message_identity.to_string(),
            panels: panel_names.clone(),
            changes,
        });
        if state.history.len() > self.config.history_cap {
            let keep_from = state.history.len() - self.config.history_trim_to;
            state.history.drain(..keep_from);
        }

        self.store.set_state(conversation_id, state).await?;
        Ok(panel_names)
    }

    fn merge_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .merge_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn is_already_processed(&self, identity: &str, block_hash: &str) -> bool {
        let processed = self
            .processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A fresher update to the same message (different block content)
        // invalidates the record.
        processed
            .get(identity)
            .is_some_and(|record| record.block_hash == block_hash)
    }

    fn record_processed(&self, identity: &str, block_hash: &str, result_hash: Option<String>) {
        let mut processed = self
            .processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        processed.insert(
            identity.to_string(),
            ProcessedMessageRecord {
                message_identity: identity.to_string(),
                block_hash: block_hash.to_string(),
                result_hash,
            },
        );
    }
}

/// Identities of the visible tail, resolved exactly as `process_message`
/// resolves them so history entries can be matched against the tail.
fn tail_identities(messages: &[ChatMessage]) -> HashSet<String> {
    messages
        .iter()
        .map(|message| {
            message.identity.clone().unwrap_or_else(|| {
                fallback_message_identity(
                    &message.content,
                    message.timestamp_unix_ms.unwrap_or(0),
                )
            })
        })
        .collect()
}
