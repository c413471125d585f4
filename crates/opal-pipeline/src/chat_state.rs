//! Per-conversation chat state and the store collaborator contract.
//!
//! The pipeline never owns this state; it reads and conditionally writes it
//! through `ChatStateStore`. An in-memory store ships for tests and direct
//! embedding.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use opal_core::current_unix_timestamp_ms;
use opal_events::{EventBus, EVENT_DATA_CHANGED};

use crate::parser::PanelFields;

/// One field-level change applied by a merge, with enough context to revert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub panel: String,
    pub field: String,
    pub previous: Option<Value>,
    pub applied: Value,
}

/// Public struct `HistoryEntry` used across Opal components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub timestamp_unix_ms: u64,
    pub message_identity: String,
    pub panels: Vec<String>,
    pub changes: Vec<FieldChange>,
}

/// Public struct `ChatState` used across Opal components.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatState {
    #[serde(default)]
    pub panels: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub last_updated_unix_ms: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Trait contract for the external per-conversation state store.
#[async_trait]
pub trait ChatStateStore: Send + Sync {
    fn current_conversation_id(&self) -> Option<String>;
    async fn state(&self, conversation_id: &str) -> anyhow::Result<ChatState>;
    /// Persists `state`; the store fires its own change notification.
    async fn set_state(&self, conversation_id: &str, state: ChatState) -> anyhow::Result<()>;
    /// Merges `incoming` into `existing` for one panel, filtered by which
    /// fields are currently enabled.
    fn merge_enabled_fields(
        &self,
        panel: &str,
        existing: &BTreeMap<String, Value>,
        incoming: &PanelFields,
    ) -> BTreeMap<String, Value>;
}

/// Trait contract for host-side plugin configuration.
pub trait PluginConfig: Send + Sync {
    fn is_plugin_enabled(&self) -> bool;
}

/// Plugin configuration that is always enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl PluginConfig for AlwaysEnabled {
    fn is_plugin_enabled(&self) -> bool {
        true
    }
}

/// In-memory reference store.
///
/// Field filtering: with no filter installed every field is enabled; an
/// installed filter enables only the listed fields per panel.
pub struct MemoryChatStateStore {
    bus: Option<EventBus>,
    states: Mutex<HashMap<String, ChatState>>,
    current_conversation: Mutex<Option<String>>,
    enabled_fields: Mutex<Option<HashMap<String, HashSet<String>>>>,
}

impl MemoryChatStateStore {
    pub fn new(bus: Option<EventBus>) -> Self {
        Self {
            bus,
            states: Mutex::new(HashMap::new()),
            current_conversation: Mutex::new(None),
            enabled_fields: Mutex::new(None),
        }
    }

    pub fn set_current_conversation(&self, conversation_id: Option<&str>) {
        let mut current = self
            .current_conversation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = conversation_id.map(str::to_string);
    }

    pub fn set_enabled_fields(&self, filter: Option<HashMap<String, HashSet<String>>>) {
        let mut enabled = self
            .enabled_fields
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *enabled = filter;
    }
}

#[async_trait]
impl ChatStateStore for MemoryChatStateStore {
    fn current_conversation_id(&self) -> Option<String> {
        self.current_conversation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn state(&self, conversation_id: &str) -> anyhow::Result<ChatState> {
        let states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(states.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn set_state(&self, conversation_id: &str, state: ChatState) -> anyhow::Result<()> {
        {
            let mut states = self
                .states
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            states.insert(conversation_id.to_string(), state);
        }
        if let Some(bus) = &self.bus {
            let _ = bus.emit(
                EVENT_DATA_CHANGED,
                json!({
                    "conversation_id": conversation_id,
                    "timestamp_unix_ms": current_unix_timestamp_ms(),
                }),
            );
        }
        Ok(())
    }

    fn merge_enabled_fields(
        &self,
        panel: &str,
        existing: &BTreeMap<String, Value>,
        incoming: &PanelFields,
    ) -> BTreeMap<String, Value> {
        let enabled = self
            .enabled_fields
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut merged = existing.clone();
        for (field, field_value) in incoming {
            let allowed = match enabled.as_ref() {
                None => true,
                Some(filter) => filter
                    .get(panel)
                    .map(|fields| fields.contains(field))
                    .unwrap_or(false),
            };
            if allowed {
                merged.insert(field.clone(), field_value.value.clone());
            }
        }
        merged
    }
}
