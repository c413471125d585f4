//! Heuristic classification of unreliable deletion notifications.
//!
//! A deletion notification may be a bare index, an object carrying one of
//! several index-like fields, or nothing identifiable. Every path resolves to
//! a definite classification tagged with the strategy that fired, so logs and
//! tests can tell "resolved by index" from "inferred by position". Only
//! host-authored (generated) messages warrant a state rollback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data_block::ChatMessage;

/// Candidate identity fields probed on object notifications, in order.
pub const DELETION_IDENTITY_FIELDS: &[&str] = &["index", "messageId", "id", "mesId"];

/// Enumerates supported `InferenceStrategy` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStrategy {
    DirectIndex,
    FieldProbe,
    PositionalAfterUser,
    PositionalTail,
    EmptyDefault,
}

impl InferenceStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectIndex => "direct_index",
            Self::FieldProbe => "field_probe",
            Self::PositionalAfterUser => "positional_after_user",
            Self::PositionalTail => "positional_tail",
            Self::EmptyDefault => "empty_default",
        }
    }
}

/// Enumerates supported `InferenceConfidence` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceConfidence {
    Low,
    Medium,
    High,
}

impl InferenceConfidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Public struct `DeletionCandidate` used across Opal components.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionCandidate {
    pub raw_notification: Value,
    pub inferred_is_user: bool,
    pub strategy: InferenceStrategy,
    pub confidence: InferenceConfidence,
    pub note: String,
    /// Identity of the message the classification was read from, when a
    /// strategy resolved an actual message; lets rollback target history.
    pub resolved_identity: Option<String>,
}

impl DeletionCandidate {
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "raw_notification": self.raw_notification,
            "inferred_is_user": self.inferred_is_user,
            "strategy": self.strategy.as_str(),
            "confidence": self.confidence.as_str(),
            "note": self.note,
            "resolved_identity": self.resolved_identity,
        })
    }
}

/// Public struct `DeletionInferenceEngine` used across Opal components.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletionInferenceEngine;

impl DeletionInferenceEngine {
    /// Classifies a deletion notification against the current conversation
    /// tail (the secondary source of truth).
    pub fn classify(&self, notification: &Value, messages: &[ChatMessage]) -> DeletionCandidate {
        if let Some(index) = notification.as_u64().and_then(|raw| usize::try_from(raw).ok()) {
            if let Some(message) = messages.get(index) {
                return resolved(
                    notification,
                    message,
                    InferenceStrategy::DirectIndex,
                    InferenceConfidence::High,
                    format!("bare index {index} resolved in conversation"),
                );
            }
        }

        if notification.is_object() {
            for field in DELETION_IDENTITY_FIELDS {
                let Some(index) = index_from_field(notification.get(*field)) else {
                    continue;
                };
                if let Some(message) = messages.get(index) {
                    return resolved(
                        notification,
                        message,
                        InferenceStrategy::FieldProbe,
                        InferenceConfidence::High,
                        format!("field '{field}' resolved to index {index}"),
                    );
                }
            }
        }

        match messages.last() {
            Some(last) if !last.is_host_authored => DeletionCandidate {
                raw_notification: notification.clone(),
                inferred_is_user: false,
                strategy: InferenceStrategy::PositionalAfterUser,
                confidence: InferenceConfidence::Medium,
                note: "tail ends with a user message; deleted reply inferred after it".to_string(),
                resolved_identity: None,
            },
            Some(_) => DeletionCandidate {
                raw_notification: notification.clone(),
                inferred_is_user: false,
                strategy: InferenceStrategy::PositionalTail,
                confidence: InferenceConfidence::Medium,
                note: "deleted message inferred at the conversation tail".to_string(),
                resolved_identity: None,
            },
            // Deletions require rollback unless proven user-authored; with no
            // history left the safe default is host-authored.
            None => DeletionCandidate {
                raw_notification: notification.clone(),
                inferred_is_user: false,
                strategy: InferenceStrategy::EmptyDefault,
                confidence: InferenceConfidence::Low,
                note: "no conversation history; defaulting to host-authored".to_string(),
                resolved_identity: None,
            },
        }
    }
}

fn resolved(
    notification: &Value,
    message: &ChatMessage,
    strategy: InferenceStrategy,
    confidence: InferenceConfidence,
    note: String,
) -> DeletionCandidate {
    DeletionCandidate {
        raw_notification: notification.clone(),
        inferred_is_user: !message.is_host_authored,
        strategy,
        confidence,
        note,
        resolved_identity: message.identity.clone(),
    }
}

fn index_from_field(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::Number(number) => number.as_u64().and_then(|raw| usize::try_from(raw).ok()),
        Value::String(text) => text.parse::<usize>().ok(),
        _ => None,
    }
}
