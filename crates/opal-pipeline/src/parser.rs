//! Data-block parsing collaborator contract and the default JSON parser.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Enumerates supported `ParseFailure` values.
#[derive(Debug, Error)]
pub enum ParseFailure {
    #[error("data block is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("data block root must be an object")]
    NotAnObject,
    #[error("panel '{panel}' must map field names to values")]
    InvalidPanelShape { panel: String },
}

/// Public struct `PanelFieldValue` used across Opal components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PanelFieldValue {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

pub type PanelFields = BTreeMap<String, PanelFieldValue>;

/// Parse result: true panel data separated from operation markers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBlock {
    pub panels: BTreeMap<String, PanelFields>,
    pub operations: Vec<Value>,
}

/// Trait contract for data-block parsing collaborators.
pub trait BlockParser: Send + Sync {
    fn parse(&self, block: &str) -> Result<ParsedBlock, ParseFailure>;
}

/// Trait contract for executing operation-style payloads found in a block.
///
/// Operations are delegated here instead of being merged into panel state.
#[async_trait::async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operations: &[Value]) -> anyhow::Result<()>;
}

/// Operation executor that acknowledges and discards operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOperationExecutor;

#[async_trait::async_trait]
impl OperationExecutor for NoopOperationExecutor {
    async fn execute(&self, _operations: &[Value]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Default parser: the block interior is a JSON object mapping panel names to
/// field objects. A top-level `operations` array is split out for the
/// executor; keys prefixed with `__` are metadata markers and are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBlockParser;

impl BlockParser for JsonBlockParser {
    fn parse(&self, block: &str) -> Result<ParsedBlock, ParseFailure> {
        let root: Value = serde_json::from_str(block.trim())
            .map_err(|error| ParseFailure::InvalidJson(error.to_string()))?;
        let Value::Object(entries) = root else {
            return Err(ParseFailure::NotAnObject);
        };
        let mut parsed = ParsedBlock::default();
        for (key, value) in entries {
            if key == "operations" {
                if let Value::Array(operations) = value {
                    parsed.operations.extend(operations);
                }
                continue;
            }
            if key.starts_with("__") {
                continue;
            }
            let Value::Object(fields) = value else {
                return Err(ParseFailure::InvalidPanelShape { panel: key });
            };
            let mut panel_fields = PanelFields::new();
            for (field, field_value) in fields {
                panel_fields.insert(field, parse_field_value(field_value));
            }
            parsed.panels.insert(key, panel_fields);
        }
        Ok(parsed)
    }
}

fn parse_field_value(value: Value) -> PanelFieldValue {
    // `{"value": ..., "rule": ...}` is the long form; anything else is a
    // bare value with no rule.
    if let Value::Object(ref entries) = value {
        if let Some(inner) = entries.get("value") {
            let rule = entries
                .get("rule")
                .and_then(Value::as_str)
                .map(str::to_string);
            return PanelFieldValue {
                value: inner.clone(),
                rule,
            };
        }
    }
    PanelFieldValue { value, rule: None }
}
