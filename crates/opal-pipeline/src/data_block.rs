//! Data-block detection and message-content extraction.
//!
//! A data block is the substring delimited by a fixed tag pair; only a
//! complete block (both tags present, close after open) counts. Host message
//! payloads are loose JSON, so content is pulled from a prioritized list of
//! candidate fields with a nested `data` object as the fallback.

use serde_json::Value;

pub const DATA_BLOCK_OPEN_TAG: &str = "<data>";
pub const DATA_BLOCK_CLOSE_TAG: &str = "</data>";

/// Candidate content fields, probed in priority order.
pub const CONTENT_FIELD_CANDIDATES: &[&str] = &["mes", "content", "message", "text"];

/// Conversational message as seen by the pipeline.
///
/// Identity may be absent or unstable; content is the only field that is
/// always available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub identity: Option<String>,
    pub content: String,
    pub is_host_authored: bool,
    /// Host-reported timestamp, when one was delivered; feeds the fallback
    /// identity so live and polled sightings of the same message agree.
    pub timestamp_unix_ms: Option<u64>,
}

impl ChatMessage {
    pub fn host(identity: Option<&str>, content: impl Into<String>) -> Self {
        Self {
            identity: identity.map(str::to_string),
            content: content.into(),
            is_host_authored: true,
            timestamp_unix_ms: None,
        }
    }

    pub fn user(identity: Option<&str>, content: impl Into<String>) -> Self {
        Self {
            identity: identity.map(str::to_string),
            content: content.into(),
            is_host_authored: false,
            timestamp_unix_ms: None,
        }
    }
}

/// Returns the interior of the first complete data block in `content`.
///
/// An opening tag without a matching close after it is treated as "no block";
/// incomplete blocks are never queued for later completion. At most one block
/// per message is processed.
pub fn extract_data_block<'a>(content: &'a str, open_tag: &str, close_tag: &str) -> Option<&'a str> {
    let open_at = content.find(open_tag)?;
    let body_start = open_at + open_tag.len();
    let close_rel = content[body_start..].find(close_tag)?;
    Some(&content[body_start..body_start + close_rel])
}

/// Returns true when `content` carries a complete data block.
pub fn has_complete_data_block(content: &str, open_tag: &str, close_tag: &str) -> bool {
    extract_data_block(content, open_tag, close_tag).is_some()
}

/// Extracts message text from a loose host payload.
///
/// Probes `candidates` on the top level first, then the same fields inside a
/// nested `data` object.
pub fn extract_message_content(raw: &Value, candidates: &[&str]) -> Option<String> {
    if let Some(text) = probe_string_fields(raw, candidates) {
        return Some(text);
    }
    raw.get("data")
        .and_then(|nested| probe_string_fields(nested, candidates))
}

fn probe_string_fields(value: &Value, candidates: &[&str]) -> Option<String> {
    let object = value.as_object()?;
    for field in candidates {
        if let Some(text) = object.get(*field).and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

/// Reads the host-author flag from a loose payload; defaults to host-authored.
pub fn extract_is_host_authored(raw: &Value) -> bool {
    for field in ["is_user", "isUser"] {
        if let Some(flag) = raw.get(field).and_then(Value::as_bool) {
            return !flag;
        }
    }
    true
}

/// Reads a host-reported message timestamp from a loose payload.
pub fn extract_message_timestamp(raw: &Value) -> Option<u64> {
    for field in ["send_date", "timestamp", "timestamp_unix_ms"] {
        if let Some(stamp) = raw.get(field).and_then(Value::as_u64) {
            return Some(stamp);
        }
    }
    None
}

/// Reads a stable message identity from a loose payload when one exists.
pub fn extract_message_identity(raw: &Value) -> Option<String> {
    for field in ["messageId", "id", "mesId"] {
        match raw.get(field) {
            Some(Value::String(text)) if !text.is_empty() => return Some(text.clone()),
            Some(Value::Number(number)) => return Some(number.to_string()),
            _ => {}
        }
    }
    None
}
