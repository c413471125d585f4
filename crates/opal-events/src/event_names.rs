//! Closed catalogue of internal event names.
//!
//! Consumers subscribe by exact name; nothing in the bus itself interprets
//! these strings beyond routing.

/// Fired once the bridge has bound to the host context.
pub const EVENT_SYSTEM_READY: &str = "system:ready";
/// Fired by the state store after a persisted write.
pub const EVENT_DATA_CHANGED: &str = "data:changed";
/// Fired when the active conversation identity changes.
pub const EVENT_CHAT_CHANGED: &str = "chat:changed";
pub const EVENT_MESSAGE_RECEIVED: &str = "message:received";
pub const EVENT_MESSAGE_SENT: &str = "message:sent";
pub const EVENT_MESSAGE_RENDERED: &str = "message:rendered";
pub const EVENT_MESSAGE_DELETED: &str = "message:deleted";
pub const EVENT_MESSAGE_REGENERATED: &str = "message:regenerated";
/// Diagnostic: a data block was found but its parse failed; state untouched.
pub const EVENT_PARSE_FAILED: &str = "parse-failed";
/// A parsed block was merged and persisted for the current conversation.
pub const EVENT_DATA_STORED: &str = "data-stored";
/// A deletion classified as host-authored; downstream rollback is eligible.
pub const EVENT_ROLLBACK_ELIGIBLE: &str = "rollback:eligible";

/// Host message-lifecycle names the bridge intercepts into the pipeline.
pub const MESSAGE_LIFECYCLE_EVENTS: &[&str] = &[
    EVENT_MESSAGE_RECEIVED,
    EVENT_MESSAGE_SENT,
    EVENT_MESSAGE_RENDERED,
    EVENT_MESSAGE_DELETED,
    EVENT_MESSAGE_REGENERATED,
];
