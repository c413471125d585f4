//! Collaborator contract for the host application's context and event source.
//!
//! The bridge never reaches ambient host globals; the provider is injected
//! and queried, and binding retries while it reports no context.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use opal_pipeline::ChatMessage;

/// Callback the host invokes with a raw notification payload.
pub type HostNotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Trait contract for the host's native event source.
pub trait HostEventSource: Send + Sync {
    fn on(&self, name: &str, handler: HostNotificationHandler);
}

/// Snapshot of the host context at query time.
#[derive(Clone)]
pub struct HostContextSnapshot {
    pub event_source: Arc<dyn HostEventSource>,
    /// Host event names proxied verbatim onto the internal bus.
    pub proxied_event_names: Vec<String>,
    pub conversation_id: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// Trait contract for querying the host context.
#[async_trait]
pub trait HostContextProvider: Send + Sync {
    /// Returns the live context, or `None` while the host is not ready.
    async fn context(&self) -> Option<HostContextSnapshot>;
}
