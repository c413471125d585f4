//! End-to-end scenarios wiring the bus, bridge, and pipeline together.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use opal_bridge::{
    HostContextProvider, HostContextSnapshot, HostEventBridge, HostEventBridgeConfig,
    HostEventSource, HostNotificationHandler,
};
use opal_events::{
    EventBus, EventBusConfig, EVENT_DATA_STORED, EVENT_MESSAGE_RECEIVED, EVENT_PARSE_FAILED,
    EVENT_SYSTEM_READY,
};
use opal_pipeline::{
    AlwaysEnabled, ChatMessage, ChatStateStore, JsonBlockParser, MemoryChatStateStore,
    MessagePipeline, NoopOperationExecutor, PipelineConfig,
};

#[derive(Default)]
struct ScriptedHostSource {
    handlers: Mutex<HashMap<String, Vec<HostNotificationHandler>>>,
}

impl HostEventSource for ScriptedHostSource {
    fn on(&self, name: &str, handler: HostNotificationHandler) {
        self.handlers
            .lock()
            .expect("lock")
            .entry(name.to_string())
            .or_default()
            .push(handler);
    }
}

impl ScriptedHostSource {
    fn fire(&self, name: &str, payload: serde_json::Value) {
        let handlers = self.handlers.lock().expect("lock");
        if let Some(registered) = handlers.get(name) {
            for handler in registered {
                handler(payload.clone());
            }
        }
    }
}

struct ScriptedHost {
    source: Arc<ScriptedHostSource>,
    conversation: Mutex<Option<String>>,
    messages: Mutex<Vec<ChatMessage>>,
}

impl ScriptedHost {
    fn new() -> Self {
        Self {
            source: Arc::new(ScriptedHostSource::default()),
            conversation: Mutex::new(Some("conv-1".to_string())),
            messages: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HostContextProvider for ScriptedHost {
    async fn context(&self) -> Option<HostContextSnapshot> {
        Some(HostContextSnapshot {
            event_source: Arc::clone(&self.source) as Arc<dyn HostEventSource>,
            proxied_event_names: Vec::new(),
            conversation_id: self.conversation.lock().expect("lock").clone(),
            messages: self.messages.lock().expect("lock").clone(),
        })
    }
}

struct Harness {
    bus: EventBus,
    store: Arc<MemoryChatStateStore>,
    host: Arc<ScriptedHost>,
    bridge: HostEventBridge,
}

fn harness() -> Harness {
    opal_integration_tests::init_tracing();
    let bus = EventBus::new(EventBusConfig {
        queue_capacity: 64,
        drain_interval: Duration::from_millis(1),
        failure_threshold: 50,
    });
    let store = Arc::new(MemoryChatStateStore::new(Some(bus.clone())));
    store.set_current_conversation(Some("conv-1"));
    let pipeline = Arc::new(MessagePipeline::new(
        bus.clone(),
        Arc::clone(&store) as Arc<dyn ChatStateStore>,
        Arc::new(AlwaysEnabled),
        Arc::new(JsonBlockParser),
        Arc::new(NoopOperationExecutor),
        PipelineConfig::default(),
    ));
    let host = Arc::new(ScriptedHost::new());
    let bridge = HostEventBridge::new(
        bus.clone(),
        pipeline,
        Arc::clone(&host) as Arc<dyn HostContextProvider>,
        HostEventBridgeConfig {
            bind_retry_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            switch_grace: Duration::from_millis(40),
        },
    );
    Harness {
        bus,
        store,
        host,
        bridge,
    }
}

fn subscribe_counter(bus: &EventBus, name: &str) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = Arc::clone(&counter);
    bus.subscribe(name, move |_| {
        let counter = Arc::clone(&counter_clone);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .expect("subscribe");
    counter
}

#[tokio::test]
async fn incomplete_block_aborts_with_no_downstream_events() {
    let hx = harness();
    assert!(hx.bridge.bind_now().await);
    let stored = subscribe_counter(&hx.bus, EVENT_DATA_STORED);
    let forwarded = subscribe_counter(&hx.bus, EVENT_MESSAGE_RECEIVED);

    hx.host.source.fire(
        EVENT_MESSAGE_RECEIVED,
        json!({ "messageId": "m1", "mes": "hello <data>X world" }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    hx.bus.drain_now().await;

    assert_eq!(stored.load(Ordering::SeqCst), 0);
    assert_eq!(forwarded.load(Ordering::SeqCst), 0);
    let state = hx.store.state("conv-1").await.expect("state");
    assert!(state.panels.is_empty());
}

#[tokio::test]
async fn complete_block_lands_in_chat_state_and_fires_data_stored() {
    let hx = harness();
    assert!(hx.bridge.bind_now().await);

    let drain = hx.bus.start_drain();
    let waiter = {
        let bus = hx.bus.clone();
        tokio::spawn(async move { bus.wait_for(EVENT_DATA_STORED, Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    hx.host.source.fire(
        EVENT_MESSAGE_RECEIVED,
        json!({
            "messageId": "m1",
            "mes": "hello <data>{\"panelA\":{\"field1\":\"value1\"}}</data> world",
        }),
    );

    let envelope = waiter.await.expect("join").expect("wait_for");
    assert_eq!(envelope.payload["panels"], json!(["panelA"]));

    let state = hx.store.state("conv-1").await.expect("state");
    assert_eq!(state.panels["panelA"]["field1"], json!("value1"));
    drain.shutdown().await;
}

#[tokio::test]
async fn parse_failure_leaves_state_untouched_and_reports_identity() {
    let hx = harness();
    assert!(hx.bridge.bind_now().await);

    hx.host.source.fire(
        EVENT_MESSAGE_RECEIVED,
        json!({
            "messageId": "good",
            "mes": "a <data>{\"panelA\":{\"field1\":\"value1\"}}</data> b",
        }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = hx.store.state("conv-1").await.expect("state");

    let drain = hx.bus.start_drain();
    let waiter = {
        let bus = hx.bus.clone();
        tokio::spawn(async move { bus.wait_for(EVENT_PARSE_FAILED, Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    hx.host.source.fire(
        EVENT_MESSAGE_RECEIVED,
        json!({ "messageId": "bad", "mes": "a <data>{broken</data> b" }),
    );
    let envelope = waiter.await.expect("join").expect("wait_for");
    assert_eq!(envelope.payload["message_identity"], "bad");

    let after = hx.store.state("conv-1").await.expect("state");
    assert_eq!(before, after);
    drain.shutdown().await;
}

#[tokio::test]
async fn full_lifecycle_with_background_tasks() {
    let hx = harness();
    let drain = hx.bus.start_drain();
    let ready = subscribe_counter(&hx.bus, EVENT_SYSTEM_READY);
    let handle = hx.bridge.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ready.load(Ordering::SeqCst), 1);

    // Host loses the notification; the polling fallback catches the message.
    hx.host.messages.lock().expect("lock").push(ChatMessage::host(
        Some("m1"),
        "update <data>{\"panelA\":{\"field1\":\"polled\"}}</data>",
    ));
    tokio::time::sleep(Duration::from_millis(80)).await;

    let state = hx.store.state("conv-1").await.expect("state");
    assert_eq!(state.panels["panelA"]["field1"], json!("polled"));

    handle.shutdown().await;
    drain.shutdown().await;
}

#[tokio::test]
async fn conversation_switch_clears_dedup_and_rebaselines() {
    let hx = harness();
    assert!(hx.bridge.bind_now().await);
    hx.bridge.poll_now().await;

    let content = "x <data>{\"panelA\":{\"field1\":\"v\"}}</data>";
    hx.host.source.fire(
        EVENT_MESSAGE_RECEIVED,
        json!({ "messageId": "m1", "mes": content }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Switch: existing history in the new conversation is not reprocessed.
    {
        let mut conversation = hx.host.conversation.lock().expect("lock");
        *conversation = Some("conv-2".to_string());
    }
    *hx.host.messages.lock().expect("lock") = vec![ChatMessage::host(
        Some("m1"),
        content,
    )];
    hx.store.set_current_conversation(Some("conv-2"));
    hx.bridge.poll_now().await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    let state = hx.store.state("conv-2").await.expect("state");
    assert!(state.panels.is_empty());

    // Same identity seen fresh in the new conversation processes again
    // because the switch cleared the processed-message cache.
    hx.host.messages.lock().expect("lock").push(ChatMessage::host(
        Some("m1"),
        content,
    ));
    hx.bridge.poll_now().await;
    let state = hx.store.state("conv-2").await.expect("state");
    assert_eq!(state.panels["panelA"]["field1"], json!("v"));
}
