//! Typed publish/subscribe dispatch for conversation events.
//!
//! One `emit` call runs, in order: global handlers for the event type,
//! handlers scoped to the event's conversation, the transport broadcast,
//! and finally a spawned best-effort persistence attempt. A failing handler
//! never blocks its siblings, the broadcast, or persistence — `emit` itself
//! never fails. A failing broadcast ends the emit before persistence is
//! initiated. No queuing or backpressure: dispatch is direct-call, so a
//! slow handler delays everything after it in the same `emit`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use parley_core::boundary::{ConversationTransport, EventSink};
use parley_core::events::{ConversationEvent, ConversationEventType};

/// A registered unit of work invoked for matching events.
///
/// Registration identity is `Arc` pointer identity: `off` removes exactly
/// the `Arc` that was passed to `on`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// React to an event. An `Err` is logged and isolated; it never affects
    /// sibling handlers or the broadcast.
    async fn handle(&self, event: &ConversationEvent) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(ConversationEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &ConversationEvent) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a registerable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(ConversationEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Optional fields for [`EventBus::emit_event`].
#[derive(Default)]
pub struct EmitOptions {
    /// Originating user.
    pub user_id: Option<String>,
    /// Side-channel metadata, merged into the broadcast payload.
    pub metadata: Option<Map<String, Value>>,
}

/// The conversation event bus.
///
/// Explicitly constructed and injected — no process-wide singleton. The
/// transport collaborator is mandatory; the event sink is optional and its
/// absence changes nothing about the other emit guarantees.
pub struct EventBus {
    transport: Arc<dyn ConversationTransport>,
    sink: Option<Arc<dyn EventSink>>,
    /// Global handlers keyed by event type, in registration order.
    global: Mutex<HashMap<ConversationEventType, Vec<Arc<dyn EventHandler>>>>,
    /// Handlers keyed by conversation id, in registration order.
    scoped: Mutex<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    emit_count: AtomicU64,
}

impl EventBus {
    /// Create a bus over the given collaborators.
    pub fn new(
        transport: Arc<dyn ConversationTransport>,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            transport,
            sink,
            global: Mutex::new(HashMap::new()),
            scoped: Mutex::new(HashMap::new()),
            emit_count: AtomicU64::new(0),
        }
    }

    /// Register a global handler for an event type. A duplicate `on` with
    /// the same `Arc` is a no-op.
    pub fn on(&self, event_type: ConversationEventType, handler: Arc<dyn EventHandler>) {
        let mut global = self.global.lock();
        let handlers = global.entry(event_type).or_default();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(handler);
        }
    }

    /// Remove a global handler. Idempotent: removing an unregistered
    /// handler is a no-op.
    pub fn off(&self, event_type: ConversationEventType, handler: &Arc<dyn EventHandler>) {
        let mut global = self.global.lock();
        if let Some(handlers) = global.get_mut(&event_type) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
            if handlers.is_empty() {
                let _ = global.remove(&event_type);
            }
        }
    }

    /// Register a handler scoped to one conversation.
    pub fn on_conversation(&self, conversation_id: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let mut scoped = self.scoped.lock();
        let handlers = scoped.entry(conversation_id.into()).or_default();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(handler);
        }
    }

    /// Remove a conversation-scoped handler. Idempotent.
    pub fn off_conversation(&self, conversation_id: &str, handler: &Arc<dyn EventHandler>) {
        let mut scoped = self.scoped.lock();
        if let Some(handlers) = scoped.get_mut(conversation_id) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
            if handlers.is_empty() {
                let _ = scoped.remove(conversation_id);
            }
        }
    }

    /// Dispatch an event. Never fails.
    ///
    /// Ordering within one call: global handlers (registration order) →
    /// conversation-scoped handlers → transport broadcast → persistence
    /// *initiated* (spawned, not awaited). Handler and broadcast failures
    /// are logged and swallowed; a failed broadcast additionally ends the
    /// emit, so persistence is not attempted for it.
    pub async fn emit(&self, event: ConversationEvent) {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        counter!("parley_events_emitted_total").increment(1);

        let global = self
            .global
            .lock()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        self.dispatch(&global, &event, "global").await;

        let scoped = self
            .scoped
            .lock()
            .get(&event.conversation_id)
            .cloned()
            .unwrap_or_default();
        self.dispatch(&scoped, &event, "conversation").await;

        if let Err(e) = self
            .transport
            .broadcast_to_conversation(&event.conversation_id, event.to_broadcast())
            .await
        {
            warn!(
                event_type = event.event_type.as_str(),
                conversation_id = %event.conversation_id,
                error = %e,
                "event broadcast failed"
            );
            // A failed broadcast ends the emit; persistence is never
            // initiated for an event clients did not receive.
            return;
        }

        if let Some(sink) = &self.sink {
            let sink = Arc::clone(sink);
            let _ = tokio::spawn(async move {
                if let Err(e) = sink.persist_event(&event).await {
                    counter!("parley_event_persist_failures_total").increment(1);
                    warn!(
                        event_type = event.event_type.as_str(),
                        conversation_id = %event.conversation_id,
                        error = %e,
                        "best-effort event persistence failed"
                    );
                }
            });
        }
    }

    /// Convenience constructor-and-emit: stamps the timestamp and forwards
    /// to [`emit`](Self::emit).
    pub async fn emit_event(
        &self,
        event_type: ConversationEventType,
        conversation_id: impl Into<String>,
        data: Map<String, Value>,
        options: EmitOptions,
    ) {
        let mut event = ConversationEvent::now(event_type, conversation_id, data);
        event.user_id = options.user_id;
        event.metadata = options.metadata;
        self.emit(event).await;
    }

    /// Total events emitted by this bus.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }

    /// Number of global handlers registered for an event type.
    pub fn handler_count(&self, event_type: ConversationEventType) -> usize {
        self.global.lock().get(&event_type).map_or(0, Vec::len)
    }

    /// Number of handlers scoped to a conversation.
    pub fn conversation_handler_count(&self, conversation_id: &str) -> usize {
        self.scoped.lock().get(conversation_id).map_or(0, Vec::len)
    }

    /// Invoke handlers in order, isolating each failure.
    async fn dispatch(
        &self,
        handlers: &[Arc<dyn EventHandler>],
        event: &ConversationEvent,
        scope: &'static str,
    ) {
        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                counter!("parley_handler_failures_total").increment(1);
                warn!(
                    event_type = event.event_type.as_str(),
                    conversation_id = %event.conversation_id,
                    scope,
                    error = %e,
                    "event handler failed"
                );
            } else {
                debug!(
                    event_type = event.event_type.as_str(),
                    conversation_id = %event.conversation_id,
                    scope,
                    "event handler ran"
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::events::BroadcastMessage;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    mockall::mock! {
        Transport {}

        #[async_trait]
        impl ConversationTransport for Transport {
            async fn broadcast_to_conversation(
                &self,
                conversation_id: &str,
                message: BroadcastMessage,
            ) -> anyhow::Result<()>;
        }
    }

    /// Transport that accepts everything; for tests not about broadcasting.
    fn quiet_transport() -> Arc<dyn ConversationTransport> {
        let mut mock = MockTransport::new();
        let _ = mock
            .expect_broadcast_to_conversation()
            .returning(|_, _| Ok(()));
        Arc::new(mock)
    }

    /// Handler counting its invocations.
    fn counting_handler() -> (Arc<dyn EventHandler>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler = handler_fn(move |_event| {
            let seen = Arc::clone(&seen);
            async move {
                let _ = seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        (handler, count)
    }

    fn failing_handler() -> Arc<dyn EventHandler> {
        handler_fn(|_event| async { Err(anyhow::anyhow!("handler exploded")) })
    }

    struct RecordingSink {
        events: Mutex<Vec<ConversationEvent>>,
        notify: Notify,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn persist_event(&self, event: &ConversationEvent) -> anyhow::Result<()> {
            self.events.lock().push(event.clone());
            self.notify.notify_one();
            Ok(())
        }
    }

    fn message_sent(conversation_id: &str) -> ConversationEvent {
        ConversationEvent::now(
            ConversationEventType::MessageSent,
            conversation_id,
            Map::new(),
        )
    }

    #[tokio::test]
    async fn global_handlers_invoked_in_registration_order() {
        let bus = EventBus::new(quiet_transport(), None);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(
                ConversationEventType::MessageSent,
                handler_fn(move |_| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().push(tag);
                        Ok(())
                    }
                }),
            );
        }

        bus.emit(message_sent("conv-1")).await;
        assert_eq!(*order.lock(), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_siblings_or_broadcast() {
        // Two global handlers for message:sent, one failing; the broadcast
        // must still go out exactly once.
        let mut transport = MockTransport::new();
        let _ = transport
            .expect_broadcast_to_conversation()
            .withf(|id, msg| id == "conv-1" && msg.message_type == "message:sent")
            .times(1)
            .returning(|_, _| Ok(()));

        let bus = EventBus::new(Arc::new(transport), None);
        bus.on(ConversationEventType::MessageSent, failing_handler());
        let (ok_handler, invocations) = counting_handler();
        bus.on(ConversationEventType::MessageSent, ok_handler);

        bus.emit(message_sent("conv-1")).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handlers_only_receive_matching_event_type() {
        let bus = EventBus::new(quiet_transport(), None);
        let (handler, invocations) = counting_handler();
        bus.on(ConversationEventType::MessageSent, handler);

        bus.emit(ConversationEvent::now(
            ConversationEventType::AudioPlayed,
            "conv-1",
            Map::new(),
        ))
        .await;
        assert_eq!(invocations.load(Ordering::SeqCst), 0);

        bus.emit(message_sent("conv-1")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conversation_scoped_handlers_filter_by_id() {
        let bus = EventBus::new(quiet_transport(), None);
        let (handler, invocations) = counting_handler();
        bus.on_conversation("conv-1", handler);

        bus.emit(message_sent("conv-2")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 0);

        bus.emit(message_sent("conv-1")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn global_handlers_run_before_scoped_handlers() {
        let bus = EventBus::new(quiet_transport(), None);
        let order = Arc::new(Mutex::new(Vec::new()));

        let scoped_order = Arc::clone(&order);
        bus.on_conversation(
            "conv-1",
            handler_fn(move |_| {
                let order = Arc::clone(&scoped_order);
                async move {
                    order.lock().push("scoped");
                    Ok(())
                }
            }),
        );
        let global_order = Arc::clone(&order);
        bus.on(
            ConversationEventType::MessageSent,
            handler_fn(move |_| {
                let order = Arc::clone(&global_order);
                async move {
                    order.lock().push("global");
                    Ok(())
                }
            }),
        );

        bus.emit(message_sent("conv-1")).await;
        assert_eq!(*order.lock(), ["global", "scoped"]);
    }

    #[tokio::test]
    async fn off_is_idempotent_and_stops_delivery() {
        let bus = EventBus::new(quiet_transport(), None);
        let (handler, invocations) = counting_handler();
        bus.on(ConversationEventType::MessageSent, Arc::clone(&handler));

        bus.emit(message_sent("conv-1")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        bus.off(ConversationEventType::MessageSent, &handler);
        bus.off(ConversationEventType::MessageSent, &handler); // second off is a no-op
        assert_eq!(bus.handler_count(ConversationEventType::MessageSent), 0);

        bus.emit(message_sent("conv-1")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_on_with_same_arc_registers_once() {
        let bus = EventBus::new(quiet_transport(), None);
        let (handler, invocations) = counting_handler();
        bus.on(ConversationEventType::MessageSent, Arc::clone(&handler));
        bus.on(ConversationEventType::MessageSent, Arc::clone(&handler));
        assert_eq!(bus.handler_count(ConversationEventType::MessageSent), 1);

        bus.emit(message_sent("conv-1")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn off_conversation_removes_scoped_handler() {
        let bus = EventBus::new(quiet_transport(), None);
        let (handler, invocations) = counting_handler();
        bus.on_conversation("conv-1", Arc::clone(&handler));
        assert_eq!(bus.conversation_handler_count("conv-1"), 1);

        bus.off_conversation("conv-1", &handler);
        assert_eq!(bus.conversation_handler_count("conv-1"), 0);

        bus.emit(message_sent("conv-1")).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_failure_is_swallowed() {
        let mut transport = MockTransport::new();
        let _ = transport
            .expect_broadcast_to_conversation()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("socket gone")));

        let bus = EventBus::new(Arc::new(transport), None);
        // Does not panic, does not propagate
        bus.emit(message_sent("conv-1")).await;
        assert_eq!(bus.emit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_failure_skips_persistence() {
        let mut transport = MockTransport::new();
        let _ = transport
            .expect_broadcast_to_conversation()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("socket gone")));

        let sink = Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        let bus = EventBus::new(
            Arc::new(transport),
            Some(Arc::clone(&sink) as Arc<dyn EventSink>),
        );

        bus.emit(message_sent("conv-1")).await;

        // Any spawned persistence task would have landed well within this
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn broadcast_payload_carries_metadata_marker() {
        let mut transport = MockTransport::new();
        let _ = transport
            .expect_broadcast_to_conversation()
            .withf(|_, msg| msg.data["_metadata"]["voice"] == "en-GB-1")
            .times(1)
            .returning(|_, _| Ok(()));

        let bus = EventBus::new(Arc::new(transport), None);
        let mut metadata = Map::new();
        let _ = metadata.insert("voice".into(), serde_json::json!("en-GB-1"));
        bus.emit_event(
            ConversationEventType::AudioReady,
            "conv-1",
            Map::new(),
            EmitOptions {
                user_id: None,
                metadata: Some(metadata),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn emit_event_stamps_fields() {
        let bus = EventBus::new(quiet_transport(), None);
        let seen = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&seen);
        bus.on(
            ConversationEventType::ConversationStarted,
            handler_fn(move |event| {
                let capture = Arc::clone(&capture);
                async move {
                    *capture.lock() = Some(event);
                    Ok(())
                }
            }),
        );

        bus.emit_event(
            ConversationEventType::ConversationStarted,
            "conv-1",
            Map::new(),
            EmitOptions {
                user_id: Some("user-1".into()),
                metadata: None,
            },
        )
        .await;

        let event = seen.lock().take().unwrap();
        assert_eq!(event.conversation_id, "conv-1");
        assert_eq!(event.user_id.as_deref(), Some("user-1"));
        assert!(!event.timestamp.is_empty());
    }

    #[tokio::test]
    async fn persistence_attempted_after_emit_returns() {
        let sink = Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        let bus = EventBus::new(quiet_transport(), Some(Arc::clone(&sink) as Arc<dyn EventSink>));

        bus.emit(message_sent("conv-1")).await;

        // Spawned, not awaited — wait for the background task to land.
        tokio::time::timeout(Duration::from_secs(1), sink.notify.notified())
            .await
            .expect("persistence task never ran");
        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].conversation_id, "conv-1");
    }

    #[tokio::test]
    async fn missing_sink_does_not_affect_emit() {
        let mut transport = MockTransport::new();
        let _ = transport
            .expect_broadcast_to_conversation()
            .times(1)
            .returning(|_, _| Ok(()));
        let bus = EventBus::new(Arc::new(transport), None);
        bus.emit(message_sent("conv-1")).await;
        assert_eq!(bus.emit_count(), 1);
    }

    #[tokio::test]
    async fn emit_count_increments() {
        let bus = EventBus::new(quiet_transport(), None);
        assert_eq!(bus.emit_count(), 0);
        bus.emit(message_sent("conv-1")).await;
        bus.emit(message_sent("conv-2")).await;
        assert_eq!(bus.emit_count(), 2);
    }
}
