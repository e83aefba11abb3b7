//! Boundary contracts to the out-of-scope collaborators.
//!
//! The core never talks to Postgres or a WebSocket directly; it consumes
//! these traits. The HTTP/persistence layer wires concrete implementations
//! in, tests wire mocks in.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::conversation::Conversation;
use crate::events::{BroadcastMessage, ConversationEvent};

/// Conversation persistence.
///
/// Safe to call concurrently for different ids; same-id serialization is the
/// caller's responsibility (the registry single-flights its loads).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Look up a conversation by id. `Ok(None)` when it does not exist.
    async fn find_conversation(&self, id: &str) -> anyhow::Result<Option<Conversation>>;

    /// Apply a partial update and return the refreshed record, or `Ok(None)`
    /// when no such row exists.
    async fn update_conversation(
        &self,
        id: &str,
        updates: Map<String, Value>,
    ) -> anyhow::Result<Option<Conversation>>;
}

/// Client fan-out transport.
///
/// Fire-and-forget from the core's perspective: failures are logged at the
/// call site and never propagated.
#[async_trait]
pub trait ConversationTransport: Send + Sync {
    /// Deliver a message to every client subscribed to the conversation.
    async fn broadcast_to_conversation(
        &self,
        conversation_id: &str,
        message: BroadcastMessage,
    ) -> anyhow::Result<()>;
}

/// Best-effort event persistence. Optional: a bus without a sink still
/// honors every other emit guarantee.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record an event. Failures are logged and swallowed by the caller;
    /// this is explicitly not a delivery guarantee.
    async fn persist_event(&self, event: &ConversationEvent) -> anyhow::Result<()>;
}
