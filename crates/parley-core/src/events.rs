//! Conversation lifecycle events.
//!
//! Every meaningful milestone in a tutoring conversation — session start,
//! messages in either direction, chunk/TTS progress, audio playback — is a
//! [`ConversationEvent`]. Events are dispatched in-process by the runtime's
//! event bus, fanned out to connected clients as a [`BroadcastMessage`], and
//! persisted best-effort. The bus keeps no event history.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved key under which event metadata is merged into the broadcast
/// payload's `data` object.
pub const METADATA_KEY: &str = "_metadata";

/// The fixed set of conversation event types.
///
/// Wire strings are the `scope:action` form clients match on; they must not
/// change without coordinating with the frontend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationEventType {
    /// A conversation session began.
    #[serde(rename = "conversation:started")]
    ConversationStarted,
    /// Conversation state (title, settings) changed.
    #[serde(rename = "conversation:updated")]
    ConversationUpdated,
    /// A conversation session ended.
    #[serde(rename = "conversation:ended")]
    ConversationEnded,
    /// The student sent a message.
    #[serde(rename = "message:sent")]
    MessageSent,
    /// The tutor's response was received from the model.
    #[serde(rename = "message:received")]
    MessageReceived,
    /// A speakable chunk was produced from a response.
    #[serde(rename = "chunk:created")]
    ChunkCreated,
    /// TTS synthesis started for a chunk.
    #[serde(rename = "chunk:tts-started")]
    ChunkTtsStarted,
    /// TTS synthesis finished for a chunk.
    #[serde(rename = "chunk:tts-completed")]
    ChunkTtsCompleted,
    /// TTS synthesis failed for a chunk.
    #[serde(rename = "chunk:tts-failed")]
    ChunkTtsFailed,
    /// Synthesized audio is ready for playback.
    #[serde(rename = "audio:ready")]
    AudioReady,
    /// The client finished playing a piece of audio.
    #[serde(rename = "audio:played")]
    AudioPlayed,
    /// Long-term learner memory was updated.
    #[serde(rename = "memory:updated")]
    MemoryUpdated,
    /// Something in the pipeline failed.
    #[serde(rename = "error:occurred")]
    ErrorOccurred,
}

impl ConversationEventType {
    /// Get the wire string (for type discrimination and logging).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConversationStarted => "conversation:started",
            Self::ConversationUpdated => "conversation:updated",
            Self::ConversationEnded => "conversation:ended",
            Self::MessageSent => "message:sent",
            Self::MessageReceived => "message:received",
            Self::ChunkCreated => "chunk:created",
            Self::ChunkTtsStarted => "chunk:tts-started",
            Self::ChunkTtsCompleted => "chunk:tts-completed",
            Self::ChunkTtsFailed => "chunk:tts-failed",
            Self::AudioReady => "audio:ready",
            Self::AudioPlayed => "audio:played",
            Self::MemoryUpdated => "memory:updated",
            Self::ErrorOccurred => "error:occurred",
        }
    }
}

/// An event describing one conversation milestone.
///
/// Constructed by emitting code, consumed synchronously by registered
/// handlers, then broadcast and (separately, best-effort) persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    /// Event type discriminator.
    #[serde(rename = "type")]
    pub event_type: ConversationEventType,
    /// Conversation this event belongs to.
    pub conversation_id: String,
    /// Originating user, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Event-specific fields (opaque to the bus).
    pub data: Map<String, Value>,
    /// ISO 8601 timestamp, assigned at construction.
    pub timestamp: String,
    /// Optional side-channel fields, merged into the broadcast payload
    /// under [`METADATA_KEY`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ConversationEvent {
    /// Create a new event with the current UTC timestamp.
    #[must_use]
    pub fn now(
        event_type: ConversationEventType,
        conversation_id: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            event_type,
            conversation_id: conversation_id.into(),
            user_id: None,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata: None,
        }
    }

    /// Attach an originating user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach side-channel metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Build the transport payload for this event.
    ///
    /// `data` is copied as-is; when metadata is present it is merged in
    /// under [`METADATA_KEY`] so the client can keep it out of rendering.
    #[must_use]
    pub fn to_broadcast(&self) -> BroadcastMessage {
        let mut data = self.data.clone();
        if let Some(metadata) = &self.metadata {
            let _ = data.insert(METADATA_KEY.into(), Value::Object(metadata.clone()));
        }
        BroadcastMessage {
            message_type: self.event_type.as_str().to_owned(),
            data,
            timestamp: self.timestamp.clone(),
        }
    }
}

/// Payload handed to the transport collaborator for client fan-out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Event type wire string.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Event data, including merged metadata when present.
    pub data: Map<String, Value>,
    /// ISO 8601 timestamp of the originating event.
    pub timestamp: String,
}

impl BroadcastMessage {
    /// Build a standalone broadcast message (not derived from an event),
    /// stamped with the current UTC time.
    #[must_use]
    pub fn now(message_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
