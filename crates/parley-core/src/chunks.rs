//! Speakable chunks — the units a tutor response is decomposed into.
//!
//! The parser turns raw model output into an ordered chunk sequence; the
//! ordered sequence reconstructs the full response in reading order. TTS and
//! the client render one chunk at a time using the emotion/pause/emphasis
//! hints.

use serde::{Deserialize, Serialize};

/// Maximum chunk text length in characters.
pub const MAX_CHUNK_TEXT_CHARS: usize = 500;

/// Maximum pause after a chunk, in seconds.
pub const MAX_CHUNK_PAUSE_SECS: f64 = 2.0;

/// Default pause after a chunk, in seconds.
pub const DEFAULT_CHUNK_PAUSE_SECS: f64 = 0.5;

/// Emotional register for chunk delivery.
///
/// Out-of-enumeration values in structured model output are a schema
/// failure, not a silent default — the parser falls back instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    /// Flat delivery.
    #[default]
    Neutral,
    /// Warm, pleased.
    Happy,
    /// High energy.
    Excited,
    /// Slower, considered.
    Thoughtful,
    /// Supportive, corrective contexts.
    Encouraging,
    /// Reaction to an unexpected learner answer.
    Surprised,
}

/// Where a parsed response came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    /// The model emitted valid structured JSON.
    Structured,
    /// Deterministic sentence-split fallback.
    Fallback,
}

/// One validated speakable chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedChunk {
    /// Positional ID: `chunk-{index}` for structured output,
    /// `fallback-{index}` for fallback output.
    pub id: String,
    /// Chunk text. The structured path enforces non-empty text of at most
    /// [`MAX_CHUNK_TEXT_CHARS`] characters; fallback output mirrors the
    /// input, so empty input yields one empty chunk.
    pub text: String,
    /// Delivery emotion.
    pub emotion: Emotion,
    /// Rendering icon hint (empty when unspecified).
    pub icon: String,
    /// Pause after this chunk in seconds, within `[0, MAX_CHUNK_PAUSE_SECS]`.
    pub pause: f64,
    /// Whether the client should emphasize this chunk.
    pub emphasis: bool,
    /// Zero-based position within the response.
    pub index: usize,
}

/// Response-level metadata accompanying the chunk sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    /// Number of chunks. Corrected (with a logged warning) when the model's
    /// own count disagrees with the actual sequence length.
    pub total_chunks: usize,
    /// Estimated spoken duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<f64>,
    /// Overall tone label from the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    /// BCP 47 language tag of the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A fully parsed response: ordered chunks plus metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResponse {
    /// Ordered chunk sequence.
    pub chunks: Vec<ParsedChunk>,
    /// Response-level metadata.
    pub metadata: ResponseMetadata,
    /// Whether the response passed schema validation (always false for
    /// fallback output).
    pub is_valid: bool,
    /// Structured or fallback.
    pub source: ResponseSource,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emotion_defaults_to_neutral() {
        assert_eq!(Emotion::default(), Emotion::Neutral);
    }

    #[test]
    fn emotion_lowercase_wire_strings() {
        assert_eq!(serde_json::to_value(Emotion::Encouraging).unwrap(), json!("encouraging"));
        let back: Emotion = serde_json::from_value(json!("happy")).unwrap();
        assert_eq!(back, Emotion::Happy);
    }

    #[test]
    fn unknown_emotion_is_a_deserialize_error() {
        let result: Result<Emotion, _> = serde_json::from_value(json!("furious"));
        assert!(result.is_err());
    }

    #[test]
    fn parsed_chunk_wire_shape() {
        let chunk = ParsedChunk {
            id: "chunk-0".into(),
            text: "Well done!".into(),
            emotion: Emotion::Encouraging,
            icon: String::new(),
            pause: 0.5,
            emphasis: true,
            index: 0,
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["id"], "chunk-0");
        assert_eq!(json["emotion"], "encouraging");
        assert_eq!(json["pause"], 0.5);
        assert_eq!(json["emphasis"], true);
    }

    #[test]
    fn metadata_optionals_omitted() {
        let meta = ResponseMetadata {
            total_chunks: 2,
            estimated_duration: None,
            tone: None,
            language: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["totalChunks"], 2);
        assert!(json.get("estimatedDuration").is_none());
        assert!(json.get("tone").is_none());
    }
}
