//! Best-effort parsing of raw model output into speakable chunks.
//!
//! The tutor model is asked to reply with a JSON object describing chunks
//! and metadata, but generation output is not trusted: the structured path
//! extracts and validates it, and any failure — no JSON, broken JSON the
//! repair pass can't fix, schema violations — drops to a deterministic
//! sentence-split fallback. [`parse_response_with_fallback`] is the only
//! entry point pipeline code should call; it never fails.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::chunks::{
    DEFAULT_CHUNK_PAUSE_SECS, Emotion, MAX_CHUNK_PAUSE_SECS, MAX_CHUNK_TEXT_CHARS, ParsedChunk,
    ParsedResponse, ResponseMetadata, ResponseSource,
};

/// Strips trailing commas before a closing brace/bracket — the one JSON
/// malformation models produce often enough to be worth repairing.
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("trailing-comma pattern is valid"));

// ─────────────────────────────────────────────────────────────────────────────
// Raw (untrusted) wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawResponse {
    chunks: Vec<RawChunk>,
    metadata: RawMetadata,
}

#[derive(Deserialize)]
struct RawChunk {
    text: String,
    emotion: Option<Emotion>,
    icon: Option<String>,
    pause: Option<f64>,
    emphasis: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    total_chunks: i64,
    estimated_duration: Option<f64>,
    tone: Option<String>,
    language: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Structured path
// ─────────────────────────────────────────────────────────────────────────────

/// Parse structured model output, or `None` when it isn't usable.
///
/// Extraction is the first-`{`-to-last-`}` slice of the input — greedy on
/// purpose, so fenced output (```` ```json … ``` ````) and chatter around
/// the object are tolerated. Schema violations return `None` rather than
/// erroring; the caller is expected to fall back.
#[must_use]
pub fn parse_structured_response(raw_text: &str) -> Option<ParsedResponse> {
    let slice = extract_json_object(raw_text)?;
    let value = parse_with_repair(slice)?;

    let raw: RawResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "structured response failed schema deserialization");
            return None;
        }
    };
    if let Err(reason) = validate(&raw) {
        debug!(reason, "structured response failed validation");
        return None;
    }

    let chunks: Vec<ParsedChunk> = raw
        .chunks
        .into_iter()
        .enumerate()
        .map(|(index, c)| ParsedChunk {
            id: format!("chunk-{index}"),
            text: c.text,
            emotion: c.emotion.unwrap_or_default(),
            icon: c.icon.unwrap_or_default(),
            pause: c.pause.unwrap_or(DEFAULT_CHUNK_PAUSE_SECS),
            emphasis: c.emphasis.unwrap_or(false),
            index,
        })
        .collect();

    let declared = raw.metadata.total_chunks as usize;
    if declared != chunks.len() {
        warn!(
            declared,
            actual = chunks.len(),
            "totalChunks mismatch in structured response, correcting"
        );
    }

    Some(ParsedResponse {
        metadata: ResponseMetadata {
            total_chunks: chunks.len(),
            estimated_duration: raw.metadata.estimated_duration,
            tone: raw.metadata.tone,
            language: raw.metadata.language,
        },
        chunks,
        is_valid: true,
        source: ResponseSource::Structured,
    })
}

/// Slice from the first `{` to the last `}`.
fn extract_json_object(raw_text: &str) -> Option<&str> {
    let start = raw_text.find('{')?;
    let end = raw_text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw_text[start..=end])
}

/// Parse JSON, retrying once after the trailing-comma repair pass.
fn parse_with_repair(slice: &str) -> Option<Value> {
    match serde_json::from_str(slice) {
        Ok(v) => Some(v),
        Err(first) => {
            let repaired = TRAILING_COMMA.replace_all(slice, "$1");
            match serde_json::from_str(&repaired) {
                Ok(v) => Some(v),
                Err(second) => {
                    debug!(error = %first, repaired_error = %second, "unparseable JSON in model output");
                    None
                }
            }
        }
    }
}

fn validate(raw: &RawResponse) -> Result<(), &'static str> {
    if raw.chunks.is_empty() {
        return Err("empty chunk list");
    }
    for c in &raw.chunks {
        if c.text.is_empty() {
            return Err("empty chunk text");
        }
        if c.text.chars().count() > MAX_CHUNK_TEXT_CHARS {
            return Err("chunk text over length bound");
        }
        if let Some(pause) = c.pause {
            if !(0.0..=MAX_CHUNK_PAUSE_SECS).contains(&pause) {
                return Err("pause out of range");
            }
        }
    }
    if raw.metadata.total_chunks <= 0 {
        return Err("non-positive totalChunks");
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Fallback path
// ─────────────────────────────────────────────────────────────────────────────

/// Build a fallback response from free text. Always succeeds.
///
/// One chunk per sentence with fixed defaults. A sentence boundary is a run
/// of `.`/`!`/`?` followed by whitespace and an upper-case letter; without
/// any boundary the whole input is a single sentence.
#[must_use]
pub fn create_fallback_response(text: &str) -> ParsedResponse {
    let sentences = split_sentences(text);
    let sentences = if sentences.is_empty() {
        vec![text.trim().to_owned()]
    } else {
        sentences
    };

    let chunks: Vec<ParsedChunk> = sentences
        .into_iter()
        .enumerate()
        .map(|(index, text)| ParsedChunk {
            id: format!("fallback-{index}"),
            text,
            emotion: Emotion::Neutral,
            icon: String::new(),
            pause: DEFAULT_CHUNK_PAUSE_SECS,
            emphasis: false,
            index,
        })
        .collect();

    ParsedResponse {
        metadata: ResponseMetadata {
            total_chunks: chunks.len(),
            estimated_duration: None,
            tone: None,
            language: None,
        },
        chunks,
        is_valid: false,
        source: ResponseSource::Fallback,
    }
}

/// Parse model output, dropping to the sentence-split fallback when the
/// structured path yields nothing. Never fails.
#[must_use]
pub fn parse_response_with_fallback(raw_text: &str) -> ParsedResponse {
    parse_structured_response(raw_text).unwrap_or_else(|| create_fallback_response(raw_text))
}

/// Split on `[.!?]+` + whitespace + upper-case. Trims each sentence and
/// drops empties. The `regex` crate has no lookahead, so this is a manual
/// char walk.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        // Extend over the whole punctuation run.
        let mut end = i + c.len_utf8();
        while let Some(&(j, c2)) = chars.peek() {
            if matches!(c2, '.' | '!' | '?') {
                end = j + c2.len_utf8();
                let _ = chars.next();
            } else {
                break;
            }
        }
        // Boundary requires whitespace and then an upper-case letter.
        let mut saw_whitespace = false;
        let mut next_start = None;
        while let Some(&(j, c2)) = chars.peek() {
            if c2.is_whitespace() {
                saw_whitespace = true;
                let _ = chars.next();
            } else {
                if saw_whitespace && c2.is_uppercase() {
                    next_start = Some(j);
                }
                break;
            }
        }
        if let Some(ns) = next_start {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
            start = ns;
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_owned());
    }
    sentences
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
