//! # parley-core
//!
//! Foundation types and boundary contracts for the Parley conversation core.
//!
//! This crate provides the shared vocabulary the runtime crate depends on:
//!
//! - **Events**: [`events::ConversationEvent`] with its fixed
//!   [`events::ConversationEventType`] enumeration and the
//!   [`events::BroadcastMessage`] transport payload
//! - **Conversation record**: [`conversation::Conversation`] snapshot
//! - **Chunks**: [`chunks::ParsedChunk`] and friends — the speakable units a
//!   model response is decomposed into
//! - **Parser**: [`parser::parse_response_with_fallback`] and the structured /
//!   fallback pipeline behind it
//! - **Boundary traits**: [`boundary::ConversationStore`],
//!   [`boundary::ConversationTransport`], [`boundary::EventSink`]
//! - **Errors**: [`errors::SessionError`] via `thiserror`
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `parley-runtime`.

#![deny(unsafe_code)]

pub mod boundary;
pub mod chunks;
pub mod conversation;
pub mod errors;
pub mod events;
pub mod logging;
pub mod parser;
