//! # parley-runtime
//!
//! The coordinating components of the Parley conversation core.
//!
//! - **Event bus**: Typed publish/subscribe dispatch — global and
//!   per-conversation handlers, transport fan-out, best-effort persistence
//! - **Registry**: Active-conversation sessions, connected-client tracking,
//!   ownership-checked load-on-demand, idle eviction
//! - **Sweeper**: The recurring eviction timer, with an explicit
//!   start/stop lifecycle
//!
//! All three are plain constructed values taking their collaborators as
//! trait objects; the embedding application owns wiring and lifetime.
//!
//! ## Crate Position
//!
//! Coordination layer. Depends on: parley-core.

#![deny(unsafe_code)]

pub mod bus;
pub mod registry;
pub mod sweeper;

// Re-export main public API
pub use bus::{EmitOptions, EventBus, EventHandler, handler_fn};
pub use registry::{ActiveConversation, ConversationRegistry, RegistryStats};
pub use sweeper::{DEFAULT_IDLE_AFTER, DEFAULT_SWEEP_INTERVAL, IdleSweeper};
