//! The persisted conversation record.
//!
//! The store owns this shape; the core only caches the last-known snapshot
//! inside an active session and refreshes it after updates.

use serde::{Deserialize, Serialize};

/// Snapshot of a persisted conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation ID.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Display title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// ISO 8601 timestamp of the last persisted change.
    pub updated_at: String,
}
