//! Error types surfaced by the conversation core.
//!
//! Deliberately small: everything except session lookup degrades gracefully
//! (logged and swallowed) instead of failing the caller.

/// Errors from the active-conversation registry.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The referenced conversation does not exist.
    #[error("conversation not found: {0}")]
    NotFound(String),

    /// The conversation exists but belongs to a different user.
    #[error("conversation {conversation_id} is not owned by user {user_id}")]
    Unauthorized {
        /// Conversation the caller asked for.
        conversation_id: String,
        /// User who asked.
        user_id: String,
    },

    /// The store collaborator failed during a load that cannot be skipped.
    #[error("conversation store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let e = SessionError::NotFound("conv-9".into());
        assert!(e.to_string().contains("conv-9"));
    }

    #[test]
    fn unauthorized_display_names_both_ids() {
        let e = SessionError::Unauthorized {
            conversation_id: "conv-1".into(),
            user_id: "user-2".into(),
        };
        let s = e.to_string();
        assert!(s.contains("conv-1"));
        assert!(s.contains("user-2"));
    }

    #[test]
    fn store_error_wraps_source() {
        let e = SessionError::from(anyhow::anyhow!("connection refused"));
        assert!(matches!(e, SessionError::Store(_)));
        assert!(e.to_string().contains("connection refused"));
    }
}
