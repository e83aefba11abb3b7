//! Active-conversation registry.
//!
//! Tracks which conversations are live in this process, which client ids are
//! subscribed to each, and when each was last touched. Sessions are loaded
//! on demand from the store (with an ownership check), kept while clients
//! come and go, and evicted by the idle sweep once empty and stale.
//!
//! All map mutation happens inside synchronous lock sections that are never
//! held across an await; loads of the same conversation are single-flighted
//! so concurrent get-or-create calls cannot double-load.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use parley_core::boundary::{ConversationStore, ConversationTransport};
use parley_core::conversation::Conversation;
use parley_core::errors::SessionError;
use parley_core::events::{BroadcastMessage, ConversationEventType};

/// A live conversation session.
#[derive(Clone, Debug)]
pub struct ActiveConversation {
    /// Conversation identity. Immutable after creation.
    pub conversation_id: String,
    /// Owning user. Immutable after creation.
    pub user_id: String,
    /// Last-known persisted snapshot; refreshed on state updates.
    pub conversation: Conversation,
    /// Client ids currently subscribed.
    pub connected_clients: HashSet<String>,
    /// Bumped on any registration, unregistration, or update.
    pub last_activity: DateTime<Utc>,
    /// When this session was loaded. Immutable.
    pub created_at: DateTime<Utc>,
}

/// Aggregated registry counters, for monitoring and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live sessions.
    pub active_conversations: usize,
    /// Connected clients summed across sessions.
    pub total_clients: usize,
    /// Distinct users with at least one live session.
    pub users_with_active_conversations: usize,
}

/// Both indices behind one lock so cross-index mutation is atomic.
#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, ActiveConversation>,
    by_user: HashMap<String, HashSet<String>>,
}

/// The registry. Explicitly constructed and injected; the idle sweep timer
/// lives in [`crate::sweeper::IdleSweeper`], not here.
pub struct ConversationRegistry {
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn ConversationTransport>,
    state: Mutex<RegistryState>,
    /// Per-conversation load guards, pruned opportunistically.
    load_locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl ConversationRegistry {
    /// Create a registry over the given collaborators.
    pub fn new(
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn ConversationTransport>,
    ) -> Self {
        Self {
            store,
            transport,
            state: Mutex::new(RegistryState::default()),
            load_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the existing session, or load the conversation and create one.
    ///
    /// Fails with [`SessionError::NotFound`] when the conversation does not
    /// exist and [`SessionError::Unauthorized`] when it is owned by a
    /// different user — ownership mismatch never silently reassigns and
    /// never creates a session entry. The ownership check applies to live
    /// sessions too, not just cold loads.
    pub async fn get_or_create(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<ActiveConversation, SessionError> {
        if let Some(existing) = self.get_active(conversation_id) {
            return Self::authorize(existing, user_id);
        }

        // Single-flight: a concurrent caller for the same id waits here and
        // then observes the first caller's insert on the re-check.
        let load_lock = self.load_lock(conversation_id);
        let _guard = load_lock.lock().await;
        if let Some(existing) = self.get_active(conversation_id) {
            return Self::authorize(existing, user_id);
        }

        let conversation = self
            .store
            .find_conversation(conversation_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(conversation_id.to_owned()))?;
        if conversation.user_id != user_id {
            return Err(SessionError::Unauthorized {
                conversation_id: conversation_id.to_owned(),
                user_id: user_id.to_owned(),
            });
        }

        let now = Utc::now();
        let session = ActiveConversation {
            conversation_id: conversation_id.to_owned(),
            user_id: user_id.to_owned(),
            conversation,
            connected_clients: HashSet::new(),
            last_activity: now,
            created_at: now,
        };
        {
            let mut state = self.state.lock();
            let _ = state
                .sessions
                .insert(conversation_id.to_owned(), session.clone());
            let _ = state
                .by_user
                .entry(user_id.to_owned())
                .or_default()
                .insert(conversation_id.to_owned());
            gauge!("parley_active_conversations").set(state.sessions.len() as f64);
        }
        info!(conversation_id, user_id, "conversation session created");
        Ok(session)
    }

    /// Subscribe a client to an existing session and bump activity.
    ///
    /// Returns `false` (not an error) when no session exists — callers that
    /// care must go through [`get_or_create`](Self::get_or_create) first.
    pub fn register_client(&self, conversation_id: &str, client_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(conversation_id) else {
            debug!(conversation_id, client_id, "register on inactive conversation ignored");
            return false;
        };
        let _ = session.connected_clients.insert(client_id.to_owned());
        session.last_activity = Utc::now();
        debug!(
            conversation_id,
            client_id,
            clients = session.connected_clients.len(),
            "client registered"
        );
        true
    }

    /// Unsubscribe a client and bump activity. `false` when no session exists.
    ///
    /// A session left with zero clients is retained until the idle sweep
    /// finds it both empty and stale.
    pub fn unregister_client(&self, conversation_id: &str, client_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(conversation_id) else {
            debug!(conversation_id, client_id, "unregister on inactive conversation ignored");
            return false;
        };
        let _ = session.connected_clients.remove(client_id);
        session.last_activity = Utc::now();
        true
    }

    /// Direct session lookup.
    #[must_use]
    pub fn get_active(&self, conversation_id: &str) -> Option<ActiveConversation> {
        self.state.lock().sessions.get(conversation_id).cloned()
    }

    /// All live sessions for a user.
    ///
    /// Filters through the live session map, so a stale per-user index entry
    /// (id whose session was evicted) is never returned.
    #[must_use]
    pub fn user_active_conversations(&self, user_id: &str) -> Vec<ActiveConversation> {
        let state = self.state.lock();
        state.by_user.get(user_id).map_or_else(Vec::new, |ids| {
            ids.iter()
                .filter_map(|id| state.sessions.get(id).cloned())
                .collect()
        })
    }

    /// Persist a partial update, refresh the cached snapshot, and broadcast
    /// the new state to subscribed clients.
    ///
    /// Silently skipped (returns `false`) when no session exists or the
    /// store reports no such row; store failures are logged and also
    /// reported as `false`.
    pub async fn update_conversation_state(
        &self,
        conversation_id: &str,
        updates: Map<String, Value>,
    ) -> bool {
        if !self.state.lock().sessions.contains_key(conversation_id) {
            debug!(conversation_id, "update on inactive conversation skipped");
            return false;
        }

        let updated = match self.store.update_conversation(conversation_id, updates).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                debug!(conversation_id, "conversation missing in store, update skipped");
                return false;
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "conversation update failed");
                return false;
            }
        };

        {
            let mut state = self.state.lock();
            // The session may have been evicted while the store call was in
            // flight.
            let Some(session) = state.sessions.get_mut(conversation_id) else {
                return false;
            };
            session.conversation = updated.clone();
            session.last_activity = Utc::now();
        }

        let mut data = Map::new();
        let _ = data.insert(
            "conversation".into(),
            serde_json::to_value(&updated).unwrap_or(Value::Null),
        );
        let message = BroadcastMessage::now(
            ConversationEventType::ConversationUpdated.as_str(),
            data,
        );
        if let Err(e) = self
            .transport
            .broadcast_to_conversation(conversation_id, message)
            .await
        {
            warn!(conversation_id, error = %e, "conversation update broadcast failed");
        }
        true
    }

    /// Evict every session that has no connected clients and has been idle
    /// longer than `idle_after`. Returns the eviction count.
    ///
    /// Reads "now" once; callable independently of the sweep timer.
    pub fn cleanup_idle(&self, idle_after: Duration) -> usize {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(idle_after).unwrap_or(chrono::Duration::MAX);

        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.connected_clients.is_empty() && now - s.last_activity > cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = state.sessions.remove(id) {
                if let Some(ids) = state.by_user.get_mut(&session.user_id) {
                    let _ = ids.remove(id);
                    if ids.is_empty() {
                        let _ = state.by_user.remove(&session.user_id);
                    }
                }
                debug!(conversation_id = %id, "idle conversation evicted");
            }
        }
        gauge!("parley_active_conversations").set(state.sessions.len() as f64);
        if !expired.is_empty() {
            info!(evicted = expired.len(), "idle conversation sweep");
        }
        expired.len()
    }

    /// Aggregate counters over the live session set.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            active_conversations: state.sessions.len(),
            total_clients: state
                .sessions
                .values()
                .map(|s| s.connected_clients.len())
                .sum(),
            users_with_active_conversations: state
                .sessions
                .values()
                .map(|s| s.user_id.as_str())
                .collect::<HashSet<_>>()
                .len(),
        }
    }

    /// Hand a live session to its owner; anyone else is rejected.
    fn authorize(
        session: ActiveConversation,
        user_id: &str,
    ) -> Result<ActiveConversation, SessionError> {
        if session.user_id == user_id {
            Ok(session)
        } else {
            Err(SessionError::Unauthorized {
                conversation_id: session.conversation_id,
                user_id: user_id.to_owned(),
            })
        }
    }

    /// Get (or create) the single-flight guard for a conversation load.
    fn load_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.load_locks.lock();
        // Opportunistically prune dead weak refs when the map grows.
        if locks.len() > 64 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }
        if let Some(existing) = locks.get(conversation_id).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let _ = locks.insert(conversation_id.to_owned(), Arc::downgrade(&lock));
        lock
    }

    /// Backdate a session's activity timestamp (test seam for the sweep).
    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, conversation_id: &str, by: Duration) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(conversation_id) {
            session.last_activity -=
                chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
