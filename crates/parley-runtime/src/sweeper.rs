//! Periodic idle-session sweep.
//!
//! Runs [`ConversationRegistry::cleanup_idle`] on a fixed interval in a
//! background task, with a cancellation token for clean shutdown. Eviction
//! policy lives in the registry; this module only owns the timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::ConversationRegistry;

/// How often the sweep runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// How long an empty session may sit untouched before eviction.
pub const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(1800);

/// Handle to the running sweep task.
pub struct IdleSweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl IdleSweeper {
    /// Spawn the sweep loop. The first sweep happens one `interval` after
    /// start, not immediately.
    #[must_use]
    pub fn start(
        registry: Arc<ConversationRegistry>,
        interval: Duration,
        idle_after: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval ticks immediately once; skip that so the first sweep
            // waits a full period
            let _ = ticker.tick().await;
            info!(
                interval_secs = interval.as_secs(),
                idle_after_secs = idle_after.as_secs(),
                "idle sweep started"
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.cleanup_idle(idle_after);
                        if evicted > 0 {
                            debug!(evicted, "idle sweep pass");
                        }
                    }
                }
            }
            debug!("idle sweep stopped");
        });
        Self { cancel, handle }
    }

    /// Spawn with [`DEFAULT_SWEEP_INTERVAL`] and [`DEFAULT_IDLE_AFTER`].
    #[must_use]
    pub fn start_with_defaults(registry: Arc<ConversationRegistry>) -> Self {
        Self::start(registry, DEFAULT_SWEEP_INTERVAL, DEFAULT_IDLE_AFTER)
    }

    /// Cancel the loop and wait for the task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::boundary::{ConversationStore, ConversationTransport};
    use parley_core::conversation::Conversation;
    use parley_core::events::BroadcastMessage;
    use serde_json::{Map, Value};

    struct SingleConversationStore;

    #[async_trait]
    impl ConversationStore for SingleConversationStore {
        async fn find_conversation(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
            Ok(Some(Conversation {
                id: id.to_owned(),
                user_id: "user-1".into(),
                title: None,
                updated_at: "2026-01-01T00:00:00Z".into(),
            }))
        }

        async fn update_conversation(
            &self,
            _id: &str,
            _updates: Map<String, Value>,
        ) -> anyhow::Result<Option<Conversation>> {
            Ok(None)
        }
    }

    struct NullTransport;

    #[async_trait]
    impl ConversationTransport for NullTransport {
        async fn broadcast_to_conversation(
            &self,
            _conversation_id: &str,
            _message: BroadcastMessage,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> Arc<ConversationRegistry> {
        Arc::new(ConversationRegistry::new(
            Arc::new(SingleConversationStore),
            Arc::new(NullTransport),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_sessions_on_schedule() {
        let registry = registry();
        let _ = registry.get_or_create("conv-1", "user-1").await.unwrap();
        registry.backdate_activity("conv-1", Duration::from_secs(7200));

        let sweeper = IdleSweeper::start(
            Arc::clone(&registry),
            Duration::from_secs(60),
            Duration::from_secs(1800),
        );
        tokio::task::yield_now().await;
        // Just under one interval: nothing swept yet
        tokio::time::advance(Duration::from_secs(59)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.stats().active_conversations, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.stats().active_conversations, 0);

        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_sessions_with_clients() {
        let registry = registry();
        let _ = registry.get_or_create("conv-1", "user-1").await.unwrap();
        assert!(registry.register_client("conv-1", "client-a"));
        registry.backdate_activity("conv-1", Duration::from_secs(7200));

        let sweeper = IdleSweeper::start(
            Arc::clone(&registry),
            Duration::from_secs(60),
            Duration::from_secs(1800),
        );
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.stats().active_conversations, 1);

        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_shuts_the_loop_down() {
        let sweeper = IdleSweeper::start(
            registry(),
            Duration::from_secs(60),
            Duration::from_secs(1800),
        );
        tokio::task::yield_now().await;
        sweeper.stop().await;
    }
}
