//! Session lifecycle: creating, listing and reading sessions.

use crate::error::{ConversationError, ReplayError};
use crate::state::ConversationState;
use crate::store::{Checkpoint, SessionStore};
use chatledger_core::ThreadId;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument};

/// Creates and looks up sessions backed by a [`SessionStore`].
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    default_system_prompt: String,
}

impl SessionManager {
    /// Creates a manager that seeds prompt-less sessions with `default_system_prompt`.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, default_system_prompt: impl Into<String>) -> Self {
        Self {
            store,
            default_system_prompt: default_system_prompt.into(),
        }
    }

    /// Creates a session seeded with one system turn and writes its first
    /// checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the checkpoint was not durably written.
    #[instrument(skip(self, system_prompt))]
    pub async fn create_session(
        &self,
        system_prompt: Option<&str>,
    ) -> Result<ThreadId, ConversationError> {
        let thread_id = ThreadId::new();
        let prompt = system_prompt.unwrap_or(&self.default_system_prompt);
        let diff = ConversationState::seed(prompt);

        let mut state = ConversationState::default();
        state
            .apply(&diff)
            .map_err(|e| ConversationError::StorageError {
                reason: e.to_string(),
            })?;

        self.store
            .put(thread_id, None, &state, &diff)
            .await
            .map_err(|e| ConversationError::StorageError {
                reason: e.to_string(),
            })?;

        info!(%thread_id, "session created");
        Ok(thread_id)
    }

    /// Lists every session with at least one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store cannot be read. An empty or
    /// uninitialized store is not an error.
    pub async fn list_sessions(&self) -> Result<BTreeSet<ThreadId>, ConversationError> {
        self.store
            .list_thread_ids()
            .await
            .map_err(|e| ConversationError::StorageError {
                reason: e.to_string(),
            })
    }

    /// Returns the latest state of a session.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session has no checkpoint.
    pub async fn get_state(&self, thread_id: ThreadId) -> Result<ConversationState, ConversationError> {
        Ok(self.latest(thread_id).await?.state)
    }

    /// Returns the latest checkpoint of a session.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session has no checkpoint.
    pub async fn latest(&self, thread_id: ThreadId) -> Result<Checkpoint, ConversationError> {
        self.store
            .latest(thread_id)
            .await
            .map_err(|e| ConversationError::from_store(e, thread_id))
    }

    /// Returns every checkpoint of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session has no checkpoint.
    pub async fn history(&self, thread_id: ThreadId) -> Result<Vec<Checkpoint>, ConversationError> {
        self.store
            .history(thread_id)
            .await
            .map_err(|e| ConversationError::from_store(e, thread_id))
    }

    /// Returns the checkpoint at `sequence`.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if there is no such checkpoint.
    pub async fn state_at(
        &self,
        thread_id: ThreadId,
        sequence: u64,
    ) -> Result<Checkpoint, ConversationError> {
        self.store
            .at(thread_id, sequence)
            .await
            .map_err(|e| ConversationError::from_store(e, thread_id))
    }

    /// Rebuilds a session's state from its diff log, ignoring stored snapshots.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for an unknown session and `StorageError`
    /// if the log does not fold cleanly.
    pub async fn rebuild_state(
        &self,
        thread_id: ThreadId,
    ) -> Result<ConversationState, ConversationError> {
        let history = self.history(thread_id).await?;
        ConversationState::replay(history.iter().map(|checkpoint| &checkpoint.diff)).map_err(
            |e: ReplayError| ConversationError::StorageError {
                reason: format!("checkpoint log for {thread_id} does not replay: {e}"),
            },
        )
    }
}
