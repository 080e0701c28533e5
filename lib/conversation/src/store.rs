//! Checkpoint storage contract.
//!
//! A store maps a thread to its append-only list of checkpoints. Writes are
//! all-or-nothing and name the sequence they build on; a write whose parent
//! is not the latest checkpoint is rejected, so two writers can never both
//! extend the same snapshot.

use crate::error::StoreError;
use crate::state::{CheckpointDiff, ConversationState};
use async_trait::async_trait;
use chatledger_core::{ThreadId, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// An immutable persisted snapshot of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The thread this checkpoint belongs to.
    pub thread_id: ThreadId,
    /// Position in the thread's history, starting at 1.
    pub sequence: u64,
    /// State after the transition.
    pub state: ConversationState,
    /// What the transition changed.
    pub diff: CheckpointDiff,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Returns the sequence number the next checkpoint must be written after.
    #[must_use]
    pub fn parent_for_next(&self) -> Option<u64> {
        Some(self.sequence)
    }
}

/// Returns the sequence a write with the given parent will receive.
#[must_use]
pub fn next_sequence(parent: Option<u64>) -> u64 {
    parent.map_or(1, |seq| seq + 1)
}

/// Trait for checkpoint storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Appends a checkpoint after `parent` (`None` for the first one).
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if `parent` is not the latest sequence, or
    /// `WriteFailed` if the write did not durably succeed.
    async fn put(
        &self,
        thread_id: ThreadId,
        parent: Option<u64>,
        state: &ConversationState,
        diff: &CheckpointDiff,
    ) -> Result<Checkpoint, StoreError>;

    /// Returns the latest checkpoint of a thread.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the thread has no checkpoint.
    async fn latest(&self, thread_id: ThreadId) -> Result<Checkpoint, StoreError>;

    /// Returns every thread that has at least one checkpoint.
    ///
    /// An uninitialized store yields an empty set.
    async fn list_thread_ids(&self) -> Result<BTreeSet<ThreadId>, StoreError>;

    /// Returns all checkpoints of a thread in sequence order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the thread has no checkpoint.
    async fn history(&self, thread_id: ThreadId) -> Result<Vec<Checkpoint>, StoreError>;

    /// Returns the checkpoint at a given sequence.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such checkpoint.
    async fn at(&self, thread_id: ThreadId, sequence: u64) -> Result<Checkpoint, StoreError>;

    /// Returns true if any checkpoint of the thread appended a turn with this id.
    ///
    /// Turns tombstoned by compaction still count. An unknown thread has no
    /// turns. The default walks the full history; stores that can answer
    /// from an index should override it.
    async fn has_turn(&self, thread_id: ThreadId, turn_id: TurnId) -> Result<bool, StoreError> {
        match self.history(thread_id).await {
            Ok(history) => Ok(history
                .iter()
                .any(|checkpoint| checkpoint.diff.appended().iter().any(|t| t.id == turn_id))),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Process-local store, for tests and single-process deployments without a database.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    threads: Mutex<HashMap<ThreadId, Vec<Checkpoint>>>,
}

impl InMemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_threads<T>(
        &self,
        f: impl FnOnce(&mut HashMap<ThreadId, Vec<Checkpoint>>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut threads = self.threads.lock().map_err(|_| StoreError::ReadFailed {
            reason: "store lock poisoned".to_string(),
        })?;
        f(&mut threads)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(
        &self,
        thread_id: ThreadId,
        parent: Option<u64>,
        state: &ConversationState,
        diff: &CheckpointDiff,
    ) -> Result<Checkpoint, StoreError> {
        self.with_threads(|threads| {
            let history = threads.entry(thread_id).or_default();
            let actual_latest = history.last().map(|c| c.sequence);
            if actual_latest != parent {
                return Err(StoreError::Conflict {
                    thread_id,
                    expected_parent: parent,
                    actual_latest,
                });
            }

            let checkpoint = Checkpoint {
                thread_id,
                sequence: next_sequence(parent),
                state: state.clone(),
                diff: diff.clone(),
                created_at: Utc::now(),
            };
            history.push(checkpoint.clone());
            Ok(checkpoint)
        })
    }

    async fn latest(&self, thread_id: ThreadId) -> Result<Checkpoint, StoreError> {
        self.with_threads(|threads| {
            threads
                .get(&thread_id)
                .and_then(|history| history.last())
                .cloned()
                .ok_or(StoreError::NotFound { thread_id })
        })
    }

    async fn list_thread_ids(&self) -> Result<BTreeSet<ThreadId>, StoreError> {
        self.with_threads(|threads| {
            Ok(threads
                .iter()
                .filter(|(_, history)| !history.is_empty())
                .map(|(id, _)| *id)
                .collect())
        })
    }

    async fn history(&self, thread_id: ThreadId) -> Result<Vec<Checkpoint>, StoreError> {
        self.with_threads(|threads| {
            threads
                .get(&thread_id)
                .filter(|history| !history.is_empty())
                .cloned()
                .ok_or(StoreError::NotFound { thread_id })
        })
    }

    async fn at(&self, thread_id: ThreadId, sequence: u64) -> Result<Checkpoint, StoreError> {
        self.with_threads(|threads| {
            threads
                .get(&thread_id)
                .and_then(|history| history.iter().find(|c| c.sequence == sequence))
                .cloned()
                .ok_or(StoreError::NotFound { thread_id })
        })
    }

    async fn has_turn(&self, thread_id: ThreadId, turn_id: TurnId) -> Result<bool, StoreError> {
        self.with_threads(|threads| {
            Ok(threads.get(&thread_id).is_some_and(|history| {
                history
                    .iter()
                    .any(|checkpoint| checkpoint.diff.appended().iter().any(|t| t.id == turn_id))
            }))
        })
    }
}
