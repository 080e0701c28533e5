//! Error types for the conversation crate.
//!
//! - `ConversationError`: what callers of the engine see
//! - `StoreError`: checkpoint storage failures
//! - `LedgerError`: violations of ledger identity rules
//! - `ReplayError`: an invalid checkpoint diff sequence

use chatledger_core::{ThreadId, TurnId};
use std::fmt;

/// Errors surfaced by the session lifecycle and the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    /// No checkpoint exists for the thread.
    SessionNotFound { thread_id: ThreadId },
    /// The completion call failed or timed out. Nothing was persisted.
    CompletionFailed { reason: String },
    /// Summarization failed after a successful reply.
    CompactionFailed { reason: String },
    /// A durable read or write failed.
    StorageError { reason: String },
    /// The caller-supplied turn id is already in use and has no reply to replay.
    DuplicateTurn { turn_id: TurnId },
}

impl ConversationError {
    /// Returns true if repeating the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CompletionFailed { .. } | Self::CompactionFailed { .. }
        )
    }

    pub(crate) fn from_store(error: StoreError, thread_id: ThreadId) -> Self {
        match error {
            StoreError::NotFound { .. } => Self::SessionNotFound { thread_id },
            other => Self::StorageError {
                reason: other.to_string(),
            },
        }
    }
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound { thread_id } => write!(f, "session not found: {thread_id}"),
            Self::CompletionFailed { reason } => write!(f, "completion failed: {reason}"),
            Self::CompactionFailed { reason } => write!(f, "compaction failed: {reason}"),
            Self::StorageError { reason } => write!(f, "storage error: {reason}"),
            Self::DuplicateTurn { turn_id } => {
                write!(f, "turn {turn_id} already exists in the conversation")
            }
        }
    }
}

impl std::error::Error for ConversationError {}

/// Errors from checkpoint storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No checkpoint for the thread (or sequence).
    NotFound { thread_id: ThreadId },
    /// The write's parent is not the latest checkpoint.
    Conflict {
        thread_id: ThreadId,
        expected_parent: Option<u64>,
        actual_latest: Option<u64>,
    },
    /// Write did not durably succeed.
    WriteFailed { reason: String },
    /// Read failed.
    ReadFailed { reason: String },
    /// Stored payload could not be decoded.
    Corrupt { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { thread_id } => write!(f, "no checkpoint for {thread_id}"),
            Self::Conflict {
                thread_id,
                expected_parent,
                actual_latest,
            } => write!(
                f,
                "checkpoint conflict on {thread_id}: expected parent {expected_parent:?}, latest is {actual_latest:?}"
            ),
            Self::WriteFailed { reason } => write!(f, "checkpoint write failed: {reason}"),
            Self::ReadFailed { reason } => write!(f, "checkpoint read failed: {reason}"),
            Self::Corrupt { reason } => write!(f, "corrupt checkpoint: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from applying a diff to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// An appended turn reuses an id already in the effective ledger.
    DuplicateTurnId { turn_id: TurnId },
    /// A tombstone references a turn that is not in the effective ledger.
    UnknownTurn { turn_id: TurnId },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTurnId { turn_id } => write!(f, "duplicate turn id: {turn_id}"),
            Self::UnknownTurn { turn_id } => write!(f, "tombstone for unknown turn: {turn_id}"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Errors from rebuilding state out of a checkpoint diff sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// No diffs provided.
    NoCheckpoints,
    /// First diff was not a seed.
    MissingSeed,
    /// A seed appeared after the first diff.
    DuplicateSeed,
    /// A diff violated ledger rules.
    Ledger(LedgerError),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCheckpoints => write!(f, "no checkpoints provided"),
            Self::MissingSeed => write!(f, "first checkpoint must be a seed"),
            Self::DuplicateSeed => write!(f, "duplicate seed checkpoint"),
            Self::Ledger(e) => write!(f, "ledger error: {e}"),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<LedgerError> for ReplayError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}
