//! Compaction policy: when to fold history into the running summary, and
//! which turns survive.

use crate::message::Turn;
use crate::state::{CheckpointDiff, ConversationState};
use chatledger_core::TurnId;
use serde::{Deserialize, Serialize};

/// Replies that may accumulate before compaction runs.
pub const DEFAULT_SUMMARY_THRESHOLD: u32 = 10;

/// Raw turns retained after compaction.
pub const DEFAULT_MESSAGES_TO_KEEP: usize = 2;

const CREATE_HEADER: &str = "Please create a concise summary of the following conversation:";
const EXTEND_HEADER: &str = "Please extend this summary with the new conversation excerpts below:";

/// Thresholds controlling compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Compact once `pending_count` reaches this value (T).
    pub threshold: u32,
    /// Number of most recent turns kept verbatim (K).
    pub keep_last: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SUMMARY_THRESHOLD,
            keep_last: DEFAULT_MESSAGES_TO_KEEP,
        }
    }
}

impl CompactionPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(threshold: u32, keep_last: usize) -> Self {
        Self {
            threshold,
            keep_last,
        }
    }

    /// Returns true if enough replies have accumulated to compact.
    #[must_use]
    pub fn should_compact(&self, pending_count: u32) -> bool {
        pending_count >= self.threshold
    }

    /// Builds the summarization prompt over every ledger turn.
    ///
    /// The synthetic summary preamble sent at generate time never enters
    /// the ledger, so it is not part of the transcript here.
    #[must_use]
    pub fn summary_prompt(&self, turns: &[Turn], summary: &str) -> String {
        let transcript = turns
            .iter()
            .map(Turn::transcript_line)
            .collect::<Vec<_>>()
            .join("\n");

        if summary.is_empty() {
            format!("{CREATE_HEADER}\n{transcript}")
        } else {
            format!("Previous Summary:\n{summary}\n\n{EXTEND_HEADER}\n{transcript}")
        }
    }

    /// Returns the ids of every turn outside the last `keep_last`.
    #[must_use]
    pub fn tombstones_for(&self, turns: &[Turn]) -> Vec<TurnId> {
        let remove = turns.len().saturating_sub(self.keep_last);
        turns[..remove].iter().map(|turn| turn.id).collect()
    }

    /// Builds the compaction diff for a state and a freshly generated summary.
    #[must_use]
    pub fn compact(&self, state: &ConversationState, new_summary: String) -> CheckpointDiff {
        CheckpointDiff::Compact {
            tombstones: self.tombstones_for(state.turns()),
            summary: new_summary,
        }
    }
}
