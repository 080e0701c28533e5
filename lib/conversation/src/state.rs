//! Durable per-session conversation state and the diffs that evolve it.
//!
//! State is event-sourced in the small: every checkpoint stores both the
//! resulting snapshot and the [`CheckpointDiff`] that produced it. Folding
//! the diffs of a thread in sequence order reproduces the latest snapshot,
//! including `pending_count`, which is recomputed by the transition rules
//! rather than trusted from storage.

use crate::error::{LedgerError, ReplayError};
use crate::ledger::Ledger;
use crate::message::{Turn, TurnRole};
use chatledger_ai::LlmMessage;
use chatledger_core::TurnId;
use serde::{Deserialize, Serialize};

/// Prefix of the synthetic system turn that carries the running summary.
pub const SUMMARY_PREAMBLE: &str = "This is a summary of the conversation so far: ";

/// Which transition produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Session creation.
    Seed,
    /// A user turn and its reply were appended.
    Generate,
    /// Old turns were folded into the summary.
    Compact,
}

impl TransitionKind {
    /// Returns the storage name of the transition.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Generate => "generate",
            Self::Compact => "compact",
        }
    }
}

/// The change a single transition applied to the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum CheckpointDiff {
    /// Initial turns of a new session.
    Seed { turns: Vec<Turn> },
    /// Turns appended by a generate transition.
    Generate { appended: Vec<Turn> },
    /// Tombstones and the new summary written by compaction.
    Compact {
        tombstones: Vec<TurnId>,
        summary: String,
    },
}

impl CheckpointDiff {
    /// Returns the transition kind.
    #[must_use]
    pub fn kind(&self) -> TransitionKind {
        match self {
            Self::Seed { .. } => TransitionKind::Seed,
            Self::Generate { .. } => TransitionKind::Generate,
            Self::Compact { .. } => TransitionKind::Compact,
        }
    }

    /// Returns the turns this diff appends.
    #[must_use]
    pub fn appended(&self) -> &[Turn] {
        match self {
            Self::Seed { turns } => turns,
            Self::Generate { appended } => appended,
            Self::Compact { .. } => &[],
        }
    }

    /// Returns the turn ids this diff tombstones.
    #[must_use]
    pub fn tombstones(&self) -> &[TurnId] {
        match self {
            Self::Compact { tombstones, .. } => tombstones,
            Self::Seed { .. } | Self::Generate { .. } => &[],
        }
    }
}

/// The durable state of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    /// Effective turn sequence.
    pub ledger: Ledger,
    /// Running summary; empty means no summary yet.
    pub summary: String,
    /// Replies appended since the last compaction (reset to the surviving
    /// turn count when compaction runs).
    pub pending_count: u32,
}

impl ConversationState {
    /// Builds the seed diff for a new session with one system turn.
    #[must_use]
    pub fn seed(system_prompt: impl Into<String>) -> CheckpointDiff {
        CheckpointDiff::Seed {
            turns: vec![Turn::system(system_prompt)],
        }
    }

    /// Returns the effective turns.
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        self.ledger.turns()
    }

    /// Returns true if a summary has been written.
    #[must_use]
    pub fn has_summary(&self) -> bool {
        !self.summary.is_empty()
    }

    /// Builds the completion context for a new user turn: the summary
    /// preamble (if any), every effective turn, then the user turn.
    #[must_use]
    pub fn prompt_context(&self, user_turn: &Turn) -> Vec<LlmMessage> {
        let mut messages = Vec::with_capacity(self.ledger.len() + 2);
        if self.has_summary() {
            messages.push(LlmMessage::system(format!(
                "{SUMMARY_PREAMBLE}{}",
                self.summary
            )));
        }
        messages.extend(self.turns().iter().map(Turn::to_llm_message));
        messages.push(user_turn.to_llm_message());
        messages
    }

    /// Applies a diff, all or nothing.
    ///
    /// Appends are applied before tombstones. `pending_count` follows the
    /// transition rules: a seed resets it to zero, a generate adds one per
    /// appended assistant turn, and a compaction sets it to the number of
    /// turns left in the ledger.
    ///
    /// # Errors
    ///
    /// Returns a `LedgerError` if the diff would duplicate an id or
    /// tombstone an unknown turn; the state is left untouched.
    pub fn apply(&mut self, diff: &CheckpointDiff) -> Result<(), LedgerError> {
        let mut next = match diff {
            CheckpointDiff::Seed { .. } => Self::default(),
            _ => self.clone(),
        };

        for turn in diff.appended() {
            next.ledger.append(turn.clone())?;
        }
        for id in diff.tombstones() {
            next.ledger.tombstone(*id)?;
        }

        match diff {
            CheckpointDiff::Seed { .. } => next.pending_count = 0,
            CheckpointDiff::Generate { appended } => {
                let replies = appended
                    .iter()
                    .filter(|turn| turn.role == TurnRole::Assistant)
                    .count();
                next.pending_count = next.pending_count.saturating_add(replies as u32);
            }
            CheckpointDiff::Compact { summary, .. } => {
                next.summary = summary.clone();
                next.pending_count = next.ledger.len() as u32;
            }
        }

        *self = next;
        Ok(())
    }

    /// Rebuilds state by folding diffs in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence is empty, does not start with a
    /// seed, contains a second seed, or violates ledger rules.
    pub fn replay<'a>(
        diffs: impl IntoIterator<Item = &'a CheckpointDiff>,
    ) -> Result<Self, ReplayError> {
        let mut diffs = diffs.into_iter();
        let first = diffs.next().ok_or(ReplayError::NoCheckpoints)?;
        if first.kind() != TransitionKind::Seed {
            return Err(ReplayError::MissingSeed);
        }

        let mut state = Self::default();
        state.apply(first)?;
        for diff in diffs {
            if diff.kind() == TransitionKind::Seed {
                return Err(ReplayError::DuplicateSeed);
            }
            state.apply(diff)?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> ConversationState {
        let mut state = ConversationState::default();
        state.apply(&ConversationState::seed("You are terse.")).unwrap();
        state
    }

    fn exchange(user: &str, reply: &str) -> CheckpointDiff {
        CheckpointDiff::Generate {
            appended: vec![Turn::user(user), Turn::assistant(reply)],
        }
    }

    #[test]
    fn seed_creates_single_system_turn() {
        let state = seeded();
        assert_eq!(state.turns().len(), 1);
        assert_eq!(state.turns()[0].role, TurnRole::System);
        assert_eq!(state.pending_count, 0);
        assert!(!state.has_summary());
    }

    #[test]
    fn generate_counts_only_assistant_turns() {
        let mut state = seeded();
        state.apply(&exchange("Hi", "Hello")).unwrap();
        assert_eq!(state.turns().len(), 3);
        assert_eq!(state.pending_count, 1);
    }

    #[test]
    fn compact_sets_pending_to_survivors() {
        let mut state = seeded();
        for _ in 0..3 {
            state.apply(&exchange("Hi", "Hello")).unwrap();
        }
        let doomed: Vec<TurnId> = state.turns()[..5].iter().map(|t| t.id).collect();

        state
            .apply(&CheckpointDiff::Compact {
                tombstones: doomed,
                summary: "greetings".to_string(),
            })
            .unwrap();

        assert_eq!(state.turns().len(), 2);
        assert_eq!(state.pending_count, 2);
        assert_eq!(state.summary, "greetings");
    }

    #[test]
    fn failed_apply_leaves_state_untouched() {
        let mut state = seeded();
        let before = state.clone();
        let existing = state.turns()[0].clone();

        let err = state
            .apply(&CheckpointDiff::Generate {
                appended: vec![Turn::user("new"), existing.clone()],
            })
            .unwrap_err();

        assert_eq!(err, LedgerError::DuplicateTurnId { turn_id: existing.id });
        assert_eq!(state, before);
    }

    #[test]
    fn prompt_context_without_summary() {
        let state = seeded();
        let user = Turn::user("Hi");
        let context = state.prompt_context(&user);

        assert_eq!(
            context,
            vec![LlmMessage::system("You are terse."), LlmMessage::user("Hi")]
        );
    }

    #[test]
    fn prompt_context_prepends_summary() {
        let mut state = seeded();
        state.summary = "user greeted twice".to_string();
        let context = state.prompt_context(&Turn::user("Hi"));

        assert_eq!(context.len(), 3);
        assert_eq!(
            context[0],
            LlmMessage::system("This is a summary of the conversation so far: user greeted twice")
        );
    }

    #[test]
    fn replay_reproduces_snapshot() {
        let seed = ConversationState::seed("rules");
        let mut live = ConversationState::default();
        let mut diffs = vec![seed];
        live.apply(&diffs[0]).unwrap();

        for i in 0..4 {
            let diff = exchange(&format!("q{i}"), &format!("a{i}"));
            live.apply(&diff).unwrap();
            diffs.push(diff);
        }
        let compact = CheckpointDiff::Compact {
            tombstones: live.turns()[..7].iter().map(|t| t.id).collect(),
            summary: "four questions".to_string(),
        };
        live.apply(&compact).unwrap();
        diffs.push(compact);

        let replayed = ConversationState::replay(&diffs).unwrap();
        assert_eq!(replayed, live);
        assert_eq!(replayed.pending_count, 2);
    }

    #[test]
    fn replay_requires_leading_seed() {
        assert_eq!(
            ConversationState::replay(std::iter::empty()).unwrap_err(),
            ReplayError::NoCheckpoints
        );
        assert_eq!(
            ConversationState::replay(&[exchange("a", "b")]).unwrap_err(),
            ReplayError::MissingSeed
        );

        let seed = ConversationState::seed("x");
        assert_eq!(
            ConversationState::replay(&[seed.clone(), seed]).unwrap_err(),
            ReplayError::DuplicateSeed
        );
    }

    #[test]
    fn diff_serializes_with_transition_tag() {
        let diff = CheckpointDiff::Compact {
            tombstones: vec![],
            summary: "s".to_string(),
        };
        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(json["transition"], "compact");
        assert_eq!(diff.kind().as_str(), "compact");
    }
}
