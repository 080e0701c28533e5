//! The message ledger: the effective, ordered sequence of turns.
//!
//! The ledger only ever changes in two ways: a turn is appended, or a turn
//! is removed by a tombstone naming its id. Turns are never edited in
//! place. Checkpoints record those two operations as their diff, so any
//! snapshot can be rebuilt by replaying diffs in order.

use crate::error::LedgerError;
use crate::message::Turn;
use chatledger_core::TurnId;
use serde::{Deserialize, Deserializer, Serialize};

/// The effective turn sequence, with tombstones already folded in.
///
/// Invariant: no two turns share an id. Deserialization enforces it, so a
/// stored snapshot with a repeated id is rejected rather than trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Ledger {
    turns: Vec<Turn>,
}

impl Ledger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the turns in conversation order.
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Returns the number of live turns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Returns true if the ledger holds no turns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Returns true if a live turn carries this id.
    #[must_use]
    pub fn contains(&self, id: TurnId) -> bool {
        self.position(id).is_some()
    }

    /// Returns the live turn with this id.
    #[must_use]
    pub fn get(&self, id: TurnId) -> Option<&Turn> {
        self.position(id).map(|idx| &self.turns[idx])
    }

    /// Returns the assistant turn directly following `id`, if there is one.
    #[must_use]
    pub fn reply_to(&self, id: TurnId) -> Option<&Turn> {
        let idx = self.position(id)?;
        self.turns
            .get(idx + 1)
            .filter(|turn| turn.role == crate::message::TurnRole::Assistant)
    }

    /// Appends a turn.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTurnId` if a live turn already has the same id.
    pub fn append(&mut self, turn: Turn) -> Result<(), LedgerError> {
        if self.contains(turn.id) {
            return Err(LedgerError::DuplicateTurnId { turn_id: turn.id });
        }
        self.turns.push(turn);
        Ok(())
    }

    /// Removes the turn named by a tombstone, returning it.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTurn` if no live turn has the id.
    pub fn tombstone(&mut self, id: TurnId) -> Result<Turn, LedgerError> {
        let idx = self
            .position(id)
            .ok_or(LedgerError::UnknownTurn { turn_id: id })?;
        Ok(self.turns.remove(idx))
    }

    fn position(&self, id: TurnId) -> Option<usize> {
        self.turns.iter().position(|turn| turn.id == id)
    }
}

impl<'de> Deserialize<'de> for Ledger {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let turns = Vec::<Turn>::deserialize(deserializer)?;
        let mut ledger = Self::new();
        for turn in turns {
            ledger.append(turn).map_err(serde::de::Error::custom)?;
        }
        Ok(ledger)
    }
}

impl FromIterator<Turn> for Ledger {
    /// Builds a ledger, keeping the first occurrence of any repeated id.
    fn from_iter<I: IntoIterator<Item = Turn>>(iter: I) -> Self {
        let mut ledger = Self::new();
        for turn in iter {
            let _ = ledger.append(turn);
        }
        ledger
    }
}
