//! SQLite checkpoint store.
//!
//! Every transition is one row in `checkpoints`, keyed by
//! `(thread_id, sequence)`. State and diff are stored as versioned JSON
//! envelopes. A row is written by a single conditional insert that checks
//! the writer's parent sequence, and the primary key backs that check up.

use async_trait::async_trait;
use chatledger_conversation::store::next_sequence;
use chatledger_conversation::{
    Checkpoint, CheckpointDiff, ConversationState, Envelope, RawEnvelope, SessionStore, StoreError,
};
use chatledger_core::{ThreadId, TurnId};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::{debug, instrument};

/// Row type for checkpoint queries.
#[derive(FromRow)]
struct CheckpointRow {
    thread_id: String,
    sequence: i64,
    transition: String,
    state: String,
    diff: String,
    created_at: DateTime<Utc>,
}

impl CheckpointRow {
    fn try_into_checkpoint(self) -> Result<Checkpoint, StoreError> {
        let thread_id = ThreadId::from_str(&self.thread_id).map_err(|e| StoreError::Corrupt {
            reason: format!("invalid thread id '{}': {}", self.thread_id, e),
        })?;
        let sequence = u64::try_from(self.sequence).map_err(|_| StoreError::Corrupt {
            reason: format!("negative sequence {} for {}", self.sequence, thread_id),
        })?;
        let state: ConversationState = decode_envelope("state", &self.state)?;
        let diff: CheckpointDiff = decode_envelope("diff", &self.diff)?;
        if diff.kind().as_str() != self.transition {
            return Err(StoreError::Corrupt {
                reason: format!(
                    "checkpoint {thread_id}/{sequence} is labelled '{}' but holds a {} diff",
                    self.transition,
                    diff.kind().as_str()
                ),
            });
        }

        Ok(Checkpoint {
            thread_id,
            sequence,
            state,
            diff,
            created_at: self.created_at,
        })
    }
}

fn decode_envelope<T: for<'de> Deserialize<'de>>(column: &str, text: &str) -> Result<T, StoreError> {
    let raw = RawEnvelope::from_json(text).map_err(|e| StoreError::Corrupt {
        reason: format!("{column} is not an envelope: {e}"),
    })?;
    if !raw.is_supported() {
        return Err(StoreError::Corrupt {
            reason: format!("{column} envelope version {} is not supported", raw.version),
        });
    }
    raw.deserialize_payload::<T>()
        .map(Envelope::into_payload)
        .map_err(|e| StoreError::Corrupt {
            reason: format!("{column} payload does not decode: {e}"),
        })
}

fn write_failed(error: sqlx::Error) -> StoreError {
    StoreError::WriteFailed {
        reason: error.to_string(),
    }
}

fn read_failed(error: sqlx::Error) -> StoreError {
    StoreError::ReadFailed {
        reason: error.to_string(),
    }
}

fn sequence_column(sequence: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence).map_err(|_| StoreError::WriteFailed {
        reason: format!("sequence {sequence} does not fit the sequence column"),
    })
}

fn is_missing_table(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.message().contains("no such table"))
}

/// Inserts the row only if `parent` is still the thread's latest sequence.
///
/// The check and the insert are one statement, so the write lock is taken
/// before the parent is read and a racing writer waits instead of failing.
const APPEND_CHECKPOINT: &str = r#"
INSERT INTO checkpoints (thread_id, sequence, transition, state, diff, created_at)
SELECT ?1, ?2, ?3, ?4, ?5, ?6
WHERE (SELECT MAX(sequence) FROM checkpoints WHERE thread_id = ?1) IS ?7
"#;

async fn append_checkpoint(
    pool: &SqlitePool,
    parent: Option<u64>,
    checkpoint: &Checkpoint,
    state_json: &str,
    diff_json: &str,
) -> Result<(), StoreError> {
    let thread_id = checkpoint.thread_id;
    let parent_column = parent.map(sequence_column).transpose()?;
    let inserted = sqlx::query(APPEND_CHECKPOINT)
        .bind(thread_id.to_string())
        .bind(sequence_column(checkpoint.sequence)?)
        .bind(checkpoint.diff.kind().as_str())
        .bind(state_json)
        .bind(diff_json)
        .bind(checkpoint.created_at)
        .bind(parent_column)
        .execute(pool)
        .await;

    match inserted {
        Ok(result) if result.rows_affected() == 1 => Ok(()),
        Ok(_) => {
            let latest: Option<i64> =
                sqlx::query_scalar("SELECT MAX(sequence) FROM checkpoints WHERE thread_id = ?")
                    .bind(thread_id.to_string())
                    .fetch_one(pool)
                    .await
                    .map_err(write_failed)?;
            Err(StoreError::Conflict {
                thread_id,
                expected_parent: parent,
                actual_latest: latest.and_then(|seq| u64::try_from(seq).ok()),
            })
        }
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict {
            thread_id,
            expected_parent: parent,
            actual_latest: Some(checkpoint.sequence),
        }),
        Err(e) => Err(write_failed(e)),
    }
}

/// Finds a turn id among the turns appended by seed and generate diffs.
const HAS_TURN: &str = r#"
SELECT EXISTS (
    SELECT 1 FROM checkpoints c, json_each(c.diff, '$.payload.appended') t
    WHERE c.thread_id = ?1 AND json_extract(t.value, '$.id') = ?2
    UNION ALL
    SELECT 1 FROM checkpoints c, json_each(c.diff, '$.payload.turns') t
    WHERE c.thread_id = ?1 AND json_extract(t.value, '$.id') = ?2
)
"#;

const SELECT_COLUMNS: &str = "SELECT thread_id, sequence, transition, state, diff, created_at FROM checkpoints";

/// Checkpoint store backed by SQLite.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Creates a store on a pool whose schema has been migrated.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, state, diff), fields(thread_id = %thread_id, transition = diff.kind().as_str()))]
    async fn put(
        &self,
        thread_id: ThreadId,
        parent: Option<u64>,
        state: &ConversationState,
        diff: &CheckpointDiff,
    ) -> Result<Checkpoint, StoreError> {
        let state_json = Envelope::new(state).to_json().map_err(|e| StoreError::WriteFailed {
            reason: format!("state does not serialize: {e}"),
        })?;
        let diff_json = Envelope::new(diff).to_json().map_err(|e| StoreError::WriteFailed {
            reason: format!("diff does not serialize: {e}"),
        })?;
        let checkpoint = Checkpoint {
            thread_id,
            sequence: next_sequence(parent),
            state: state.clone(),
            diff: diff.clone(),
            created_at: Utc::now(),
        };

        append_checkpoint(&self.pool, parent, &checkpoint, &state_json, &diff_json).await?;

        debug!(sequence = checkpoint.sequence, "checkpoint written");
        Ok(checkpoint)
    }

    async fn latest(&self, thread_id: ThreadId) -> Result<Checkpoint, StoreError> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE thread_id = ? ORDER BY sequence DESC LIMIT 1"
        ))
        .bind(thread_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(read_failed)?;

        match row {
            Some(r) => r.try_into_checkpoint(),
            None => Err(StoreError::NotFound { thread_id }),
        }
    }

    async fn list_thread_ids(&self) -> Result<BTreeSet<ThreadId>, StoreError> {
        let rows: Vec<String> = match sqlx::query_scalar("SELECT DISTINCT thread_id FROM checkpoints")
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_missing_table(&e) => {
                debug!("checkpoint table missing; no sessions");
                return Ok(BTreeSet::new());
            }
            Err(e) => return Err(read_failed(e)),
        };

        rows.iter()
            .map(|id| {
                ThreadId::from_str(id).map_err(|e| StoreError::Corrupt {
                    reason: format!("invalid thread id '{id}': {e}"),
                })
            })
            .collect()
    }

    async fn history(&self, thread_id: ThreadId) -> Result<Vec<Checkpoint>, StoreError> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE thread_id = ? ORDER BY sequence ASC"
        ))
        .bind(thread_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed)?;

        if rows.is_empty() {
            return Err(StoreError::NotFound { thread_id });
        }
        rows.into_iter().map(CheckpointRow::try_into_checkpoint).collect()
    }

    async fn at(&self, thread_id: ThreadId, sequence: u64) -> Result<Checkpoint, StoreError> {
        let Ok(sequence) = i64::try_from(sequence) else {
            return Err(StoreError::NotFound { thread_id });
        };
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE thread_id = ? AND sequence = ?"
        ))
        .bind(thread_id.to_string())
        .bind(sequence)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_failed)?;

        match row {
            Some(r) => r.try_into_checkpoint(),
            None => Err(StoreError::NotFound { thread_id }),
        }
    }

    async fn has_turn(&self, thread_id: ThreadId, turn_id: TurnId) -> Result<bool, StoreError> {
        let found: i64 = sqlx::query_scalar(HAS_TURN)
            .bind(thread_id.to_string())
            .bind(turn_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(read_failed)?;
        Ok(found != 0)
    }
}
