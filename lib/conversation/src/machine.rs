//! The conversation state machine.
//!
//! One call to [`ConversationMachine::advance`] moves a session forward by
//! exactly one user turn:
//!
//! 1. `AwaitingReply`: load the latest checkpoint, ask the completion
//!    backend for a reply, append the user turn and the reply, persist.
//! 2. Decide: route to `Compacting` if enough replies are pending,
//!    otherwise to `Idle`.
//! 3. `Compacting`: fold old turns into the summary, tombstone them,
//!    persist. A failure here is reported but never undoes step 1.
//!
//! The machine keeps no state between calls beyond what lives in the
//! store. Calls on the same thread are serialized by a per-thread lock held
//! across the whole chain; calls on different threads run concurrently.

use crate::compaction::CompactionPolicy;
use crate::config::ConversationConfig;
use crate::error::{ConversationError, LedgerError};
use crate::message::{IncomingMessage, Turn};
use crate::state::CheckpointDiff;
use crate::store::{Checkpoint, SessionStore};
use chatledger_ai::{LlmBackend, LlmError, LlmRequest, LlmResponse};
use chatledger_core::{ThreadId, TurnId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

/// Where a single `advance` call currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Waiting on the completion backend for a reply.
    AwaitingReply,
    /// Folding history into the summary.
    Compacting,
    /// Done for this call.
    Idle,
}

impl MachineState {
    /// The routing decision taken after a reply has been persisted.
    #[must_use]
    pub fn decide(pending_count: u32, policy: &CompactionPolicy) -> Self {
        if policy.should_compact(pending_count) {
            Self::Compacting
        } else {
            Self::Idle
        }
    }

    /// Returns true once the call has nothing left to do.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// What happened to compaction during an `advance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionStatus {
    /// The threshold was not reached.
    NotNeeded,
    /// History was compacted and persisted.
    Compacted {
        /// Number of turns tombstoned.
        tombstoned: usize,
        /// Sequence of the compaction checkpoint.
        sequence: u64,
    },
    /// Compaction failed; the reply is still durable and the next call retries.
    Failed(ConversationError),
}

/// Result of a successful `advance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvanceOutcome {
    /// The assistant's reply.
    pub reply: Turn,
    /// Compaction result.
    pub compaction: CompactionStatus,
    /// True if the reply was already stored for this user turn id and no
    /// new work was done.
    pub replayed: bool,
}

/// Per-thread async locks.
///
/// An entry lives only while some call holds or waits on it.
#[derive(Debug, Default)]
struct ThreadLocks {
    inner: Mutex<HashMap<ThreadId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadLocks {
    async fn acquire(&self, thread_id: ThreadId) -> ThreadLockGuard<'_> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(thread_id).or_default())
        };
        ThreadLockGuard {
            locks: self,
            thread_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Holds a thread's lock and drops its map entry once nobody else wants it.
struct ThreadLockGuard<'a> {
    locks: &'a ThreadLocks,
    thread_id: ThreadId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters clone the Arc under this map lock, so a count of one means
        // the map holds the only reference.
        if locks
            .get(&self.thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.thread_id);
        }
    }
}

/// Working set of one `advance` call.
struct AdvanceRun {
    thread_id: ThreadId,
    head: Checkpoint,
    user_turn: Turn,
    reply: Option<Turn>,
    compaction: CompactionStatus,
}

/// Drives sessions through generate, decide and compact.
pub struct ConversationMachine {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn LlmBackend>,
    policy: CompactionPolicy,
    completion_timeout: Duration,
    locks: ThreadLocks,
}

impl ConversationMachine {
    /// Creates a machine that uses one backend for replies and summaries.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            store,
            backend,
            policy: CompactionPolicy::default(),
            completion_timeout: ConversationConfig::default().completion_timeout(),
            locks: ThreadLocks::default(),
        }
    }

    /// Creates a machine with policy and timeout taken from config.
    #[must_use]
    pub fn from_config(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn LlmBackend>,
        config: &ConversationConfig,
    ) -> Self {
        Self::new(store, backend)
            .with_policy(config.policy())
            .with_completion_timeout(config.completion_timeout())
    }

    /// Sets the compaction policy.
    #[must_use]
    pub fn with_policy(mut self, policy: CompactionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the upper bound on each completion call.
    #[must_use]
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// Advances a session by one user turn.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` if the thread has no checkpoint
    /// - `CompletionFailed` if the reply could not be generated; nothing is persisted
    /// - `DuplicateTurn` if the caller-supplied id is taken and has no reply
    /// - `StorageError` if the reply checkpoint could not be written
    ///
    /// Compaction failures are not errors; see [`CompactionStatus::Failed`].
    #[instrument(skip(self, message), fields(thread_id = %thread_id))]
    pub async fn advance(
        &self,
        thread_id: ThreadId,
        message: impl Into<IncomingMessage>,
    ) -> Result<AdvanceOutcome, ConversationError> {
        let message = message.into();
        let _guard = self.locks.acquire(thread_id).await;

        let head = self
            .store
            .latest(thread_id)
            .await
            .map_err(|e| ConversationError::from_store(e, thread_id))?;

        if let Some(turn_id) = message.id {
            if let Some(outcome) = self.replay(thread_id, &head, turn_id).await? {
                return Ok(outcome);
            }
        }

        let mut run = AdvanceRun {
            thread_id,
            head,
            user_turn: message.into_turn(),
            reply: None,
            compaction: CompactionStatus::NotNeeded,
        };

        let mut machine = MachineState::AwaitingReply;
        while !machine.is_terminal() {
            machine = self.step(machine, &mut run).await?;
        }

        let reply = run.reply.ok_or_else(|| ConversationError::CompletionFailed {
            reason: "no reply was produced".to_string(),
        })?;
        Ok(AdvanceOutcome {
            reply,
            compaction: run.compaction,
            replayed: false,
        })
    }

    async fn step(
        &self,
        machine: MachineState,
        run: &mut AdvanceRun,
    ) -> Result<MachineState, ConversationError> {
        match machine {
            MachineState::AwaitingReply => {
                self.generate(run).await?;
                let next = MachineState::decide(run.head.state.pending_count, &self.policy);
                debug!(
                    pending_count = run.head.state.pending_count,
                    next = ?next,
                    "reply persisted"
                );
                Ok(next)
            }
            MachineState::Compacting => {
                run.compaction = match self.compact(run).await {
                    Ok(checkpoint) => {
                        let tombstoned = checkpoint.diff.tombstones().len();
                        info!(
                            tombstoned,
                            sequence = checkpoint.sequence,
                            "conversation compacted"
                        );
                        let status = CompactionStatus::Compacted {
                            tombstoned,
                            sequence: checkpoint.sequence,
                        };
                        run.head = checkpoint;
                        status
                    }
                    Err(error) => {
                        warn!(%error, "compaction failed; will retry on next turn");
                        CompactionStatus::Failed(error)
                    }
                };
                Ok(MachineState::Idle)
            }
            MachineState::Idle => Ok(MachineState::Idle),
        }
    }

    async fn generate(&self, run: &mut AdvanceRun) -> Result<(), ConversationError> {
        let request = LlmRequest::new(run.head.state.prompt_context(&run.user_turn));
        let response = self
            .complete(&request)
            .await
            .map_err(|e| {
                warn!(error = %e, transient = e.is_transient(), "completion failed");
                ConversationError::CompletionFailed {
                    reason: e.to_string(),
                }
            })?;

        let reply = Turn::assistant(response.content);
        let diff = CheckpointDiff::Generate {
            appended: vec![run.user_turn.clone(), reply.clone()],
        };
        let mut next = run.head.state.clone();
        next.apply(&diff).map_err(|e| match e {
            LedgerError::DuplicateTurnId { turn_id } => ConversationError::DuplicateTurn { turn_id },
            other => ConversationError::StorageError {
                reason: other.to_string(),
            },
        })?;

        run.head = self
            .store
            .put(run.thread_id, run.head.parent_for_next(), &next, &diff)
            .await
            .map_err(|e| ConversationError::from_store(e, run.thread_id))?;
        run.reply = Some(reply);
        Ok(())
    }

    async fn compact(&self, run: &AdvanceRun) -> Result<Checkpoint, ConversationError> {
        let state = &run.head.state;
        let prompt = self.policy.summary_prompt(state.turns(), &state.summary);
        let response = self
            .complete(&LlmRequest::prompt(prompt))
            .await
            .map_err(|e| ConversationError::CompactionFailed {
                reason: e.to_string(),
            })?;

        let diff = self
            .policy
            .compact(state, response.content.trim().to_string());
        let mut next = state.clone();
        next.apply(&diff)
            .map_err(|e| ConversationError::CompactionFailed {
                reason: e.to_string(),
            })?;

        self.store
            .put(run.thread_id, run.head.parent_for_next(), &next, &diff)
            .await
            .map_err(|e| ConversationError::from_store(e, run.thread_id))
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        tokio::time::timeout(self.completion_timeout, self.backend.generate(request))
            .await
            .map_err(|_| LlmError::Timeout)?
    }

    /// Resolves a user turn id the caller has sent before.
    ///
    /// Returns the stored reply if the turn was answered, `None` if the id
    /// is new, and `DuplicateTurn` if it is taken but cannot be replayed.
    async fn replay(
        &self,
        thread_id: ThreadId,
        head: &Checkpoint,
        turn_id: TurnId,
    ) -> Result<Option<AdvanceOutcome>, ConversationError> {
        if let Some(reply) = head.state.ledger.reply_to(turn_id) {
            debug!(%turn_id, "replaying stored reply");
            return Ok(Some(AdvanceOutcome {
                reply: reply.clone(),
                compaction: CompactionStatus::NotNeeded,
                replayed: true,
            }));
        }
        if head.state.ledger.contains(turn_id) {
            return Err(ConversationError::DuplicateTurn { turn_id });
        }

        let seen = self
            .store
            .has_turn(thread_id, turn_id)
            .await
            .map_err(|e| ConversationError::from_store(e, thread_id))?;
        if seen {
            return Err(ConversationError::DuplicateTurn { turn_id });
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::message::TurnRole;
    use crate::session::SessionManager;
    use crate::state::ConversationState;
    use crate::store::InMemorySessionStore;
    use crate::testing::ScriptedBackend;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Harness {
        store: Arc<InMemorySessionStore>,
        backend: Arc<ScriptedBackend>,
        sessions: SessionManager,
        machine: ConversationMachine,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemorySessionStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        let sessions = SessionManager::new(store.clone(), "You are terse.");
        let machine = ConversationMachine::new(store.clone(), backend.clone());
        Harness {
            store,
            backend,
            sessions,
            machine,
        }
    }

    #[test]
    fn decide_routes_on_threshold() {
        let policy = CompactionPolicy::default();
        assert_eq!(MachineState::decide(9, &policy), MachineState::Idle);
        assert_eq!(MachineState::decide(10, &policy), MachineState::Compacting);
        assert!(MachineState::Idle.is_terminal());
        assert!(!MachineState::Compacting.is_terminal());
    }

    #[tokio::test]
    async fn advance_appends_user_and_reply() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        h.backend.push_reply("Hello.");

        let outcome = h.machine.advance(thread_id, "Hi").await.unwrap();

        assert_eq!(outcome.reply.content, "Hello.");
        assert_eq!(outcome.reply.role, TurnRole::Assistant);
        assert_eq!(outcome.compaction, CompactionStatus::NotNeeded);
        assert!(!outcome.replayed);

        let state = h.sessions.get_state(thread_id).await.unwrap();
        let roles: Vec<_> = state.turns().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![TurnRole::System, TurnRole::User, TurnRole::Assistant]
        );
        assert_eq!(state.pending_count, 1);
    }

    #[tokio::test]
    async fn generate_sends_full_context() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        h.backend.push_reply("first");
        h.backend.push_reply("second");

        h.machine.advance(thread_id, "one").await.unwrap();
        h.machine.advance(thread_id, "two").await.unwrap();

        let requests = h.backend.requests();
        let contents: Vec<_> = requests[1]
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["You are terse.", "one", "first", "two"]);
    }

    #[tokio::test]
    async fn nine_turns_do_not_compact_and_tenth_does() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();

        for i in 0..9 {
            h.backend.push_reply(format!("reply {i}"));
            let outcome = h.machine.advance(thread_id, "Hi").await.unwrap();
            assert_eq!(outcome.compaction, CompactionStatus::NotNeeded);
        }
        let state = h.sessions.get_state(thread_id).await.unwrap();
        assert_eq!(state.pending_count, 9);
        assert_eq!(state.summary, "");

        h.backend.push_reply("reply 9");
        h.backend.push_reply("  The user said hi ten times.  ");
        let outcome = h.machine.advance(thread_id, "Hi").await.unwrap();

        assert_eq!(outcome.reply.content, "reply 9");
        assert_eq!(
            outcome.compaction,
            CompactionStatus::Compacted {
                tombstoned: 19,
                sequence: 12,
            }
        );

        let state = h.sessions.get_state(thread_id).await.unwrap();
        assert_eq!(state.summary, "The user said hi ten times.");
        assert_eq!(state.turns().len(), 2);
        assert_eq!(state.turns()[1].content, "reply 9");
        assert_eq!(state.pending_count, 2);
    }

    #[tokio::test]
    async fn summary_is_prepended_after_compaction() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let machine = ConversationMachine::new(h.store.clone(), h.backend.clone())
            .with_policy(CompactionPolicy::new(1, 2));

        h.backend.push_reply("hello");
        h.backend.push_reply("greeting exchanged");
        machine.advance(thread_id, "hi").await.unwrap();

        h.backend.push_reply("fine");
        machine.advance(thread_id, "how are you").await.unwrap();

        let requests = h.backend.requests();
        let summary_request = &requests[1];
        assert_eq!(summary_request.messages.len(), 1);
        assert!(
            summary_request.messages[0]
                .content
                .starts_with("Please create a concise summary")
        );

        let third = &requests[2];
        assert_eq!(
            third.messages[0].content,
            "This is a summary of the conversation so far: greeting exchanged"
        );
        assert_eq!(third.messages.last().unwrap().content, "how are you");
    }

    #[tokio::test]
    async fn completion_failure_persists_nothing() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        h.backend.push_error(LlmError::Timeout);

        let err = h.machine.advance(thread_id, "Hi").await.unwrap_err();

        assert!(matches!(err, ConversationError::CompletionFailed { .. }));
        let state = h.sessions.get_state(thread_id).await.unwrap();
        assert_eq!(state.turns().len(), 1);
        assert_eq!(state.pending_count, 0);
        assert_eq!(h.store.history(thread_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_completion_times_out() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let machine = ConversationMachine::new(h.store.clone(), h.backend.clone())
            .with_completion_timeout(Duration::from_millis(10));
        h.backend.set_delay(Duration::from_millis(200));
        h.backend.push_reply("too late");

        let err = machine.advance(thread_id, "Hi").await.unwrap_err();

        assert_eq!(
            err,
            ConversationError::CompletionFailed {
                reason: LlmError::Timeout.to_string()
            }
        );
        assert_eq!(h.sessions.get_state(thread_id).await.unwrap().turns().len(), 1);
    }

    #[tokio::test]
    async fn compaction_failure_keeps_reply_and_retries_next_turn() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let machine = ConversationMachine::new(h.store.clone(), h.backend.clone())
            .with_policy(CompactionPolicy::new(1, 2));

        h.backend.push_reply("hello");
        h.backend.push_error(LlmError::RequestFailed {
            reason: "summarizer down".to_string(),
        });
        let outcome = machine.advance(thread_id, "hi").await.unwrap();

        assert_eq!(outcome.reply.content, "hello");
        assert!(matches!(
            outcome.compaction,
            CompactionStatus::Failed(ConversationError::CompactionFailed { .. })
        ));
        let state = h.sessions.get_state(thread_id).await.unwrap();
        assert_eq!(state.turns().len(), 3);
        assert_eq!(state.pending_count, 1);

        h.backend.push_reply("again");
        h.backend.push_reply("summary");
        let outcome = machine.advance(thread_id, "still there?").await.unwrap();
        assert!(matches!(outcome.compaction, CompactionStatus::Compacted { .. }));
        assert_eq!(h.sessions.get_state(thread_id).await.unwrap().summary, "summary");
    }

    #[tokio::test]
    async fn unknown_thread_is_session_not_found() {
        let h = harness();
        let thread_id = ThreadId::new();

        let err = h.machine.advance(thread_id, "Hi").await.unwrap_err();

        assert_eq!(err, ConversationError::SessionNotFound { thread_id });
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn retried_turn_id_replays_stored_reply() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let turn_id = TurnId::new();
        h.backend.push_reply("only once");

        let first = h
            .machine
            .advance(thread_id, IncomingMessage::new("Hi").with_id(turn_id))
            .await
            .unwrap();
        let second = h
            .machine
            .advance(thread_id, IncomingMessage::new("Hi").with_id(turn_id))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.reply.id, second.reply.id);
        assert_eq!(h.backend.requests().len(), 1);
        assert_eq!(h.sessions.get_state(thread_id).await.unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn supplied_id_is_kept_on_the_user_turn() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let turn_id = TurnId::new();
        h.backend.push_reply("ok");

        h.machine
            .advance(thread_id, IncomingMessage::new("Hi").with_id(turn_id))
            .await
            .unwrap();

        let state = h.sessions.get_state(thread_id).await.unwrap();
        assert_eq!(state.turns()[1].id, turn_id);
    }

    #[tokio::test]
    async fn reusing_a_non_user_id_is_rejected() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let system_id = h.sessions.get_state(thread_id).await.unwrap().turns()[0].id;

        let err = h
            .machine
            .advance(thread_id, IncomingMessage::new("Hi").with_id(system_id))
            .await
            .unwrap_err();

        assert_eq!(err, ConversationError::DuplicateTurn { turn_id: system_id });
    }

    #[tokio::test]
    async fn reusing_a_compacted_id_is_rejected() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let machine = ConversationMachine::new(h.store.clone(), h.backend.clone())
            .with_policy(CompactionPolicy::new(1, 0));
        let turn_id = TurnId::new();

        h.backend.push_reply("hello");
        h.backend.push_reply("summary");
        machine
            .advance(thread_id, IncomingMessage::new("Hi").with_id(turn_id))
            .await
            .unwrap();
        assert!(h.sessions.get_state(thread_id).await.unwrap().turns().is_empty());

        let err = machine
            .advance(thread_id, IncomingMessage::new("Hi").with_id(turn_id))
            .await
            .unwrap_err();
        assert_eq!(err, ConversationError::DuplicateTurn { turn_id });
    }

    #[tokio::test]
    async fn concurrent_advances_on_one_thread_serialize() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        h.backend.set_delay(Duration::from_millis(20));
        h.backend.push_reply("a");
        h.backend.push_reply("b");

        let (first, second) = tokio::join!(
            h.machine.advance(thread_id, "one"),
            h.machine.advance(thread_id, "two")
        );
        first.unwrap();
        second.unwrap();

        let state = h.sessions.get_state(thread_id).await.unwrap();
        assert_eq!(state.pending_count, 2);
        assert_eq!(state.turns().len(), 5);
        let ids: BTreeSet<_> = state.turns().iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn turn_ids_are_stable_across_checkpoints() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let machine = ConversationMachine::new(h.store.clone(), h.backend.clone())
            .with_policy(CompactionPolicy::new(3, 2));

        for i in 0..5 {
            h.backend.push_reply(format!("r{i}"));
            if i == 2 {
                h.backend.push_reply("summary");
            }
            machine.advance(thread_id, format!("q{i}")).await.unwrap();
        }

        let history = h.store.history(thread_id).await.unwrap();
        let mut first_seen = HashMap::new();
        for checkpoint in &history {
            for turn in checkpoint.state.turns() {
                let entry = first_seen.entry(turn.id).or_insert_with(|| turn.clone());
                assert_eq!(*entry, *turn);
            }
        }
    }

    #[tokio::test]
    async fn history_replays_to_latest_snapshot() {
        let h = harness();
        let thread_id = h.sessions.create_session(None).await.unwrap();
        let machine = ConversationMachine::new(h.store.clone(), h.backend.clone())
            .with_policy(CompactionPolicy::new(2, 2));
        for i in 0..4 {
            h.backend.push_reply(format!("r{i}"));
            if i % 2 == 1 {
                h.backend.push_reply(format!("summary {i}"));
            }
            machine.advance(thread_id, format!("q{i}")).await.unwrap();
        }

        let history = h.store.history(thread_id).await.unwrap();
        let replayed = ConversationState::replay(history.iter().map(|c| &c.diff)).unwrap();
        assert_eq!(replayed, history.last().unwrap().state);
    }

    /// Store whose writes can be switched off and whose history reads are counted.
    struct FlakyStore {
        inner: InMemorySessionStore,
        fail_writes: AtomicBool,
        history_reads: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemorySessionStore::new(),
                fail_writes: AtomicBool::new(false),
                history_reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn put(
            &self,
            thread_id: ThreadId,
            parent: Option<u64>,
            state: &ConversationState,
            diff: &CheckpointDiff,
        ) -> Result<Checkpoint, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::WriteFailed {
                    reason: "disk full".to_string(),
                });
            }
            self.inner.put(thread_id, parent, state, diff).await
        }

        async fn latest(&self, thread_id: ThreadId) -> Result<Checkpoint, StoreError> {
            self.inner.latest(thread_id).await
        }

        async fn list_thread_ids(&self) -> Result<BTreeSet<ThreadId>, StoreError> {
            self.inner.list_thread_ids().await
        }

        async fn history(&self, thread_id: ThreadId) -> Result<Vec<Checkpoint>, StoreError> {
            self.history_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.history(thread_id).await
        }

        async fn at(&self, thread_id: ThreadId, sequence: u64) -> Result<Checkpoint, StoreError> {
            self.inner.at(thread_id, sequence).await
        }

        async fn has_turn(&self, thread_id: ThreadId, turn_id: TurnId) -> Result<bool, StoreError> {
            self.inner.has_turn(thread_id, turn_id).await
        }
    }

    #[tokio::test]
    async fn failed_write_surfaces_storage_error() {
        let store = Arc::new(FlakyStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        let sessions = SessionManager::new(store.clone(), "rules");
        let machine = ConversationMachine::new(store.clone(), backend.clone());
        let thread_id = sessions.create_session(None).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        backend.push_reply("lost");
        let err = machine.advance(thread_id, "Hi").await.unwrap_err();

        assert!(matches!(err, ConversationError::StorageError { .. }));
        assert_eq!(sessions.get_state(thread_id).await.unwrap().turns().len(), 1);
    }

    #[tokio::test]
    async fn compacted_id_is_found_without_reading_history() {
        let store = Arc::new(FlakyStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        let sessions = SessionManager::new(store.clone(), "rules");
        let machine = ConversationMachine::new(store.clone(), backend.clone())
            .with_policy(CompactionPolicy::new(1, 0));
        let thread_id = sessions.create_session(None).await.unwrap();
        let turn_id = TurnId::new();

        backend.push_reply("hello");
        backend.push_reply("summary");
        machine
            .advance(thread_id, IncomingMessage::new("Hi").with_id(turn_id))
            .await
            .unwrap();
        for _ in 0..3 {
            let err = machine
                .advance(thread_id, IncomingMessage::new("Hi").with_id(turn_id))
                .await
                .unwrap_err();
            assert_eq!(err, ConversationError::DuplicateTurn { turn_id });
        }

        assert_eq!(store.history_reads.load(Ordering::SeqCst), 0);
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn lock_entries_are_released_after_each_call() {
        let h = harness();

        for _ in 0..100 {
            let err = h.machine.advance(ThreadId::new(), "Hi").await.unwrap_err();
            assert!(matches!(err, ConversationError::SessionNotFound { .. }));
        }
        assert_eq!(h.machine.locks.len(), 0);

        let thread_id = h.sessions.create_session(None).await.unwrap();
        h.backend.push_reply("one");
        h.machine.advance(thread_id, "Hi").await.unwrap();
        assert_eq!(h.machine.locks.len(), 0);

        h.backend.set_delay(Duration::from_millis(20));
        h.backend.push_reply("a");
        h.backend.push_reply("b");
        let (first, second) = tokio::join!(
            h.machine.advance(thread_id, "one"),
            h.machine.advance(thread_id, "two")
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(h.machine.locks.len(), 0);
    }
}
