//! Durable, compacting conversation engine for chatledger.
//!
//! This crate provides:
//!
//! - **Message Ledger**: ordered turns with stable ids and tombstone deletes
//! - **Conversation State**: ledger, running summary and pending-reply counter,
//!   evolved only by checkpoint diffs
//! - **Compaction Policy**: when to fold history into the summary and which
//!   turns survive
//! - **Conversation Machine**: generate, decide and compact for one user turn
//! - **Session Store**: checkpoint persistence contract plus an in-memory store
//! - **Session Manager**: session creation, listing and lookup

pub mod compaction;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod message;
pub mod session;
pub mod state;
pub mod store;

pub use compaction::CompactionPolicy;
pub use config::{ConversationConfig, DEFAULT_SYSTEM_PROMPT};
pub use envelope::{Envelope, RawEnvelope};
pub use error::{ConversationError, LedgerError, ReplayError, StoreError};
pub use ledger::Ledger;
pub use machine::{AdvanceOutcome, CompactionStatus, ConversationMachine, MachineState};
pub use message::{IncomingMessage, Turn, TurnRole};
pub use session::SessionManager;
pub use state::{CheckpointDiff, ConversationState, TransitionKind};
pub use store::{Checkpoint, InMemorySessionStore, SessionStore};

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles shared by the unit tests.

    use async_trait::async_trait;
    use chatledger_ai::{LlmBackend, LlmError, LlmProvider, LlmRequest, LlmResponse, TokenUsage};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Backend that answers from a queue and records every request.
    #[derive(Default)]
    pub struct ScriptedBackend {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        requests: Mutex<Vec<LlmRequest>>,
        delay: Mutex<Option<Duration>>,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_reply(&self, content: impl Into<String>) {
            self.script.lock().unwrap().push_back(Ok(content.into()));
        }

        pub fn push_error(&self, error: LlmError) {
            self.script.lock().unwrap().push_back(Err(error));
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn requests(&self) -> Vec<LlmRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            let content = next.unwrap_or_else(|| {
                Err(LlmError::RequestFailed {
                    reason: "script exhausted".to_string(),
                })
            })?;
            Ok(LlmResponse {
                content,
                usage: TokenUsage::default(),
                model: "scripted".to_string(),
            })
        }

        fn provider(&self) -> LlmProvider {
            LlmProvider::OpenAiCompatible
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }
}
