//! Conversation engine configuration.

use crate::compaction::{CompactionPolicy, DEFAULT_MESSAGES_TO_KEEP, DEFAULT_SUMMARY_THRESHOLD};
use serde::Deserialize;
use std::time::Duration;

/// Default system prompt for sessions created without one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Be concise and clear in your responses.";

/// Tunables for sessions and compaction.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Replies accumulated before compaction runs.
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: u32,

    /// Raw turns kept after compaction.
    #[serde(default = "default_messages_to_keep")]
    pub messages_to_keep: usize,

    /// System prompt used when a session is created without one.
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,

    /// Upper bound on a single completion call, in seconds.
    #[serde(default = "default_completion_timeout_seconds")]
    pub completion_timeout_seconds: u64,
}

fn default_summary_threshold() -> u32 {
    DEFAULT_SUMMARY_THRESHOLD
}

fn default_messages_to_keep() -> usize {
    DEFAULT_MESSAGES_TO_KEEP
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_completion_timeout_seconds() -> u64 {
    120
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            summary_threshold: default_summary_threshold(),
            messages_to_keep: default_messages_to_keep(),
            default_system_prompt: default_system_prompt(),
            completion_timeout_seconds: default_completion_timeout_seconds(),
        }
    }
}

impl ConversationConfig {
    /// Returns the compaction policy described by this config.
    #[must_use]
    pub fn policy(&self) -> CompactionPolicy {
        CompactionPolicy::new(self.summary_threshold, self.messages_to_keep)
    }

    /// Returns the completion timeout.
    #[must_use]
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_seconds)
    }
}
