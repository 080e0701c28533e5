//! Turn types for conversations.

use chatledger_ai::{LlmMessage, MessageRole};
use chatledger_core::TurnId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// System instructions.
    System,
    /// User/human turn.
    User,
    /// Assistant/AI turn.
    Assistant,
}

impl TurnRole {
    /// Returns the lowercase role name used in prompts and on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl From<TurnRole> for MessageRole {
    fn from(role: TurnRole) -> Self {
        match role {
            TurnRole::System => Self::System,
            TurnRole::User => Self::User,
            TurnRole::Assistant => Self::Assistant,
        }
    }
}

/// One message in a conversation ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Stable identity, assigned once.
    pub id: TurnId,
    /// Author role.
    pub role: TurnRole,
    /// Text content.
    pub content: String,
    /// When the turn was created.
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Creates a turn with a freshly minted id.
    #[must_use]
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self::with_id(TurnId::new(), role, content)
    }

    /// Creates a turn carrying an existing id.
    #[must_use]
    pub fn with_id(id: TurnId, role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Creates a system turn.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, content)
    }

    /// Creates a user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    /// Creates an assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    /// Renders the turn as `role: content` for summary prompts.
    #[must_use]
    pub fn transcript_line(&self) -> String {
        format!("{}: {}", self.role.as_str(), self.content)
    }

    /// Converts the turn into a completion request message.
    #[must_use]
    pub fn to_llm_message(&self) -> LlmMessage {
        LlmMessage::new(self.role.into(), self.content.clone())
    }
}

/// A user message arriving from outside, possibly carrying a caller-chosen id.
///
/// Retried client requests reuse the same id, which lets the engine recognize
/// a replay instead of appending the message twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Caller-supplied id, if any.
    #[serde(default)]
    pub id: Option<TurnId>,
    /// Message text.
    pub content: String,
}

impl IncomingMessage {
    /// Creates a message without an id.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
        }
    }

    /// Attaches a caller-supplied id.
    #[must_use]
    pub fn with_id(mut self, id: TurnId) -> Self {
        self.id = Some(id);
        self
    }

    /// Turns the message into a user turn, minting an id only if none was supplied.
    #[must_use]
    pub fn into_turn(self) -> Turn {
        match self.id {
            Some(id) => Turn::with_id(id, TurnRole::User, self.content),
            None => Turn::user(self.content),
        }
    }
}

impl From<&str> for IncomingMessage {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}

impl From<String> for IncomingMessage {
    fn from(content: String) -> Self {
        Self::new(content)
    }
}
