//! Completion backends for chatledger.
//!
//! The conversation engine consumes a language model through a single
//! capability: hand over an ordered list of role-tagged messages, get one
//! assistant message back. This crate defines that capability
//! ([`LlmBackend`]) and ships an OpenAI-compatible HTTP implementation.

pub mod backend;
pub mod error;
pub mod openai;

pub use backend::{
    LlmBackend, LlmBackendConfig, LlmMessage, LlmProvider, LlmRequest, LlmResponse, MessageRole,
    TokenUsage,
};
pub use error::LlmError;
pub use openai::OpenAiCompatibleBackend;
