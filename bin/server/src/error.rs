//! Domain error types for server operations.
//!
//! - `ApiError`: what a handler returns; renders as a status code and a
//!   JSON `{"detail": ...}` body
//! - `StartupError`: why the process could not start serving

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chatledger_conversation::ConversationError;
use serde::Serialize;
use std::fmt;

/// Errors returned by HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The engine rejected or failed the call.
    Conversation(ConversationError),
    /// The thread id in the path does not name a session.
    UnknownSession { thread_id: String },
    /// The request body could not be parsed.
    BadRequest { reason: String },
    /// The background task running the turn did not finish.
    Internal { reason: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(error) => write!(f, "{error}"),
            Self::UnknownSession { thread_id } => write!(f, "unknown session '{thread_id}'"),
            Self::BadRequest { reason } => write!(f, "bad request: {reason}"),
            Self::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ConversationError> for ApiError {
    fn from(error: ConversationError) -> Self {
        Self::Conversation(error)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl ApiError {
    /// Returns the status code and the user-safe message.
    fn status_and_detail(&self) -> (StatusCode, String) {
        let (status, detail) = match self {
            Self::Conversation(ConversationError::SessionNotFound { .. })
            | Self::UnknownSession { .. } => {
                (StatusCode::NOT_FOUND, "Session not found.".to_string())
            }
            Self::Conversation(ConversationError::CompletionFailed { .. }) => (
                StatusCode::BAD_GATEWAY,
                "The assistant could not reply.".to_string(),
            ),
            Self::Conversation(ConversationError::DuplicateTurn { turn_id }) => (
                StatusCode::CONFLICT,
                format!("Message {turn_id} was already sent."),
            ),
            Self::Conversation(
                ConversationError::StorageError { .. } | ConversationError::CompactionFailed { .. },
            ) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage error.".to_string(),
            ),
            Self::BadRequest { reason } => (StatusCode::BAD_REQUEST, reason.clone()),
            Self::Internal { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error.".to_string(),
            ),
        };
        match self {
            Self::Conversation(error) if error.is_retryable() => {
                (status, format!("{detail} Please try again."))
            }
            _ => (status, detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = self.status_and_detail();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(ErrorBody { detail })).into_response()
    }
}

/// Reasons the server could not start.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration was missing or invalid.
    Config { reason: String },
    /// The database could not be opened.
    Database { reason: String },
    /// Schema migrations failed.
    Migration { reason: String },
    /// The completion backend could not be built.
    Backend { reason: String },
    /// The listener could not bind.
    Bind { addr: String, reason: String },
    /// The server stopped with an error.
    Serve { reason: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "invalid configuration: {reason}"),
            Self::Database { reason } => write!(f, "failed to open database: {reason}"),
            Self::Migration { reason } => write!(f, "failed to run migrations: {reason}"),
            Self::Backend { reason } => write!(f, "failed to build completion backend: {reason}"),
            Self::Bind { addr, reason } => write!(f, "failed to bind to {addr}: {reason}"),
            Self::Serve { reason } => write!(f, "server error: {reason}"),
        }
    }
}

impl std::error::Error for StartupError {}
