//! HTTP API.
//!
//! | method | path | body | response |
//! |---|---|---|---|
//! | GET | `/sessions/` | | `{"sessions": [{"thread_id": ...}]}` |
//! | POST | `/sessions/new` | | `{"thread_id": ...}` |
//! | POST | `/assistants/new` | `{"system_prompt": ...}` | `{"thread_id": ...}` |
//! | GET | `/sessions/{thread_id}` | | current state |
//! | POST | `/chat/{thread_id}` | `{"message": ..., "message_id"?: ...}` | reply as `text/plain` |

use crate::error::ApiError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chatledger_ai::LlmBackend;
use chatledger_conversation::{
    ConversationConfig, ConversationMachine, IncomingMessage, SessionManager, SessionStore, Turn,
};
use chatledger_core::{ThreadId, TurnId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle.
    pub sessions: SessionManager,
    /// Turn processing.
    pub machine: Arc<ConversationMachine>,
}

impl AppState {
    /// Wires a store and a completion backend together.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn LlmBackend>,
        config: &ConversationConfig,
    ) -> Self {
        Self {
            sessions: SessionManager::new(Arc::clone(&store), config.default_system_prompt.clone()),
            machine: Arc::new(ConversationMachine::from_config(store, backend, config)),
        }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions/", get(list_sessions))
        .route("/sessions/new", post(new_session))
        .route("/sessions/{thread_id}", get(get_session))
        .route("/assistants/new", post(new_assistant))
        .route("/chat/{thread_id}", post(chat))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionEntry {
    thread_id: ThreadId,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionList {
    sessions: Vec<SessionEntry>,
}

#[derive(Debug, Deserialize)]
struct NewAssistantRequest {
    system_prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionView {
    thread_id: ThreadId,
    sequence: u64,
    summary: String,
    pending_count: u32,
    turns: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    message_id: Option<TurnId>,
}

fn parse_thread_id(raw: &str) -> Result<ThreadId, ApiError> {
    ThreadId::from_str(raw).map_err(|_| ApiError::UnknownSession {
        thread_id: raw.to_string(),
    })
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest {
            reason: rejection.body_text(),
        })
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<SessionList>, ApiError> {
    let sessions = state
        .sessions
        .list_sessions()
        .await?
        .into_iter()
        .map(|thread_id| SessionEntry { thread_id })
        .collect();
    Ok(Json(SessionList { sessions }))
}

async fn new_session(State(state): State<AppState>) -> Result<Json<SessionEntry>, ApiError> {
    let thread_id = state.sessions.create_session(None).await?;
    Ok(Json(SessionEntry { thread_id }))
}

async fn new_assistant(
    State(state): State<AppState>,
    body: Result<Json<NewAssistantRequest>, JsonRejection>,
) -> Result<Json<SessionEntry>, ApiError> {
    let request = json_body(body)?;
    let thread_id = state
        .sessions
        .create_session(Some(&request.system_prompt))
        .await?;
    Ok(Json(SessionEntry { thread_id }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let checkpoint = state.sessions.latest(thread_id).await?;
    Ok(Json(SessionView {
        thread_id,
        sequence: checkpoint.sequence,
        summary: checkpoint.state.summary,
        pending_count: checkpoint.state.pending_count,
        turns: checkpoint.state.ledger.turns().to_vec(),
    }))
}

/// Runs one turn and returns the reply as plain text.
///
/// The turn runs on its own task so a client that hangs up mid-request
/// does not cut the transition chain short.
async fn chat(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let request = json_body(body)?;

    let mut message = IncomingMessage::new(request.message);
    if let Some(id) = request.message_id {
        message = message.with_id(id);
    }

    let machine = Arc::clone(&state.machine);
    let outcome = tokio::spawn(async move { machine.advance(thread_id, message).await })
        .await
        .map_err(|e| ApiError::Internal {
            reason: e.to_string(),
        })??;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{}\n", outcome.reply.content),
    ))
}
