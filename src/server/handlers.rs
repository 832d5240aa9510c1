//! Request handlers for the session routes

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::AppState;
use crate::error::{AssistantError, Result};
use crate::mediator::PendingConfirmation;
use crate::orchestrator::{ChatEvent, TurnOutcome, TurnRequest};
use crate::session::{
    ContextUpdate, HistoryFilter, Message, MessageMetadata, ProjectContext, Role, SessionInfo,
    SessionState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMessageRequest {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnResponse {
    Finished { message: Message, steps: usize },
    AwaitingConfirmation { pending: Vec<PendingConfirmation> },
}

impl From<TurnOutcome> for TurnResponse {
    fn from(outcome: TurnOutcome) -> Self {
        match outcome {
            TurnOutcome::Finished { message, steps } => TurnResponse::Finished { message, steps },
            TurnOutcome::AwaitingConfirmation { pending } => {
                TurnResponse::AwaitingConfirmation { pending }
            }
        }
    }
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| AssistantError::validation(e.body_text()))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model": state.orchestrator.model_name(),
        "tools": state.orchestrator.registry().len(),
        "rateLimit": state.rate_limiter.as_ref().map(|l| l.limit()),
    }))
}

pub async fn add_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<AddMessageRequest>, JsonRejection>,
) -> Result<Json<Message>> {
    let request = json_body(payload)?;
    let store = state.sessions.get(&id)?;
    let _guard = store.exclusive().await;

    // A message after a suspended turn would orphan its gated calls
    let pending = state.orchestrator.pending_confirmations(&store).await?;
    if let Some(first) = pending.into_iter().next() {
        return Err(AssistantError::ConfirmationRequired {
            call_id: first.call_id,
            tool_name: first.tool_name,
        });
    }

    let message = store
        .add_message(request.role, &request.content, request.metadata)
        .await?;
    Ok(Json(message))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: std::result::Result<Query<HistoryFilter>, QueryRejection>,
) -> Result<Json<Vec<Message>>> {
    let Query(filter) = query.map_err(|e| AssistantError::validation(e.body_text()))?;
    let store = state.sessions.get(&id)?;
    Ok(Json(store.get_history(&filter).await?))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let store = state.sessions.get(&id)?;
    let _guard = store.exclusive().await;
    let deleted = store.delete_message(&message_id).await?;
    Ok(Json(json!({ "success": deleted })))
}

pub async fn get_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectContext>> {
    let store = state.sessions.get(&id)?;
    Ok(Json(store.get_context().await?))
}

pub async fn update_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<ContextUpdate>, JsonRejection>,
) -> Result<Json<Value>> {
    let partial = json_body(payload)?;
    let store = state.sessions.get(&id)?;
    let _guard = store.exclusive().await;
    let merged = store.update_context(&partial).await?;
    Ok(Json(json!({ "success": true, "data": merged })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>> {
    let store = state.sessions.get(&id)?;
    Ok(Json(store.get_session().await?))
}

pub async fn clear_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let store = state.sessions.get(&id)?;
    let _guard = store.exclusive().await;
    store.clear_session().await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>> {
    let store = state.sessions.get(&id)?;
    let _guard = store.exclusive().await;
    Ok(Json(store.deactivate().await?))
}

pub async fn get_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>> {
    let store = state.sessions.get(&id)?;
    Ok(Json(store.state().await?))
}

/// Run a turn and return its outcome as JSON. Progress events are dropped.
pub async fn run_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<TurnResponse>> {
    let request = json_body(payload)?;
    let store = state.sessions.get(&id)?;

    let (tx, mut rx) = mpsc::channel::<ChatEvent>(100);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    // Dropping this future (client gone) stops the turn before anything
    // is persisted
    let outcome = state
        .orchestrator
        .run_turn(store, request, tx, CancellationToken::new())
        .await?;
    Ok(Json(outcome.into()))
}

/// Run a turn, streaming [`ChatEvent`]s as Server-Sent Events. The stream
/// ends with a `done` or `error` event; disconnecting cancels the turn.
pub async fn chat_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let request = json_body(payload)?;
    let store = state.sessions.get(&id)?;

    let (tx, rx) = mpsc::channel::<ChatEvent>(100);
    let cancel = CancellationToken::new();
    let orchestrator = Arc::clone(&state.orchestrator);
    let turn_cancel = cancel.clone();

    tokio::spawn(async move {
        let terminal = match orchestrator
            .run_turn(store, request, tx.clone(), turn_cancel)
            .await
        {
            Ok(TurnOutcome::Finished { message, .. }) => ChatEvent::Done {
                message: Some(message),
            },
            Ok(TurnOutcome::AwaitingConfirmation { .. }) => ChatEvent::Done { message: None },
            Err(e) => ChatEvent::Error {
                message: e.to_string(),
                error_code: e.error_code().to_string(),
            },
        };
        let _ = tx.send(terminal).await;
    });

    let disconnect_guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _disconnect_guard = disconnect_guard;
        let mut rx = rx;
        while let Some(event) = rx.recv().await {
            match Event::default().json_data(&event) {
                Ok(frame) => yield Ok(frame),
                Err(e) => warn!(error = %e, "Failed to encode chat event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
