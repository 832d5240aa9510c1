//! Chat orchestrator - the per-turn model/tool loop
//!
//! A turn loads the session history, sanitizes it, and streams the model.
//! Tool requests are executed (concurrently within one step) and their
//! results spliced back before the model is invoked again, until the model
//! answers without tools or the step budget runs out. Confirmation-gated
//! tools suspend the turn; the caller resumes it by approving or rejecting
//! each pending call.
//!
//! State per turn:
//! `Idle -> Streaming -> (ToolRequested -> ToolExecuting -> Streaming)* -> Finished | Aborted | Failed`,
//! with `ToolRequested -> AwaitingConfirmation` as the only suspension point.
//!
//! Nothing is written to the session unless the turn finishes or suspends
//! cleanly; both write the new messages in a single transaction.

mod events;
mod prompt;

pub use events::ChatEvent;
pub use prompt::build_system_prompt;

use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{AssistantError, Result};
use crate::mediator::{self, PendingConfirmation};
use crate::provider::{GenerateRequest, ModelEndpoint, ModelMessage, StreamEvent, ToolCallRequest, ToolDefinition};
use crate::session::{
    HistoryFilter, InvocationState, Message, MessageMetadata, NewMessage, Role, SessionStore,
    ToolInvocation, MAX_CONTENT_CHARS,
};
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
    ToolRequested,
    ToolExecuting,
    AwaitingConfirmation,
    Finished,
    Aborted,
    Failed,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Streaming => "streaming",
            TurnState::ToolRequested => "tool_requested",
            TurnState::ToolExecuting => "tool_executing",
            TurnState::AwaitingConfirmation => "awaiting_confirmation",
            TurnState::Finished => "finished",
            TurnState::Aborted => "aborted",
            TurnState::Failed => "failed",
        }
    }

    /// Terminal state of a turn that ended with `err`
    pub fn for_error(err: &AssistantError) -> Self {
        match err {
            AssistantError::Cancelled | AssistantError::StepBudgetExceeded { .. } => TurnState::Aborted,
            _ => TurnState::Failed,
        }
    }
}

/// Caller's decision on one gated tool call
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub call_id: String,
    pub approved: bool,
}

/// Input to one turn.
///
/// With `message` set, that text is the new user message. Without it the
/// turn answers the most recent stored user message, or resumes a suspended
/// turn when `confirmations` are supplied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub confirmations: Vec<Confirmation>,
}

impl TurnRequest {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            confirmations: Vec::new(),
        }
    }

    pub fn resume(confirmations: Vec<Confirmation>) -> Self {
        Self {
            message: None,
            confirmations,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The assistant reply, as persisted
    Finished { message: Message, steps: usize },
    /// Suspended; every listed call needs a confirmation
    AwaitingConfirmation { pending: Vec<PendingConfirmation> },
}

impl TurnOutcome {
    pub fn state(&self) -> TurnState {
        match self {
            TurnOutcome::Finished { .. } => TurnState::Finished,
            TurnOutcome::AwaitingConfirmation { .. } => TurnState::AwaitingConfirmation,
        }
    }
}

/// Working state of one turn
struct Turn {
    actor: String,
    state: TurnState,
    started: Instant,
    steps: usize,
    messages: Vec<ModelMessage>,
    text: String,
    invocations: Vec<ToolInvocation>,
    user_message: Option<String>,
}

impl Turn {
    fn new(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            state: TurnState::Idle,
            started: Instant::now(),
            steps: 0,
            messages: Vec::new(),
            text: String::new(),
            invocations: Vec::new(),
            user_message: None,
        }
    }

    fn enter(&mut self, next: TurnState) {
        debug!(
            session = %self.actor,
            from = self.state.as_str(),
            to = next.as_str(),
            step = self.steps,
            "Turn transition"
        );
        self.state = next;
    }

    fn record(&mut self, call: &ToolCallRequest, outcome: &ToolOutcome) {
        self.invocations.push(ToolInvocation {
            call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            state: InvocationState::Result {
                output: outcome.output.clone(),
                success: outcome.success,
            },
        });
    }

    fn metadata(&self) -> MessageMetadata {
        let mut tool_calls: Vec<String> = Vec::new();
        for inv in self.invocations.iter().filter(|i| i.is_complete()) {
            if !tool_calls.contains(&inv.tool_name) {
                tool_calls.push(inv.tool_name.clone());
            }
        }
        MessageMetadata {
            tool_calls,
            processing_time_ms: Some(self.started.elapsed().as_millis() as u64),
            code_language: detect_code_language(&self.text),
            tool_invocations: self.invocations.clone(),
        }
    }

    /// Messages to persist: the user message (unless already stored) and
    /// the assistant message built so far
    fn pending_writes(&mut self) -> Vec<NewMessage> {
        let mut entries = Vec::with_capacity(2);
        if let Some(text) = self.user_message.take() {
            entries.push(NewMessage::new(Role::User, text, None));
        }
        entries.push(NewMessage::new(Role::Assistant, self.text.clone(), Some(self.metadata())));
        entries
    }
}

pub struct ChatOrchestrator {
    registry: Arc<ToolRegistry>,
    model: Arc<dyn ModelEndpoint>,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>, model: Arc<dyn ModelEndpoint>, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            model,
            config,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Gated calls the session is suspended on, if any
    pub async fn pending_confirmations(&self, store: &SessionStore) -> Result<Vec<PendingConfirmation>> {
        let latest = store
            .get_history(&HistoryFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await?;
        Ok(mediator::pending_confirmations(&latest, &self.registry))
    }

    /// Run one turn for `store`, streaming progress into `events`.
    ///
    /// Holds the session's turn lock for the whole turn. Send failures on
    /// `events` are ignored; use `cancel` to stop a turn whose caller left.
    pub async fn run_turn(
        &self,
        store: Arc<SessionStore>,
        request: TurnRequest,
        events: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let _guard = store.exclusive().await;
        let mut turn = Turn::new(store.actor_id());

        info!(
            session = %store.actor_id(),
            has_message = request.message.is_some(),
            confirmations = request.confirmations.len(),
            "Starting turn"
        );

        let result = self.drive(&store, request, &events, &cancel, &mut turn).await;
        match &result {
            Ok(TurnOutcome::Finished { message, steps }) => info!(
                session = %turn.actor,
                message_id = %message.id,
                steps,
                tools = turn.invocations.len(),
                "Turn finished"
            ),
            Ok(TurnOutcome::AwaitingConfirmation { pending }) => info!(
                session = %turn.actor,
                pending = pending.len(),
                "Turn suspended for confirmation"
            ),
            Err(e) => {
                turn.enter(TurnState::for_error(e));
                warn!(session = %turn.actor, state = turn.state.as_str(), error = %e, "Turn ended without a reply");
            }
        }
        result
    }

    async fn drive(
        &self,
        store: &Arc<SessionStore>,
        request: TurnRequest,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<TurnOutcome> {
        if let Some(text) = &request.message {
            validate_user_message(text)?;
        }

        let history = store.get_history(&HistoryFilter::default()).await?;
        let (history, _report) = mediator::sanitize(&history, &self.registry);
        let pending = mediator::pending_confirmations(&history, &self.registry);
        let context = store.get_context().await?;
        let system_prompt = build_system_prompt(&self.config.system_prompt, &context, &self.registry);
        let tool_ctx = ToolContext {
            session: Arc::clone(store),
        };

        turn.messages = mediator::to_model_messages(&history);

        if pending.is_empty() {
            if !request.confirmations.is_empty() {
                return Err(AssistantError::validation("no tool call is awaiting confirmation"));
            }
            match request.message {
                Some(text) => {
                    turn.messages.push(ModelMessage::User(text.clone()));
                    turn.user_message = Some(text);
                }
                None if history.last().map(|m| m.role) == Some(Role::User) => {}
                None => return Err(AssistantError::validation("no user message to respond to")),
            }
        } else {
            let decisions = match_confirmations(&pending, &request.confirmations)?;
            if request.message.is_some() {
                return Err(AssistantError::validation(
                    "resolve pending confirmations before sending a new message",
                ));
            }
            self.resume_confirmed(turn, &tool_ctx, decisions, events, cancel).await?;
        }

        let budget = self.config.max_steps.max(1);
        let definitions = self.registry.definitions();

        loop {
            turn.steps += 1;
            turn.enter(TurnState::Streaming);

            let (text, calls) = self
                .stream_step(turn, &system_prompt, &definitions, budget, events, cancel)
                .await?;
            turn.text.push_str(&text);

            if calls.is_empty() {
                return self.finish(store, turn).await;
            }
            if turn.steps >= budget {
                warn!(session = %turn.actor, budget, requested = calls.len(), "Step budget exhausted");
                return Err(AssistantError::StepBudgetExceeded { budget });
            }

            turn.enter(TurnState::ToolRequested);
            turn.messages.push(ModelMessage::Assistant {
                content: text,
                tool_calls: calls.clone(),
            });
            for call in &calls {
                emit(events, start_event(call)).await;
            }

            let (gated, free): (Vec<_>, Vec<_>) = calls
                .into_iter()
                .partition(|c| self.registry.requires_confirmation(&c.name));

            if !free.is_empty() {
                turn.enter(TurnState::ToolExecuting);
                let outcomes = self.execute_calls(&tool_ctx, &free, cancel).await?;
                for (call, outcome) in free.iter().zip(outcomes) {
                    apply_outcome(turn, call, outcome, events).await;
                }
            }

            if !gated.is_empty() {
                return self.suspend(store, turn, gated, events).await;
            }
        }
    }

    /// Run or decline the calls a suspended turn was waiting on
    async fn resume_confirmed(
        &self,
        turn: &mut Turn,
        tool_ctx: &ToolContext,
        decisions: Vec<(PendingConfirmation, bool)>,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let calls: Vec<ToolCallRequest> = decisions.iter().map(|(p, _)| p.to_request()).collect();
        turn.messages.push(ModelMessage::Assistant {
            content: String::new(),
            tool_calls: calls.clone(),
        });

        turn.enter(TurnState::ToolExecuting);
        let approved: Vec<ToolCallRequest> = decisions
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(p, _)| p.to_request())
            .collect();
        let mut outcomes = self.execute_calls(tool_ctx, &approved, cancel).await?.into_iter();

        for (call, (_, ok)) in calls.iter().zip(&decisions) {
            emit(events, start_event(call)).await;
            let outcome = if *ok {
                outcomes
                    .next()
                    .unwrap_or_else(|| ToolOutcome::failed(format!("{} did not run", call.name)))
            } else {
                info!(session = %turn.actor, call_id = %call.call_id, tool = %call.name, "Tool call declined");
                ToolOutcome::failed(format!("The user declined to run {}.", call.name))
            };
            apply_outcome(turn, call, outcome, events).await;
        }
        Ok(())
    }

    /// One model invocation, read to completion
    async fn stream_step(
        &self,
        turn: &Turn,
        system_prompt: &str,
        tools: &[ToolDefinition],
        budget: usize,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ToolCallRequest>)> {
        let request = GenerateRequest {
            system_prompt: system_prompt.to_string(),
            messages: turn.messages.clone(),
            tools: tools.to_vec(),
            step: turn.steps,
            step_budget: budget,
        };

        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AssistantError::Cancelled),
            started = self.model.generate(request, cancel.child_token()) => started?,
        };

        let mut text = String::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AssistantError::Cancelled),
                event = rx.recv() => event,
            };

            match event {
                Some(StreamEvent::TextDelta(delta)) => {
                    text.push_str(&delta);
                    emit(events, ChatEvent::TextDelta { delta }).await;
                }
                Some(StreamEvent::ToolCall(call)) => {
                    if calls.iter().any(|c| c.call_id == call.call_id) {
                        warn!(call_id = %call.call_id, "Ignoring repeated tool call id");
                    } else {
                        calls.push(call);
                    }
                }
                Some(StreamEvent::Finish) => break,
                Some(StreamEvent::Error(e)) => return Err(AssistantError::ModelTransport(e)),
                None => {
                    return Err(AssistantError::ModelTransport(
                        "model stream closed before finishing".into(),
                    ))
                }
            }
        }

        Ok((text, calls))
    }

    async fn execute_calls(
        &self,
        ctx: &ToolContext,
        calls: &[ToolCallRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolOutcome>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let runs = calls
            .iter()
            .map(|c| self.registry.execute(ctx, &c.name, c.arguments.clone()));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AssistantError::Cancelled),
            outcomes = join_all(runs) => Ok(outcomes),
        }
    }

    async fn finish(&self, store: &SessionStore, turn: &mut Turn) -> Result<TurnOutcome> {
        if turn.text.trim().is_empty() && turn.invocations.is_empty() {
            return Err(AssistantError::ModelTransport("model returned an empty reply".into()));
        }

        let mut stored = store.append_messages(turn.pending_writes()).await?;
        let message = stored
            .pop()
            .ok_or_else(|| AssistantError::validation("assistant reply was not stored"))?;

        turn.enter(TurnState::Finished);
        Ok(TurnOutcome::Finished {
            message,
            steps: turn.steps,
        })
    }

    /// Persist what the turn has so far, with gated calls left open
    async fn suspend(
        &self,
        store: &SessionStore,
        turn: &mut Turn,
        gated: Vec<ToolCallRequest>,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<TurnOutcome> {
        turn.enter(TurnState::AwaitingConfirmation);
        for call in &gated {
            turn.invocations.push(ToolInvocation {
                call_id: call.call_id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                state: InvocationState::Call,
            });
        }

        let stored = store.append_messages(turn.pending_writes()).await?;
        let message_id = stored.last().map(|m| m.id.clone()).unwrap_or_default();

        let pending: Vec<PendingConfirmation> = gated
            .into_iter()
            .map(|call| PendingConfirmation {
                message_id: message_id.clone(),
                call_id: call.call_id,
                tool_name: call.name,
                arguments: call.arguments,
            })
            .collect();

        for p in &pending {
            emit(
                events,
                ChatEvent::ConfirmationRequired {
                    call_id: p.call_id.clone(),
                    tool_name: p.tool_name.clone(),
                    arguments: p.arguments.clone(),
                },
            )
            .await;
        }

        Ok(TurnOutcome::AwaitingConfirmation { pending })
    }
}

async fn emit(events: &mpsc::Sender<ChatEvent>, event: ChatEvent) {
    // Receiver gone means the caller stopped listening
    let _ = events.send(event).await;
}

fn start_event(call: &ToolCallRequest) -> ChatEvent {
    ChatEvent::ToolCallStart {
        call_id: call.call_id.clone(),
        name: call.name.clone(),
        arguments: call.arguments.clone(),
    }
}

async fn apply_outcome(
    turn: &mut Turn,
    call: &ToolCallRequest,
    outcome: ToolOutcome,
    events: &mpsc::Sender<ChatEvent>,
) {
    emit(
        events,
        ChatEvent::ToolCallResult {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            success: outcome.success,
            output: outcome.output.clone(),
        },
    )
    .await;
    mediator::splice_result(&mut turn.messages, call, outcome.output.clone());
    turn.record(call, &outcome);
}

fn validate_user_message(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(AssistantError::validation("message must not be empty"));
    }
    if text.chars().count() > MAX_CONTENT_CHARS {
        return Err(AssistantError::validation(format!(
            "message exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(())
}

/// Pair every pending call with the caller's decision
fn match_confirmations(
    pending: &[PendingConfirmation],
    confirmations: &[Confirmation],
) -> Result<Vec<(PendingConfirmation, bool)>> {
    for c in confirmations {
        if !pending.iter().any(|p| p.call_id == c.call_id) {
            return Err(AssistantError::validation(format!(
                "no pending tool call with id '{}'",
                c.call_id
            )));
        }
    }

    pending
        .iter()
        .map(|p| {
            confirmations
                .iter()
                .find(|c| c.call_id == p.call_id)
                .map(|c| (p.clone(), c.approved))
                .ok_or_else(|| AssistantError::ConfirmationRequired {
                    call_id: p.call_id.clone(),
                    tool_name: p.tool_name.clone(),
                })
        })
        .collect()
}

/// Language tag of the first fenced code block, if any
fn detect_code_language(text: &str) -> Option<String> {
    let start = text.find("```")? + 3;
    let tag: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '#' | '-' | '_'))
        .collect();
    (!tag.is_empty()).then(|| tag.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(call_id: &str) -> PendingConfirmation {
        PendingConfirmation {
            message_id: "msg_1".into(),
            call_id: call_id.into(),
            tool_name: "record_resolved_issue".into(),
            arguments: json!({}),
        }
    }

    #[test]
    fn test_confirmations_must_cover_every_pending_call() {
        let pending = vec![pending("a"), pending("b")];
        let partial = vec![Confirmation {
            call_id: "a".into(),
            approved: true,
        }];
        let err = match_confirmations(&pending, &partial).unwrap_err();
        assert!(matches!(err, AssistantError::ConfirmationRequired { ref call_id, .. } if call_id == "b"));

        let full = vec![
            Confirmation {
                call_id: "b".into(),
                approved: false,
            },
            Confirmation {
                call_id: "a".into(),
                approved: true,
            },
        ];
        let decisions = match_confirmations(&pending, &full).unwrap();
        assert_eq!(decisions[0].0.call_id, "a");
        assert!(decisions[0].1);
        assert!(!decisions[1].1);
    }

    #[test]
    fn test_unknown_confirmation_rejected() {
        let stray = vec![Confirmation {
            call_id: "zzz".into(),
            approved: true,
        }];
        let err = match_confirmations(&[pending("a")], &stray).unwrap_err();
        assert!(matches!(err, AssistantError::Validation(_)));
    }

    #[test]
    fn test_detect_code_language() {
        assert_eq!(
            detect_code_language("Try this:\n```TypeScript\nexport default {}\n```"),
            Some("typescript".into())
        );
        assert_eq!(detect_code_language("```\nplain\n```"), None);
        assert_eq!(detect_code_language("no code"), None);
    }

    #[test]
    fn test_error_terminal_states() {
        assert_eq!(TurnState::for_error(&AssistantError::Cancelled), TurnState::Aborted);
        assert_eq!(
            TurnState::for_error(&AssistantError::StepBudgetExceeded { budget: 3 }),
            TurnState::Aborted
        );
        assert_eq!(
            TurnState::for_error(&AssistantError::ModelTransport("reset".into())),
            TurnState::Failed
        );
    }

    #[test]
    fn test_turn_request_deserializes() {
        let request: TurnRequest = serde_json::from_value(json!({
            "confirmations": [{"callId": "c1", "approved": false}]
        }))
        .unwrap();
        assert!(request.message.is_none());
        assert_eq!(request.confirmations[0].call_id, "c1");
    }
}
