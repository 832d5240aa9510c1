//! Tool call mediation between stored history and the model
//!
//! Before each model invocation the stored history is sanitized into a
//! consistent sequence, checked for tool calls still waiting on human
//! approval, and converted into model messages. Tool results produced during
//! the turn are spliced in right after the call that requested them.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::provider::{ModelMessage, ToolCallRequest};
use crate::session::{InvocationState, Message, Role, ToolInvocation};
use crate::tools::ToolRegistry;

/// What sanitize removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Invocations with no result
    pub incomplete_calls: usize,
    /// Of those, gated calls a later message superseded (a resumed turn)
    pub superseded_confirmations: usize,
    /// Invocations naming a tool the catalogue does not know
    pub unknown_tools: usize,
    /// Assistant messages left with neither text nor tool records
    pub empty_messages: usize,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.incomplete_calls == 0 && self.unknown_tools == 0 && self.empty_messages == 0
    }
}

/// A gated tool call the caller has to approve or reject
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfirmation {
    pub message_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl PendingConfirmation {
    pub fn to_request(&self) -> ToolCallRequest {
        ToolCallRequest {
            call_id: self.call_id.clone(),
            name: self.tool_name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Produce a corrected copy of `history`.
///
/// Invocations without a result are dropped, with one exception: a gated
/// call in the most recent message is a pending confirmation, not an
/// orphan, and is kept so it can be detected. Invocations of unknown tools
/// are always dropped.
pub fn sanitize(history: &[Message], registry: &ToolRegistry) -> (Vec<Message>, SanitizeReport) {
    let mut report = SanitizeReport::default();
    let last_index = history.len().saturating_sub(1);
    let mut out = Vec::with_capacity(history.len());
    // Drops other than superseded gated calls
    let mut unexpected = 0;

    for (index, message) in history.iter().enumerate() {
        if message.tool_invocations().is_empty() {
            out.push(message.clone());
            continue;
        }

        let is_latest = index == last_index && message.role == Role::Assistant;
        let mut message_unexpected = 0;
        let kept: Vec<ToolInvocation> = message
            .tool_invocations()
            .iter()
            .filter(|inv| {
                if !registry.contains(&inv.tool_name) {
                    warn!(
                        message_id = %message.id,
                        call_id = %inv.call_id,
                        tool = %inv.tool_name,
                        "Dropping tool record for unknown tool"
                    );
                    report.unknown_tools += 1;
                    message_unexpected += 1;
                    return false;
                }
                if inv.is_complete() {
                    return true;
                }
                let gated = registry.requires_confirmation(&inv.tool_name);
                if is_latest && gated {
                    return true;
                }
                debug!(message_id = %message.id, call_id = %inv.call_id, "Dropping incomplete tool call");
                report.incomplete_calls += 1;
                if gated {
                    report.superseded_confirmations += 1;
                } else {
                    message_unexpected += 1;
                }
                false
            })
            .cloned()
            .collect();

        unexpected += message_unexpected;
        if kept.is_empty() && message.content.trim().is_empty() {
            report.empty_messages += 1;
            if message_unexpected > 0 {
                unexpected += 1;
            }
            continue;
        }

        let mut repaired = message.clone();
        if let Some(metadata) = repaired.metadata.as_mut() {
            metadata.tool_invocations = kept;
        }
        out.push(repaired);
    }

    if unexpected > 0 {
        warn!(
            incomplete = report.incomplete_calls,
            unknown = report.unknown_tools,
            empty = report.empty_messages,
            "Normalized chat history"
        );
    } else if !report.is_clean() {
        debug!(
            superseded = report.superseded_confirmations,
            empty = report.empty_messages,
            "Dropped resolved confirmation records"
        );
    }

    (out, report)
}

/// Gated calls in the latest assistant message still lacking a result
pub fn pending_confirmations(history: &[Message], registry: &ToolRegistry) -> Vec<PendingConfirmation> {
    let Some(last) = history.last() else {
        return Vec::new();
    };
    if last.role != Role::Assistant {
        return Vec::new();
    }

    last.tool_invocations()
        .iter()
        .filter(|inv| !inv.is_complete() && registry.requires_confirmation(&inv.tool_name))
        .map(|inv| PendingConfirmation {
            message_id: last.id.clone(),
            call_id: inv.call_id.clone(),
            tool_name: inv.tool_name.clone(),
            arguments: inv.arguments.clone(),
        })
        .collect()
}

/// Convert sanitized history into model messages.
///
/// Completed invocations replay as an assistant tool-call message followed
/// by one tool message per result; the stored text follows them. Pending
/// calls are left out.
pub fn to_model_messages(history: &[Message]) -> Vec<ModelMessage> {
    let mut out = Vec::with_capacity(history.len());

    for message in history {
        match message.role {
            Role::User => out.push(ModelMessage::User(message.content.clone())),
            Role::System => out.push(ModelMessage::System(message.content.clone())),
            Role::Assistant => {
                let completed: Vec<&ToolInvocation> = message
                    .tool_invocations()
                    .iter()
                    .filter(|inv| inv.is_complete())
                    .collect();

                if !completed.is_empty() {
                    out.push(ModelMessage::Assistant {
                        content: String::new(),
                        tool_calls: completed
                            .iter()
                            .map(|inv| ToolCallRequest {
                                call_id: inv.call_id.clone(),
                                name: inv.tool_name.clone(),
                                arguments: inv.arguments.clone(),
                            })
                            .collect(),
                    });
                    for inv in &completed {
                        if let InvocationState::Result { output, .. } = &inv.state {
                            out.push(ModelMessage::Tool {
                                call_id: inv.call_id.clone(),
                                name: inv.tool_name.clone(),
                                output: output.clone(),
                            });
                        }
                    }
                }

                if !message.content.trim().is_empty() {
                    out.push(ModelMessage::Assistant {
                        content: message.content.clone(),
                        tool_calls: Vec::new(),
                    });
                }
            }
        }
    }

    out
}

/// Insert a tool result right after the assistant message that requested
/// `call_id`, behind any results already spliced for that message.
///
/// If no message carries the call, the call and its result are appended so
/// the model never sees a result without its request. Returns the index of
/// the inserted result.
pub fn splice_result(
    messages: &mut Vec<ModelMessage>,
    call: &ToolCallRequest,
    output: impl Into<String>,
) -> usize {
    let result = ModelMessage::Tool {
        call_id: call.call_id.clone(),
        name: call.name.clone(),
        output: output.into(),
    };

    let call_index = messages.iter().rposition(|m| match m {
        ModelMessage::Assistant { tool_calls, .. } => {
            tool_calls.iter().any(|c| c.call_id == call.call_id)
        }
        _ => false,
    });

    match call_index {
        Some(index) => {
            let mut insert_at = index + 1;
            while matches!(messages.get(insert_at), Some(ModelMessage::Tool { .. })) {
                insert_at += 1;
            }
            messages.insert(insert_at, result);
            insert_at
        }
        None => {
            warn!(call_id = %call.call_id, tool = %call.name, "Splicing result for unseen call");
            messages.push(ModelMessage::Assistant {
                content: String::new(),
                tool_calls: vec![call.clone()],
            });
            messages.push(result);
            messages.len() - 1
        }
    }
}
