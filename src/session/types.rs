//! Session types for chat persistence

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::AssistantError;

use super::context::ProjectContext;

/// Who authored a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AssistantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(AssistantError::validation(format!("unknown role '{}'", other))),
        }
    }
}

/// Lifecycle state of a tool invocation recorded on an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InvocationState {
    /// Requested by the model, no result yet
    Call,
    /// Completed, successfully or not
    Result { output: String, success: bool },
}

/// One tool call the model made during a turn, with its result if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(flatten)]
    pub state: InvocationState,
}

impl ToolInvocation {
    pub fn is_complete(&self) -> bool {
        matches!(self.state, InvocationState::Result { .. })
    }
}

/// Optional per-message metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Names of tools that fired while producing this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
    /// Full invocation records, replayed to the model on later turns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty()
            && self.processing_time_ms.is_none()
            && self.code_language.is_none()
            && self.tool_invocations.is_empty()
    }
}

/// A stored chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn tool_invocations(&self) -> &[ToolInvocation] {
        self.metadata
            .as_ref()
            .map(|m| m.tool_invocations.as_slice())
            .unwrap_or(&[])
    }
}

/// Session activity state
///
/// `Created -> Active` on the first stored message, `-> Inactive` on
/// deactivate. Only a clear re-enters `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Active,
    Inactive,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => SessionStatus::Active,
            "inactive" => SessionStatus::Inactive,
            _ => SessionStatus::Created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub message_count: i64,
    pub is_active: bool,
    pub status: SessionStatus,
}

/// Conjunctive filter for history reads
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    pub role: Option<Role>,
    /// Only messages strictly newer than this timestamp
    pub after: Option<i64>,
    /// Only messages strictly older than this timestamp
    pub before: Option<i64>,
    /// Most recent N matching messages, still returned oldest first
    pub limit: Option<i64>,
}

/// Full snapshot returned by `GET /state`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session: SessionInfo,
    pub messages: Vec<Message>,
    pub project_context: ProjectContext,
}
