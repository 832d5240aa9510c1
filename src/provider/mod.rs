//! Model endpoint abstraction
//!
//! The orchestrator only ever sees [`ModelEndpoint`]: a streaming
//! `generate` call that yields text deltas, tool call requests and a finish
//! marker over an mpsc channel.

mod openai;
mod sse;

pub use openai::OpenAiCompatibleModel;
pub use sse::{SseDecoder, SseFrame};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Tool description advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool input
    pub parameters: Value,
}

/// A tool call directive emitted by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// Conversation entry in the shape the model consumes
#[derive(Debug, Clone, PartialEq)]
pub enum ModelMessage {
    System(String),
    User(String),
    Assistant {
        content: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        call_id: String,
        name: String,
        output: String,
    },
}

impl ModelMessage {
    pub fn role(&self) -> &'static str {
        match self {
            ModelMessage::System(_) => "system",
            ModelMessage::User(_) => "user",
            ModelMessage::Assistant { .. } => "assistant",
            ModelMessage::Tool { .. } => "tool",
        }
    }
}

/// Events streamed back from one `generate` call
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
    /// Generation ended cleanly
    Finish,
    /// Transport or decoding failure; the stream ends after this
    Error(String),
}

/// Input to a single model invocation
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
    /// 1-based index of this invocation within the turn
    pub step: usize,
    pub step_budget: usize,
}

#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    /// Start a streaming generation.
    ///
    /// Cancelling `cancel` must stop reading the upstream response promptly
    /// and close the returned channel.
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>>;

    /// Name for logging
    fn name(&self) -> &str;
}
