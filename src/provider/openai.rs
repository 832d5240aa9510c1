//! OpenAI-compatible Chat Completions endpoint (streaming)
//!
//! Works against any server speaking the `/chat/completions` SSE dialect.
//! Parallel tool calls arrive interleaved and are accumulated by index until
//! the choice finishes.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{GenerateRequest, ModelEndpoint, ModelMessage, SseDecoder, StreamEvent, ToolCallRequest, ToolDefinition};
use crate::config::ModelConfig;
use crate::error::{AssistantError, Result};

pub struct OpenAiCompatibleModel {
    client: HttpClient,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: Option<u32>,
    request_timeout: Duration,
}

impl OpenAiCompatibleModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AssistantError::ModelTransport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        })
    }

    fn build_body(&self, request: &GenerateRequest) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::text("system", &request.system_prompt));
        messages.extend(request.messages.iter().map(ChatMessage::from_model));

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(request.tools.iter().map(ChatTool::from_definition).collect())
            },
            stream: true,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl ModelEndpoint for OpenAiCompatibleModel {
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let body = self.build_body(&request);
        debug!(
            model = %self.model,
            step = request.step,
            messages = body.messages.len(),
            tools = request.tools.len(),
            "Sending chat completion request"
        );

        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(self.request_timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AssistantError::Cancelled),
            sent = builder.send() => sent.map_err(|e| AssistantError::ModelTransport(e.to_string()))?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|e| format!("(failed to read body: {})", e));
            return Err(AssistantError::ModelTransport(format!(
                "model endpoint returned {}: {}",
                status, text
            )));
        }

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(process_sse_stream(response.bytes_stream(), tx, cancel));
        Ok(rx)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[derive(Default)]
struct InFlightCall {
    id: String,
    name: String,
    args: String,
}

impl InFlightCall {
    fn into_request(self) -> Option<ToolCallRequest> {
        if self.name.is_empty() {
            warn!(call_id = %self.id, "Discarding streamed tool call without a name");
            return None;
        }
        let arguments = if self.args.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            // Unparseable arguments are passed through as a string; schema
            // validation turns them into a failed result the model can see.
            serde_json::from_str(&self.args).unwrap_or(Value::String(self.args))
        };
        // Some compatible servers omit ids on streamed calls
        let call_id = if self.id.is_empty() {
            format!("call_{}", uuid::Uuid::new_v4().simple())
        } else {
            self.id
        };
        Some(ToolCallRequest {
            call_id,
            name: self.name,
            arguments,
        })
    }
}

/// Decode an SSE byte stream into [`StreamEvent`]s until it ends, fails or
/// `cancel` fires. Cancellation closes the channel without a `Finish`.
async fn process_sse_stream<S, B, E>(stream: S, tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken)
where
    S: Stream<Item = std::result::Result<B, E>> + Send,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();
    let mut calls: BTreeMap<usize, InFlightCall> = BTreeMap::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Model stream cancelled");
                return;
            }
            next = stream.next() => next,
        };

        let Some(chunk) = chunk else { break };
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                return;
            }
        };

        for frame in decoder.push(chunk.as_ref()) {
            if frame.is_done() {
                flush_calls(&mut calls, &tx).await;
                let _ = tx.send(StreamEvent::Finish).await;
                return;
            }

            let data: ChatStreamChunk = match frame.parse() {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, data = %frame.preview(), "Skipping undecodable stream frame");
                    continue;
                }
            };

            for choice in data.choices {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() && tx.send(StreamEvent::TextDelta(content)).await.is_err() {
                        return;
                    }
                }

                for tc in choice.delta.tool_calls.unwrap_or_default() {
                    let call = calls.entry(tc.index).or_default();
                    if let Some(id) = tc.id {
                        call.id = id;
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            call.name = name;
                        }
                        if let Some(args) = function.arguments {
                            call.args.push_str(&args);
                        }
                    }
                }

                if choice.finish_reason.is_some() {
                    flush_calls(&mut calls, &tx).await;
                }
            }
        }
    }

    // Upstream closed without [DONE]
    flush_calls(&mut calls, &tx).await;
    let _ = tx.send(StreamEvent::Finish).await;
}

async fn flush_calls(calls: &mut BTreeMap<usize, InFlightCall>, tx: &mpsc::Sender<StreamEvent>) {
    for (_, call) in std::mem::take(calls) {
        if let Some(request) = call.into_request() {
            let _ = tx.send(StreamEvent::ToolCall(request)).await;
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn from_model(message: &ModelMessage) -> Self {
        match message {
            ModelMessage::System(text) | ModelMessage::User(text) => Self::text(message.role(), text),
            ModelMessage::Assistant { content, tool_calls } => Self {
                role: "assistant",
                content: (!content.is_empty()).then(|| content.clone()),
                tool_calls: (!tool_calls.is_empty()).then(|| {
                    tool_calls
                        .iter()
                        .map(|c| ChatToolCall {
                            id: c.call_id.clone(),
                            call_type: "function",
                            function: ChatToolCallFunction {
                                name: c.name.clone(),
                                arguments: c.arguments.to_string(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: None,
            },
            ModelMessage::Tool { call_id, output, .. } => Self {
                role: "tool",
                content: Some(output.clone()),
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: ChatToolCallFunction,
}

#[derive(Debug, Serialize)]
struct ChatToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatFunction,
}

impl ChatTool {
    fn from_definition(def: &ToolDefinition) -> Self {
        Self {
            tool_type: "function",
            function: ChatFunction {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
