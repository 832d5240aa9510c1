// tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use edgechat::config::OrchestratorConfig;
use edgechat::db;
use edgechat::orchestrator::{ChatEvent, ChatOrchestrator};
use edgechat::provider::{GenerateRequest, ModelEndpoint, StreamEvent, ToolCallRequest};
use edgechat::rate_limit::RateLimiter;
use edgechat::server::AppState;
use edgechat::session::{SessionRegistry, SessionStore};
use edgechat::tools::{ToolContext, ToolExecutor, ToolRegistry, ToolSpec};

/// What the scripted model does once its queued replies run out
#[derive(Clone)]
pub enum Fallback {
    /// Plain text reply
    Text(String),
    /// Request this tool on every step
    AlwaysTool(String),
    /// Never produce anything until cancelled
    Hang,
    /// Fail the stream
    Error(String),
}

/// Model endpoint replaying canned event sequences
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    fallback: Fallback,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerateRequest>>,
    pub started: Notify,
}

impl ScriptedModel {
    pub fn new(fallback: Fallback) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            started: Notify::new(),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(Fallback::Text(text.to_string()))
    }

    /// Queue one reply; replies are consumed in order
    pub fn then(self, events: Vec<StreamEvent>) -> Self {
        self.scripts.lock().unwrap().push_back(events);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelEndpoint for ScriptedModel {
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> edgechat::Result<mpsc::Receiver<StreamEvent>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request);
        self.started.notify_one();

        let scripted = self.scripts.lock().unwrap().pop_front();
        let events = match (scripted, &self.fallback) {
            (Some(events), _) => Some(events),
            (None, Fallback::Text(text)) => Some(text_reply(text)),
            (None, Fallback::AlwaysTool(name)) => {
                Some(tool_reply(&format!("call_{}", n), name, json!({})))
            }
            (None, Fallback::Error(message)) => Some(vec![StreamEvent::Error(message.clone())]),
            (None, Fallback::Hang) => None,
        };

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            match events {
                Some(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                None => {
                    cancel.cancelled().await;
                    drop(tx);
                }
            }
        });
        Ok(rx)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn text_reply(text: &str) -> Vec<StreamEvent> {
    vec![StreamEvent::TextDelta(text.to_string()), StreamEvent::Finish]
}

pub fn tool_reply(call_id: &str, name: &str, arguments: Value) -> Vec<StreamEvent> {
    vec![
        StreamEvent::ToolCall(ToolCallRequest {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments,
        }),
        StreamEvent::Finish,
    ]
}

/// Answers "pong"
pub struct Ping;

#[async_trait]
impl ToolExecutor for Ping {
    async fn execute(&self, _ctx: &ToolContext, _input: Value) -> anyhow::Result<String> {
        Ok("pong".into())
    }
}

/// Always fails
pub struct Explode;

#[async_trait]
impl ToolExecutor for Explode {
    async fn execute(&self, _ctx: &ToolContext, _input: Value) -> anyhow::Result<String> {
        anyhow::bail!("worker crashed")
    }
}

/// Gated tool counting how often it actually ran
pub struct Deploy {
    pub runs: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolExecutor for Deploy {
    async fn execute(&self, _ctx: &ToolContext, input: Value) -> anyhow::Result<String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let target = input["target"].as_str().unwrap_or("production");
        Ok(format!("deployed to {}", target))
    }
}

fn empty_object() -> Value {
    json!({"type": "object", "properties": {}})
}

pub struct Harness {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub model: Arc<ScriptedModel>,
    pub sessions: Arc<SessionRegistry>,
    pub deploy_runs: Arc<AtomicUsize>,
}

impl Harness {
    pub async fn new(model: ScriptedModel, max_steps: usize) -> Self {
        let pool = db::connect_in_memory().await.expect("in-memory database");
        let deploy_runs = Arc::new(AtomicUsize::new(0));

        let mut registry = ToolRegistry::with_builtins();
        registry
            .register(ToolSpec::new("ping", "Health probe", empty_object(), Ping))
            .register(ToolSpec::new("explode", "Always fails", empty_object(), Explode))
            .register(
                ToolSpec::new(
                    "deploy",
                    "Deploy the worker",
                    json!({"type": "object", "properties": {"target": {"type": "string"}}}),
                    Deploy {
                        runs: Arc::clone(&deploy_runs),
                    },
                )
                .with_confirmation(),
            );

        let model = Arc::new(model);
        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::new(registry),
            Arc::clone(&model) as Arc<dyn ModelEndpoint>,
            OrchestratorConfig {
                max_steps,
                ..Default::default()
            },
        ));

        Self {
            orchestrator,
            model,
            sessions: Arc::new(SessionRegistry::new(pool)),
            deploy_runs,
        }
    }

    pub fn store(&self, actor: &str) -> Arc<SessionStore> {
        self.sessions.get(actor).expect("valid actor id")
    }

    /// Router state over this harness, optionally rate limited
    pub fn app_state(&self, rate_limiter: Option<Arc<RateLimiter>>) -> AppState {
        AppState {
            sessions: Arc::clone(&self.sessions),
            orchestrator: Arc::clone(&self.orchestrator),
            rate_limiter,
        }
    }
}

/// Event sink whose receiver collects everything sent
pub fn event_sink() -> (mpsc::Sender<ChatEvent>, mpsc::Receiver<ChatEvent>) {
    mpsc::channel(256)
}

pub fn drain(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
