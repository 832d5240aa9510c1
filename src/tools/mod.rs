//! Tool catalogue
//!
//! Tools are registered by name as a [`ToolSpec`]: schema, confirmation gate
//! and an executor. Dispatch is a map lookup; execution never aborts a turn,
//! every failure comes back as a failed [`ToolOutcome`] the model can read.

mod context;
pub mod schema;

pub use context::{GetProjectContext, RecordResolvedIssue, UpdateProjectContext};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::AssistantError;
use crate::provider::ToolDefinition;
use crate::session::SessionStore;

/// What an executor gets to work with besides its input
#[derive(Clone)]
pub struct ToolContext {
    pub session: Arc<SessionStore>,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, ctx: &ToolContext, input: Value) -> anyhow::Result<String>;
}

/// Registry entry for one tool
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub requires_confirmation: bool,
    pub executor: Arc<dyn ToolExecutor>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        executor: impl ToolExecutor + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            requires_confirmation: false,
            executor: Arc::new(executor),
        }
    }

    /// Gate execution behind explicit caller approval
    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

/// Result of running one tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: String,
    pub success: bool,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
        }
    }
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
    /// Registration order, so definitions are advertised deterministically
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the project context tools
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(GetProjectContext::spec());
        registry.register(UpdateProjectContext::spec());
        registry.register(RecordResolvedIssue::spec());
        registry
    }

    /// Add or replace a tool
    pub fn register(&mut self, spec: ToolSpec) -> &mut Self {
        if !self.tools.contains_key(&spec.name) {
            self.order.push(spec.name.clone());
        }
        self.tools.insert(spec.name.clone(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .is_some_and(|spec| spec.requires_confirmation)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(ToolSpec::definition)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate and run a tool. Unknown tools, schema violations and
    /// executor errors all produce a failed outcome.
    pub async fn execute(&self, ctx: &ToolContext, name: &str, input: Value) -> ToolOutcome {
        let Some(spec) = self.tools.get(name) else {
            warn!(tool = %name, "Model requested unknown tool");
            return ToolOutcome::failed(format!("Unknown tool: {}", name));
        };

        if let Err(issues) = schema::validate(&spec.input_schema, &input) {
            let detail = issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!(tool = %name, %detail, "Tool input failed validation");
            return ToolOutcome::failed(format!("Invalid input for {}: {}", name, detail));
        }

        let started = Instant::now();
        match spec.executor.execute(ctx, input).await {
            Ok(output) => {
                debug!(
                    tool = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Tool completed"
                );
                ToolOutcome::ok(output)
            }
            Err(e) => {
                let err = AssistantError::ToolExecution {
                    tool: name.to_string(),
                    message: format!("{:#}", e),
                };
                warn!(error = %err, "Tool execution failed");
                ToolOutcome::failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolExecutor for Echo {
        async fn execute(&self, _ctx: &ToolContext, input: Value) -> anyhow::Result<String> {
            Ok(input["text"].as_str().unwrap_or_default().to_string())
        }
    }

    struct Broken;

    #[async_trait]
    impl ToolExecutor for Broken {
        async fn execute(&self, _ctx: &ToolContext, _input: Value) -> anyhow::Result<String> {
            anyhow::bail!("disk on fire")
        }
    }

    fn text_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn ctx() -> ToolContext {
        let pool = db::connect_in_memory().await.unwrap();
        ToolContext {
            session: Arc::new(SessionStore::new(pool, "tools-test")),
        }
    }

    #[test]
    fn test_builtins_registered_in_order() {
        let registry = ToolRegistry::with_builtins();
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["get_project_context", "update_project_context", "record_resolved_issue"]
        );
        assert!(registry.requires_confirmation("record_resolved_issue"));
        assert!(!registry.requires_confirmation("get_project_context"));
        assert!(!registry.requires_confirmation("no_such_tool"));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolSpec::new("echo", "v1", text_schema(), Echo));
        registry.register(ToolSpec::new("echo", "v2", text_schema(), Echo).with_confirmation());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.definitions()[0].description, "v2");
        assert!(registry.requires_confirmation("echo"));
    }

    #[tokio::test]
    async fn test_execute_success_and_failures() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolSpec::new("echo", "echo text", text_schema(), Echo));
        registry.register(ToolSpec::new("broken", "always fails", json!({}), Broken));
        let ctx = ctx().await;

        let ok = registry.execute(&ctx, "echo", json!({"text": "hi"})).await;
        assert_eq!(ok, ToolOutcome::ok("hi"));

        let invalid = registry.execute(&ctx, "echo", json!({"text": 5})).await;
        assert!(!invalid.success);
        assert!(invalid.output.contains("$.text"));

        let broken = registry.execute(&ctx, "broken", json!({})).await;
        assert!(!broken.success);
        assert!(broken.output.contains("disk on fire"));

        let unknown = registry.execute(&ctx, "nope", json!({})).await;
        assert!(!unknown.success);
    }
}
