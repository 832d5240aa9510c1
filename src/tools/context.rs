//! Built-in tools over the session's project context

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ToolContext, ToolExecutor, ToolSpec};
use crate::ids;
use crate::session::{ContextUpdate, ResolvedIssue};

/// Return the stored project context as JSON
pub struct GetProjectContext;

impl GetProjectContext {
    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            "get_project_context",
            "Read the project context recorded for this session: worker code, recent error logs, \
             resolved issues, Cloudflare services in use and the project name.",
            json!({"type": "object", "properties": {}, "additionalProperties": false}),
            Self,
        )
    }
}

#[async_trait]
impl ToolExecutor for GetProjectContext {
    async fn execute(&self, ctx: &ToolContext, _input: Value) -> anyhow::Result<String> {
        let context = ctx.session.get_context().await?;
        if context.is_empty() {
            return Ok("No project context recorded yet.".into());
        }
        Ok(serde_json::to_string_pretty(&context)?)
    }
}

/// Merge a partial update into the project context
pub struct UpdateProjectContext;

impl UpdateProjectContext {
    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            "update_project_context",
            "Record facts about the user's project. Lists are appended to, never replaced; \
             services are kept as a set.",
            json!({
                "type": "object",
                "properties": {
                    "workerCode": {"type": "string", "description": "Latest worker source"},
                    "errorLogs": {"type": "array", "items": {"type": "string"}},
                    "cloudflareServices": {"type": "array", "items": {"type": "string"}},
                    "projectName": {"type": "string"}
                },
                "additionalProperties": false
            }),
            Self,
        )
    }
}

#[async_trait]
impl ToolExecutor for UpdateProjectContext {
    async fn execute(&self, ctx: &ToolContext, input: Value) -> anyhow::Result<String> {
        let partial: ContextUpdate = serde_json::from_value(input)?;
        let merged = ctx.session.update_context(&partial).await?;
        Ok(format!(
            "Project context updated ({} error logs, {} services, {} resolved issues)",
            merged.error_logs.len(),
            merged.cloudflare_services.len(),
            merged.resolved_issues.len()
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvedIssueInput {
    issue: String,
    solution: String,
    #[serde(default)]
    error_codes: Option<Vec<String>>,
    #[serde(default)]
    affected_files: Option<Vec<String>>,
}

/// Append a resolved issue. Gated: the user approves what gets recorded.
pub struct RecordResolvedIssue;

impl RecordResolvedIssue {
    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            "record_resolved_issue",
            "Save a problem and the fix that resolved it to the project history. \
             Requires user confirmation.",
            json!({
                "type": "object",
                "properties": {
                    "issue": {"type": "string"},
                    "solution": {"type": "string"},
                    "errorCodes": {"type": "array", "items": {"type": "string"}},
                    "affectedFiles": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["issue", "solution"],
                "additionalProperties": false
            }),
            Self,
        )
        .with_confirmation()
    }
}

#[async_trait]
impl ToolExecutor for RecordResolvedIssue {
    async fn execute(&self, ctx: &ToolContext, input: Value) -> anyhow::Result<String> {
        let input: ResolvedIssueInput = serde_json::from_value(input)?;
        let issue = ResolvedIssue {
            timestamp: ids::now_millis(),
            issue: input.issue,
            solution: input.solution,
            error_codes: input.error_codes,
            affected_files: input.affected_files,
        };
        let summary = issue.issue.clone();

        ctx.session
            .update_context(&ContextUpdate {
                resolved_issues: Some(vec![issue]),
                ..Default::default()
            })
            .await?;
        Ok(format!("Recorded resolved issue: {}", summary))
    }
}
