//! System prompt assembly

use crate::session::ProjectContext;
use crate::tools::ToolRegistry;

/// How many resolved issues to surface in the prompt
const RECENT_ISSUES: usize = 3;

/// Build the system prompt: the configured base text followed by whatever
/// the session already knows about the project.
pub fn build_system_prompt(base: &str, context: &ProjectContext, registry: &ToolRegistry) -> String {
    let mut sections = vec![base.trim().to_string()];

    let mut project = Vec::new();
    if let Some(name) = &context.project_name {
        project.push(format!("Project: {}", name));
    }
    if !context.cloudflare_services.is_empty() {
        project.push(format!("Services in use: {}", context.cloudflare_services.join(", ")));
    }
    if context.worker_code.is_some() {
        project.push("Worker source is on file (read it with get_project_context).".to_string());
    }
    if !context.error_logs.is_empty() {
        project.push(format!("{} error log entries recorded.", context.error_logs.len()));
    }
    if !project.is_empty() {
        sections.push(format!("# Project\n\n{}", project.join("\n")));
    }

    if !context.resolved_issues.is_empty() {
        let recent: Vec<String> = context
            .resolved_issues
            .iter()
            .rev()
            .take(RECENT_ISSUES)
            .map(|i| format!("- {} -> {}", i.issue, i.solution))
            .collect();
        sections.push(format!("# Recently resolved\n\n{}", recent.join("\n")));
    }

    let definitions = registry.definitions();
    let gated: Vec<&str> = definitions
        .iter()
        .filter(|d| registry.requires_confirmation(&d.name))
        .map(|d| d.name.as_str())
        .collect();
    if !gated.is_empty() {
        sections.push(format!(
            "These tools wait for the user's approval before running: {}",
            gated.join(", ")
        ));
    }

    sections.join("\n\n")
}
