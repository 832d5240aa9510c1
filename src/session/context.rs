//! Project context and the merge rules applied to partial updates
//!
//! Scalars overwrite, lists concatenate, the service list behaves as a set.
//! A merge never removes a previously recorded list entry.

use serde::{Deserialize, Serialize};

use crate::error::{AssistantError, Result};

/// Largest number of error log lines a single update may append
pub const MAX_ERROR_LOGS_PER_UPDATE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedIssue {
    pub timestamp: i64,
    pub issue: String,
    pub solution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_codes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_files: Option<Vec<String>>,
}

/// Durable per-session project context. Serializes to `{}` when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_issues: Vec<ResolvedIssue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cloudflare_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl ProjectContext {
    pub fn is_empty(&self) -> bool {
        self.worker_code.is_none()
            && self.error_logs.is_empty()
            && self.resolved_issues.is_empty()
            && self.cloudflare_services.is_empty()
            && self.project_name.is_none()
    }
}

/// Partial update; absent fields leave the stored value untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContextUpdate {
    pub worker_code: Option<String>,
    pub error_logs: Option<Vec<String>>,
    pub resolved_issues: Option<Vec<ResolvedIssue>>,
    pub cloudflare_services: Option<Vec<String>>,
    pub project_name: Option<String>,
}

impl ContextUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(logs) = &self.error_logs {
            if logs.len() > MAX_ERROR_LOGS_PER_UPDATE {
                return Err(AssistantError::validation(format!(
                    "errorLogs may append at most {} entries per update, got {}",
                    MAX_ERROR_LOGS_PER_UPDATE,
                    logs.len()
                )));
            }
        }
        if let Some(issues) = &self.resolved_issues {
            if issues.iter().any(|i| i.issue.trim().is_empty()) {
                return Err(AssistantError::validation("resolvedIssues entries need a non-empty issue"));
            }
        }
        Ok(())
    }
}

/// Merge `partial` into `existing` at time `now` (epoch millis)
pub fn merge(existing: &ProjectContext, partial: &ContextUpdate, now: i64) -> ProjectContext {
    let mut merged = existing.clone();

    if let Some(code) = &partial.worker_code {
        merged.worker_code = Some(code.clone());
    }
    if let Some(name) = &partial.project_name {
        merged.project_name = Some(name.clone());
    }

    if let Some(logs) = &partial.error_logs {
        merged.error_logs.extend(logs.iter().cloned());
    }
    if let Some(issues) = &partial.resolved_issues {
        merged.resolved_issues.extend(issues.iter().cloned());
    }

    if let Some(services) = &partial.cloudflare_services {
        merged.cloudflare_services = union_dedup(&merged.cloudflare_services, services);
    }

    merged.last_updated = Some(now);
    merged
}

/// Set union keeping first-seen order
fn union_dedup(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for tag in existing.iter().chain(incoming.iter()) {
        if !out.contains(tag) {
            out.push(tag.clone());
        }
    }
    out
}
