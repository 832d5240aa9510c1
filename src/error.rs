//! Error taxonomy for the conversation core
//!
//! One enum covers every failure a caller can observe. The HTTP layer maps
//! each variant onto a status code and the standard JSON error envelope.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AssistantError {
    /// Malformed request shape; rejected before session state is touched
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("migration failure: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("model transport failure: {0}")]
    ModelTransport(String),

    #[error("turn cancelled")]
    Cancelled,

    #[error("tool loop did not converge within {budget} steps")]
    StepBudgetExceeded { budget: usize },

    #[error("tool call {call_id} ({tool_name}) is awaiting confirmation")]
    ConfirmationRequired { call_id: String, tool_name: String },

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AssistantError>;

impl AssistantError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ConfirmationRequired { .. } => StatusCode::CONFLICT,
            Self::ModelTransport(_) => StatusCode::BAD_GATEWAY,
            Self::StepBudgetExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::ToolExecution { .. }
            | Self::Persistence(_)
            | Self::Migration(_)
            | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Persistence(_) | Self::Migration(_) => "PERSISTENCE_ERROR",
            Self::ToolExecution { .. } => "TOOL_EXECUTION_ERROR",
            Self::ModelTransport(_) => "MODEL_TRANSPORT_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::StepBudgetExceeded { .. } => "STEP_BUDGET_EXCEEDED",
            Self::ConfirmationRequired { .. } => "CONFIRMATION_REQUIRED",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl IntoResponse for AssistantError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let mut body = json!({
            "error": true,
            "message": self.to_string(),
            "status": status.as_u16(),
            "error_code": self.error_code(),
        });

        match &self {
            Self::RateLimitExceeded { retry_after_secs } => {
                body["retryAfter"] = json!(retry_after_secs);
                let mut response = (status, Json(body)).into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            Self::ConfirmationRequired { call_id, tool_name } => {
                body["callId"] = json!(call_id);
                body["toolName"] = json!(tool_name);
                (status, Json(body)).into_response()
            }
            _ => (status, Json(body)).into_response(),
        }
    }
}
