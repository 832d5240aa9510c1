//! Events streamed to the caller while a turn runs

use serde::Serialize;
use serde_json::Value;

use crate::session::Message;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatEvent {
    /// Streaming text from the model
    TextDelta { delta: String },

    /// The model asked for a tool
    ToolCallStart {
        call_id: String,
        name: String,
        arguments: Value,
    },

    /// A tool finished, or was declined
    ToolCallResult {
        call_id: String,
        name: String,
        success: bool,
        output: String,
    },

    /// The turn is suspended until this call is approved or rejected
    ConfirmationRequired {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },

    /// Turn over. `message` is the persisted assistant reply, absent when
    /// the turn suspended for confirmation.
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
    },

    Error { message: String, error_code: String },
}
