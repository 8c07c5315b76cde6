use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::ChatRecord;

/// The one event vocabulary every producer emits.
///
/// Both the live driver and the CLI log monitor produce these, so stream
/// consumers only ever need a single decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        name: String,
        input: Value,
    },
    ToolResult {
        content: String,
    },
    PermissionRequest {
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
        suggestions: Value,
    },
    UserQuestion {
        questions: Value,
    },
    PlanReview {
        content: String,
    },
    ChatCreated {
        #[serde(rename = "sessionKey")]
        session_key: String,
        record: ChatRecord,
    },
    Compacting,
    /// New content landed in a CLI log; consumers re-fetch history.
    Update,
    Done,
    Error {
        message: String,
    },
}

impl NormalizedEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::PermissionRequest { .. } => "permission_request",
            Self::UserQuestion { .. } => "user_question",
            Self::PlanReview { .. } => "plan_review",
            Self::ChatCreated { .. } => "chat_created",
            Self::Compacting => "compacting",
            Self::Update => "update",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }
}
