use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    ChatNotFound,
    FolderMissing,
    EmptyPrompt,
    SessionNotFound,
    AgentSpawn,
    AgentStream,
    Store,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-console:error:invalid_request",
            Self::ChatNotFound => "urn:agent-console:error:chat_not_found",
            Self::FolderMissing => "urn:agent-console:error:folder_missing",
            Self::EmptyPrompt => "urn:agent-console:error:empty_prompt",
            Self::SessionNotFound => "urn:agent-console:error:session_not_found",
            Self::AgentSpawn => "urn:agent-console:error:agent_spawn",
            Self::AgentStream => "urn:agent-console:error:agent_stream",
            Self::Store => "urn:agent-console:error:store",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::ChatNotFound => "Chat Not Found",
            Self::FolderMissing => "Folder Missing",
            Self::EmptyPrompt => "Empty Prompt",
            Self::SessionNotFound => "Session Not Found",
            Self::AgentSpawn => "Agent Spawn Failed",
            Self::AgentStream => "Agent Stream Error",
            Self::Store => "Store Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::ChatNotFound => 404,
            Self::FolderMissing => 400,
            Self::EmptyPrompt => 400,
            Self::SessionNotFound => 404,
            Self::AgentSpawn => 502,
            Self::AgentStream => 502,
            Self::Store => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Failures surfaced to callers of console operations.
///
/// In-stream agent failures travel as `error` events instead; this type only
/// covers failures that abort a request before (or while) a session starts.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("chat not found: {key}")]
    ChatNotFound { key: String },
    #[error("folder does not exist: {folder}")]
    FolderMissing { folder: String },
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("no running session or log file for: {key}")]
    SessionNotFound { key: String },
    #[error("failed to start agent: {message}")]
    AgentSpawn { message: String },
    #[error("agent stream error: {message}")]
    AgentStream {
        message: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("store error: {message}")]
    Store { message: String },
}

impl ConsoleError {
    pub fn stream(message: impl Into<String>) -> Self {
        Self::AgentStream {
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::ChatNotFound { .. } => ErrorType::ChatNotFound,
            Self::FolderMissing { .. } => ErrorType::FolderMissing,
            Self::EmptyPrompt => ErrorType::EmptyPrompt,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::AgentSpawn { .. } => ErrorType::AgentSpawn,
            Self::AgentStream { .. } => ErrorType::AgentStream,
            Self::Store { .. } => ErrorType::Store,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::ChatNotFound { key } | Self::SessionNotFound { key } => {
                extensions.insert("sessionKey".to_string(), Value::String(key.clone()));
            }
            Self::FolderMissing { folder } => {
                extensions.insert("folder".to_string(), Value::String(folder.clone()));
            }
            Self::AgentStream {
                exit_code, stderr, ..
            } => {
                if let Some(code) = exit_code {
                    extensions.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    extensions.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::InvalidRequest { .. }
            | Self::EmptyPrompt
            | Self::AgentSpawn { .. }
            | Self::Store { .. } => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<ConsoleError> for ProblemDetails {
    fn from(value: ConsoleError) -> Self {
        value.to_problem_details()
    }
}

impl From<&ConsoleError> for ProblemDetails {
    fn from(value: &ConsoleError) -> Self {
        value.to_problem_details()
    }
}

impl From<std::io::Error> for ConsoleError {
    fn from(value: std::io::Error) -> Self {
        Self::Store {
            message: value.to_string(),
        }
    }
}
