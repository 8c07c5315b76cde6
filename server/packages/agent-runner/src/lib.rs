//! Agent backends driven by the console.
//!
//! An [`AgentBackend`] runs one agent invocation and yields its messages as a
//! stream. Before executing a tool the backend consults the request's
//! [`PermissionGate`] and waits for its decision.

use std::path::PathBuf;
use std::sync::Arc;

use agent_console_error::ConsoleError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

pub mod claude;
pub mod message;
pub mod mock;

pub use message::{AgentMessage, ContentBlock, MessageBody, MessageContent};

pub type AgentStream = BoxStream<'static, Result<AgentMessage, ConsoleError>>;

#[async_trait]
pub trait AgentBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn start(&self, request: AgentRequest) -> Result<AgentStream, ConsoleError>;
}

/// Tool-permission callback invoked by a backend before it runs a tool.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn can_use_tool(&self, request: ToolPermissionRequest) -> PermissionDecision;
}

pub struct AgentRequest {
    pub prompt: Prompt,
    pub cwd: PathBuf,
    pub resume: Option<String>,
    pub max_turns: Option<u32>,
    pub plugins: Vec<String>,
    pub permission_gate: Arc<dyn PermissionGate>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    Blocks(Vec<PromptBlock>),
}

impl Prompt {
    /// Builds a prompt from text plus optional images. Plain text stays a
    /// string so agents without multimodal input still accept it.
    pub fn with_images(text: String, images: Vec<ImageSource>) -> Self {
        if images.is_empty() {
            return Self::Text(text);
        }
        let mut blocks = images
            .into_iter()
            .map(|source| PromptBlock::Image { source })
            .collect::<Vec<_>>();
        if !text.trim().is_empty() {
            blocks.push(PromptBlock::Text { text });
        }
        Self::Blocks(blocks)
    }

    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    PromptBlock::Text { text } => Some(text.as_str()),
                    PromptBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn to_content(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Blocks(blocks) => serde_json::to_value(blocks).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            source_type: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolPermissionRequest {
    pub tool_name: String,
    pub input: Value,
    pub suggestions: Value,
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow {
        updated_input: Value,
        updated_permissions: Option<Value>,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn allow(input: Value) -> Self {
        Self::Allow {
            updated_input: input,
            updated_permissions: None,
        }
    }

    pub fn deny(message: impl Into<String>, interrupt: bool) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// Body of a `can_use_tool` control response.
    pub fn to_response_value(&self) -> Value {
        match self {
            Self::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut map = Map::new();
                map.insert("behavior".to_string(), json!("allow"));
                map.insert("updatedInput".to_string(), updated_input.clone());
                if let Some(updated_permissions) = updated_permissions {
                    map.insert(
                        "updatedPermissions".to_string(),
                        updated_permissions.clone(),
                    );
                }
                Value::Object(map)
            }
            Self::Deny { message, interrupt } => json!({
                "behavior": "deny",
                "message": message,
                "interrupt": interrupt,
            }),
        }
    }
}
