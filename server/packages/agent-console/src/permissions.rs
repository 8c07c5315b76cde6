use std::sync::Arc;

use agent_console_runner::{PermissionDecision, PermissionGate, ToolPermissionRequest};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use utoipa::ToSchema;

use crate::bootstrap::is_temp_key;
use crate::events::NormalizedEvent;
use crate::registry::{PendingInfo, PendingPermission, SessionRegistry, SESSION_ABORTED};
use crate::store::ChatStore;

pub const USER_DENIED: &str = "User denied permission";

const SAFE_TOOLS: &[&str] = &[
    "TodoWrite",
    "Task",
    "TaskOutput",
    "EnterPlanMode",
    "SlashCommand",
    "Skill",
];
const ASK_USER_TOOL: &str = "AskUserQuestion";
const EXIT_PLAN_TOOL: &str = "ExitPlanMode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    FileRead,
    FileWrite,
    CodeExecution,
    WebAccess,
}

/// `None` for tools that never need approval. Anything unrecognized is
/// treated as a file write.
pub fn categorize(tool_name: &str) -> Option<ToolCategory> {
    if SAFE_TOOLS.contains(&tool_name) {
        return None;
    }
    let category = match tool_name {
        "Read" | "Glob" | "Grep" | "LS" | "NotebookRead" => ToolCategory::FileRead,
        "Bash" | "BashOutput" | "KillShell" | "KillBash" => ToolCategory::CodeExecution,
        "WebFetch" | "WebSearch" => ToolCategory::WebAccess,
        _ => ToolCategory::FileWrite,
    };
    Some(category)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Allow,
    #[default]
    Ask,
    Deny,
}

fn default_read_mode() -> PolicyMode {
    PolicyMode::Allow
}

/// Per-category default decision stored on a chat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPolicy {
    #[serde(default = "default_read_mode")]
    pub file_read: PolicyMode,
    #[serde(default)]
    pub file_write: PolicyMode,
    #[serde(default)]
    pub code_execution: PolicyMode,
    #[serde(default)]
    pub web_access: PolicyMode,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            file_read: PolicyMode::Allow,
            file_write: PolicyMode::Ask,
            code_execution: PolicyMode::Ask,
            web_access: PolicyMode::Ask,
        }
    }
}

impl PermissionPolicy {
    pub fn mode(&self, category: ToolCategory) -> PolicyMode {
        match category {
            ToolCategory::FileRead => self.file_read,
            ToolCategory::FileWrite => self.file_write,
            ToolCategory::CodeExecution => self.code_execution,
            ToolCategory::WebAccess => self.web_access,
        }
    }
}

/// How a parked request is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptShape {
    Permission,
    Question,
    PlanReview,
}

impl PromptShape {
    fn of(tool_name: &str) -> Self {
        match tool_name {
            ASK_USER_TOOL => Self::Question,
            EXIT_PLAN_TOOL => Self::PlanReview,
            _ => Self::Permission,
        }
    }

    fn event(self, request: &ToolPermissionRequest) -> NormalizedEvent {
        match self {
            Self::Permission => NormalizedEvent::PermissionRequest {
                tool_name: request.tool_name.clone(),
                input: request.input.clone(),
                suggestions: request.suggestions.clone(),
            },
            Self::Question => NormalizedEvent::UserQuestion {
                questions: request
                    .input
                    .get("questions")
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new())),
            },
            Self::PlanReview => NormalizedEvent::PlanReview {
                content: request
                    .input
                    .get("plan")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
        }
    }
}

/// A prompt waiting for the session's driver to park and announce it.
///
/// The driver drains these between agent messages, so a prompt never reaches
/// subscribers ahead of `chat_created` or the `tool_use` it belongs to.
pub struct GateRequest {
    pending: PendingPermission,
    event: NormalizedEvent,
}

pub type GateRequests = mpsc::UnboundedReceiver<GateRequest>;

impl GateRequest {
    pub fn tool_name(&self) -> &str {
        &self.pending.info.tool_name
    }

    /// Parks the prompt on the session and announces it. A session that is
    /// already gone drops the prompt, which denies the tool.
    pub async fn announce(self, registry: &SessionRegistry, instance: u64) {
        match registry.park(instance, self.pending).await {
            Ok((_, channel)) => {
                channel.send(self.event);
            }
            Err(_) => {
                tracing::debug!(instance, "session ended before its prompt was announced");
            }
        }
    }
}

/// The tool-permission callback handed to the agent for one driver run.
///
/// Decides from the chat's stored policy when it can, otherwise hands the
/// request to the driver and waits for `respond` or cancellation.
pub struct SessionPermissionGate {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ChatStore>,
    instance: u64,
    /// Policy used until the chat has a durable record.
    initial_policy: PermissionPolicy,
    requests: mpsc::UnboundedSender<GateRequest>,
}

impl SessionPermissionGate {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ChatStore>,
        instance: u64,
        initial_policy: PermissionPolicy,
    ) -> (Self, GateRequests) {
        let (requests, receiver) = mpsc::unbounded_channel();
        let gate = Self {
            registry,
            store,
            instance,
            initial_policy,
            requests,
        };
        (gate, receiver)
    }

    async fn current_policy(&self) -> PermissionPolicy {
        let Some(key) = self.registry.key_for_instance(self.instance).await else {
            return self.initial_policy;
        };
        if is_temp_key(&key) {
            return self.initial_policy;
        }
        match self.store.get(&key).await {
            Ok(Some(record)) => record.metadata.permissions,
            Ok(None) => self.initial_policy,
            Err(err) => {
                tracing::warn!(session_key = %key, error = %err, "failed to read permission policy");
                self.initial_policy
            }
        }
    }
}

#[async_trait]
impl PermissionGate for SessionPermissionGate {
    async fn can_use_tool(&self, request: ToolPermissionRequest) -> PermissionDecision {
        let shape = PromptShape::of(&request.tool_name);
        if shape == PromptShape::Permission {
            let Some(category) = categorize(&request.tool_name) else {
                return PermissionDecision::allow(request.input);
            };
            match self.current_policy().await.mode(category) {
                PolicyMode::Allow => return PermissionDecision::allow(request.input),
                PolicyMode::Deny => {
                    tracing::info!(tool = %request.tool_name, "tool denied by policy");
                    return PermissionDecision::deny(
                        format!("{} is denied by this chat's permission policy", request.tool_name),
                        true,
                    );
                }
                PolicyMode::Ask => {}
            }
        }

        let event = shape.event(&request);
        let (pending, decision) = PendingPermission::new(PendingInfo {
            tool_name: request.tool_name,
            input: request.input,
            suggestions: request.suggestions,
        });
        if self.requests.send(GateRequest { pending, event }).is_err() {
            return PermissionDecision::deny(SESSION_ABORTED, true);
        }
        // A dropped sink means the session was torn down.
        decision
            .await
            .unwrap_or_else(|_| PermissionDecision::deny(SESSION_ABORTED, true))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReply {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_permissions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RespondOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// Resolves the pending permission for `key`, if any.
pub async fn respond(registry: &SessionRegistry, key: &str, reply: PermissionReply) -> RespondOutcome {
    let Some(pending) = registry.take_pending(key).await else {
        return RespondOutcome {
            ok: false,
            tool_name: None,
        };
    };
    let tool_name = pending.info.tool_name.clone();
    let decision = if reply.allow {
        PermissionDecision::Allow {
            updated_input: reply
                .updated_input
                .unwrap_or_else(|| pending.info.input.clone()),
            updated_permissions: reply.updated_permissions,
        }
    } else {
        PermissionDecision::deny(USER_DENIED, false)
    };
    let delivered = pending.resolve(decision);
    tracing::info!(session_key = %key, tool = %tool_name, allow = reply.allow, delivered, "permission resolved");
    RespondOutcome {
        ok: delivered,
        tool_name: Some(tool_name),
    }
}
