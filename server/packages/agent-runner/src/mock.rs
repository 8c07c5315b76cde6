use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_console_error::ConsoleError;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::message::{AgentMessage, ContentBlock};
use crate::{AgentBackend, AgentRequest, AgentStream, PermissionDecision, ToolPermissionRequest};

/// One scripted action of a [`MockAgent`] run.
#[derive(Debug, Clone)]
pub enum MockStep {
    Text(String),
    Thinking(String),
    /// Asks the permission gate, then reports `output` (or the denial).
    Tool {
        name: String,
        input: Value,
        output: Value,
    },
    Compact,
    Fail(String),
    Pause(Duration),
    WaitForCancel,
}

impl MockStep {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tool(name: impl Into<String>, input: Value, output: Value) -> Self {
        Self::Tool {
            name: name.into(),
            input,
            output,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockInvocation {
    pub prompt: String,
    pub resume: Option<String>,
    pub plugins: Vec<String>,
}

/// Scripted in-process agent.
///
/// Every run starts with a `system/init` message and ends with a `result`.
/// The script is picked by the first rule whose keyword appears in the prompt;
/// without a match the agent echoes the prompt back.
#[derive(Debug, Clone, Default)]
pub struct MockAgent {
    rules: Vec<(String, Vec<MockStep>)>,
    fallback: Option<Vec<MockStep>>,
    session_id: Option<String>,
    counter: Arc<AtomicU64>,
    invocations: Arc<Mutex<Vec<MockInvocation>>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, steps: Vec<MockStep>) -> Self {
        self.fallback = Some(steps);
        self
    }

    pub fn on_prompt(mut self, keyword: impl Into<String>, steps: Vec<MockStep>) -> Self {
        self.rules.push((keyword.into(), steps));
        self
    }

    /// Fixed id reported by fresh (non-resumed) runs.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn invocations(&self) -> Vec<MockInvocation> {
        self.invocations
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn script_for(&self, prompt: &str) -> Vec<MockStep> {
        if let Some((_, steps)) = self.rules.iter().find(|(keyword, _)| prompt.contains(keyword)) {
            return steps.clone();
        }
        match self.fallback.as_ref() {
            Some(steps) => steps.clone(),
            None => vec![MockStep::Text(format!("echo: {prompt}"))],
        }
    }
}

#[async_trait]
impl AgentBackend for MockAgent {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, request: AgentRequest) -> Result<AgentStream, ConsoleError> {
        let prompt = request.prompt.text();
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push(MockInvocation {
                prompt: prompt.clone(),
                resume: request.resume.clone(),
                plugins: request.plugins.clone(),
            });
        }
        let run = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = request
            .resume
            .clone()
            .or_else(|| self.session_id.clone())
            .unwrap_or_else(|| format!("mock-session-{run}"));
        let steps = self.script_for(&prompt);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_script(session_id, steps, request, tx));
        Ok(ReceiverStream::new(rx).boxed())
    }
}

type Sender = mpsc::Sender<Result<AgentMessage, ConsoleError>>;

async fn run_script(session_id: String, steps: Vec<MockStep>, request: AgentRequest, tx: Sender) {
    let cancel = request.cancel.clone();
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(session_id = %session_id, "mock run cancelled");
        }
        _ = play(&session_id, steps, &request, &tx) => {}
    }
}

async fn play(session_id: &str, steps: Vec<MockStep>, request: &AgentRequest, tx: &Sender) {
    if tx.send(Ok(AgentMessage::system("init", session_id))).await.is_err() {
        return;
    }
    for (index, step) in steps.into_iter().enumerate() {
        let message = match step {
            MockStep::Text(text) => AgentMessage::assistant(session_id, vec![ContentBlock::Text { text }]),
            MockStep::Thinking(thinking) => {
                AgentMessage::assistant(session_id, vec![ContentBlock::Thinking { thinking }])
            }
            MockStep::Compact => AgentMessage::system("compact_boundary", session_id),
            MockStep::Pause(duration) => {
                tokio::time::sleep(duration).await;
                continue;
            }
            MockStep::WaitForCancel => {
                request.cancel.cancelled().await;
                return;
            }
            MockStep::Fail(message) => {
                let _ = tx.send(Err(ConsoleError::stream(message))).await;
                return;
            }
            MockStep::Tool {
                name,
                input,
                output,
            } => {
                let tool_use_id = format!("toolu_{index}");
                let tool_use = AgentMessage::assistant(
                    session_id,
                    vec![ContentBlock::ToolUse {
                        id: tool_use_id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    }],
                );
                if tx.send(Ok(tool_use)).await.is_err() {
                    return;
                }
                let decision = request
                    .permission_gate
                    .can_use_tool(ToolPermissionRequest {
                        tool_name: name,
                        input,
                        suggestions: Value::Null,
                        tool_use_id: Some(tool_use_id.clone()),
                    })
                    .await;
                let (content, is_error, interrupt) = match decision {
                    PermissionDecision::Allow { .. } => (output, None, false),
                    PermissionDecision::Deny { message, interrupt } => {
                        (Value::String(message), Some(true), interrupt)
                    }
                };
                let result = AgentMessage::user(
                    session_id,
                    vec![ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    }],
                );
                if tx.send(Ok(result)).await.is_err() {
                    return;
                }
                if interrupt {
                    break;
                }
                continue;
            }
        };
        if tx.send(Ok(message)).await.is_err() {
            return;
        }
    }
    let _ = tx
        .send(Ok(AgentMessage::result(session_id, "success", false, None)))
        .await;
}
