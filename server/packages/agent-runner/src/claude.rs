use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use agent_console_error::ConsoleError;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::message::AgentMessage;
use crate::{AgentBackend, AgentRequest, AgentStream, PermissionDecision, PermissionGate, ToolPermissionRequest};

const STDERR_TAIL_LINES: usize = 50;
const MESSAGE_BUFFER: usize = 256;

/// Drives the `claude` CLI in stream-json mode.
///
/// Tool approvals arrive as `control_request` lines on stdout and are answered
/// on stdin once the permission gate decides.
#[derive(Debug, Clone)]
pub struct ClaudeCliBackend {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl ClaudeCliBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn command_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--permission-prompt-tool".to_string(),
            "stdio".to_string(),
        ];
        if let Some(resume) = request.resume.as_ref() {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        if let Some(max_turns) = request.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if !request.plugins.is_empty() {
            let enabled = request
                .plugins
                .iter()
                .map(|plugin| (plugin.clone(), Value::Bool(true)))
                .collect::<serde_json::Map<_, _>>();
            args.push("--settings".to_string());
            args.push(json!({ "enabledPlugins": enabled }).to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl AgentBackend for ClaudeCliBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn start(&self, request: AgentRequest) -> Result<AgentStream, ConsoleError> {
        let args = self.command_args(&request);
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(program = ?self.program, cwd = ?request.cwd, resume = ?request.resume, "spawning claude");
        let mut child = command.spawn().map_err(|err| {
            tracing::error!(program = ?self.program, error = %err, "failed to spawn claude");
            ConsoleError::AgentSpawn {
                message: format!("{}: {err}", self.program.display()),
            }
        })?;

        let mut stdin = child.stdin.take().ok_or_else(|| ConsoleError::AgentSpawn {
            message: "failed to capture claude stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ConsoleError::AgentSpawn {
            message: "failed to capture claude stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ConsoleError::AgentSpawn {
            message: "failed to capture claude stderr".to_string(),
        })?;

        let first_line = user_message_line(&request);
        write_line(&mut stdin, &first_line)
            .await
            .map_err(|err| ConsoleError::AgentSpawn {
                message: format!("failed to write prompt: {err}"),
            })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        spawn_stderr_loop(stderr, stderr_tail.clone());

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let pump = Pump {
            child,
            stdin: Some(stdin),
            gate: request.permission_gate.clone(),
            cancel: request.cancel.clone(),
            tx,
            stderr_tail,
        };
        tokio::spawn(pump.run(stdout));

        Ok(ReceiverStream::new(rx).boxed())
    }
}

struct Pump {
    child: Child,
    stdin: Option<ChildStdin>,
    gate: Arc<dyn PermissionGate>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<AgentMessage, ConsoleError>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Pump {
    async fn run(mut self, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        let mut saw_result = false;
        let cancel = self.cancel.clone();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    self.kill().await;
                    return;
                }
                next = lines.next_line() => next,
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    let _ = self
                        .tx
                        .send(Err(ConsoleError::stream(format!("failed to read claude stdout: {err}"))))
                        .await;
                    self.kill().await;
                    return;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(error = %err, line = %trimmed, "skipping non-json claude output");
                    continue;
                }
            };

            match value.get("type").and_then(Value::as_str) {
                Some("control_request") => {
                    if !self.answer_control_request(&value).await {
                        self.kill().await;
                        return;
                    }
                    continue;
                }
                Some("control_response") | Some("control_cancel_request") => continue,
                _ => {}
            }

            let message: AgentMessage = match serde_json::from_value(value) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unrecognized claude message");
                    continue;
                }
            };
            let is_result = message.is_result();
            if self.tx.send(Ok(message)).await.is_err() {
                // Consumer went away.
                self.kill().await;
                return;
            }
            if is_result {
                saw_result = true;
                self.stdin.take();
            }
        }

        self.stdin.take();
        let status = self.child.wait().await;
        if saw_result || self.cancel.is_cancelled() {
            return;
        }
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                let stderr = self.stderr_text();
                tracing::warn!(exit_code = ?status.code(), "claude exited without a result");
                let _ = self
                    .tx
                    .send(Err(ConsoleError::AgentStream {
                        message: format!("claude exited with {status}"),
                        exit_code: status.code(),
                        stderr,
                    }))
                    .await;
            }
            Err(err) => {
                let _ = self
                    .tx
                    .send(Err(ConsoleError::stream(format!("failed to wait for claude: {err}"))))
                    .await;
            }
        }
    }

    /// Returns false when the run was cancelled while the gate was deciding.
    async fn answer_control_request(&mut self, value: &Value) -> bool {
        let request_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let request = value.get("request").cloned().unwrap_or(Value::Null);
        let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or_default();

        let line = if subtype == "can_use_tool" {
            let permission = ToolPermissionRequest {
                tool_name: request
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: request.get("input").cloned().unwrap_or_else(|| json!({})),
                suggestions: request
                    .get("permission_suggestions")
                    .cloned()
                    .unwrap_or(Value::Null),
                tool_use_id: request
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned),
            };
            tracing::debug!(tool = %permission.tool_name, request_id = %request_id, "claude requested tool permission");
            let cancel = self.cancel.clone();
            let decision = tokio::select! {
                _ = cancel.cancelled() => return false,
                decision = self.gate.can_use_tool(permission) => decision,
            };
            control_response_line(&request_id, &decision)
        } else {
            tracing::debug!(subtype = %subtype, "unsupported claude control request");
            control_error_line(&request_id, &format!("unsupported control request: {subtype}"))
        };

        if let Some(stdin) = self.stdin.as_mut() {
            if let Err(err) = write_line(stdin, &line).await {
                tracing::warn!(error = %err, "failed to write claude control response");
            }
        }
        true
    }

    async fn kill(&mut self) {
        self.stdin.take();
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    fn stderr_text(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().ok()?;
        if tail.is_empty() {
            return None;
        }
        Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
    }
}

fn spawn_stderr_loop(
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(line = %line, "claude stderr");
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

fn user_message_line(request: &AgentRequest) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": request.prompt.to_content(),
        },
        "parent_tool_use_id": null,
        "session_id": request.resume.clone().unwrap_or_default(),
    })
    .to_string()
}

fn control_response_line(request_id: &str, decision: &PermissionDecision) -> String {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": decision.to_response_value(),
        }
    })
    .to_string()
}

fn control_error_line(request_id: &str, error: &str) -> String {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error,
        }
    })
    .to_string()
}
