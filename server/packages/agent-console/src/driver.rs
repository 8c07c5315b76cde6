use std::sync::Arc;

use agent_console_error::ConsoleError;
use agent_console_runner::{AgentBackend, AgentMessage, AgentRequest, ContentBlock};
use futures::StreamExt;
use serde_json::Value;

use crate::bootstrap::{complete_bootstrap, is_temp_key, NewChat};
use crate::events::NormalizedEvent;
use crate::permissions::{GateRequest, GateRequests};
use crate::registry::{ActiveSession, SessionRegistry};
use crate::store::ChatStore;

enum Finish {
    Completed,
    Cancelled,
}

enum Step {
    Message(Option<Result<AgentMessage, ConsoleError>>),
    Prompt(GateRequest),
}

/// Runs one agent invocation to completion and translates its messages into
/// events on the session channel.
pub(crate) struct Driver {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn ChatStore>,
    pub backend: Arc<dyn AgentBackend>,
    pub session: ActiveSession,
    /// Temporary until bootstrap completes, then the durable key.
    pub key: String,
    /// Set for new chats until the agent reports its session id.
    pub new_chat: Option<NewChat>,
    pub known_session_id: Option<String>,
    /// Prompts from this run's permission gate, announced in stream order.
    pub prompts: GateRequests,
}

impl Driver {
    pub async fn run(mut self, request: AgentRequest) {
        let outcome = self.drive(request).await;
        let cancelled = self.session.cancel.is_cancelled();
        self.registry.remove_instance(self.session.instance).await;

        match outcome {
            Ok(Finish::Completed) if !cancelled => {
                if !is_temp_key(&self.key) {
                    if let Err(err) = self.store.touch(&self.key).await {
                        tracing::warn!(session_key = %self.key, error = %err, "failed to touch chat record");
                    }
                }
                tracing::info!(session_key = %self.key, "agent run completed");
                self.session.channel.send(NormalizedEvent::Done);
            }
            Err(err) if !cancelled => {
                tracing::warn!(session_key = %self.key, error = %err, "agent run failed");
                self.session.channel.send(NormalizedEvent::error(err.to_string()));
            }
            _ => {
                tracing::info!(session_key = %self.key, "agent run cancelled");
                self.session.channel.close();
            }
        }
    }

    async fn drive(&mut self, request: AgentRequest) -> Result<Finish, ConsoleError> {
        let cancel = self.session.cancel.clone();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Finish::Cancelled),
            started = self.backend.start(request) => started?,
        };

        loop {
            // Prompts wait for bootstrap so `chat_created` is always first.
            // Queued agent messages go ahead of them.
            let bootstrapped = self.new_chat.is_none();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Finish::Cancelled),
                next = stream.next() => Step::Message(next),
                Some(prompt) = self.prompts.recv(), if bootstrapped => Step::Prompt(prompt),
            };
            let message = match step {
                Step::Message(Some(message)) => message?,
                Step::Message(None) => break,
                Step::Prompt(prompt) => {
                    prompt.announce(&self.registry, self.session.instance).await;
                    continue;
                }
            };
            if cancel.is_cancelled() {
                return Ok(Finish::Cancelled);
            }

            if let Some(session_id) = message.session_id.as_deref().filter(|id| !id.is_empty()) {
                self.observe_session_id(session_id).await?;
            }
            if let Some(error) = message.result_error() {
                return Err(ConsoleError::stream(error));
            }
            for event in message_events(&message) {
                self.session.channel.send(event);
            }
        }
        Ok(Finish::Completed)
    }

    async fn observe_session_id(&mut self, session_id: &str) -> Result<(), ConsoleError> {
        if let Some(chat) = self.new_chat.take() {
            complete_bootstrap(
                self.store.as_ref(),
                &self.registry,
                &self.session.channel,
                &self.key,
                session_id,
                &chat,
            )
            .await?;
            self.key = session_id.to_string();
            self.known_session_id = Some(session_id.to_string());
            return Ok(());
        }
        if self.known_session_id.as_deref() == Some(session_id) {
            return Ok(());
        }
        self.known_session_id = Some(session_id.to_string());
        if let Err(err) = self.store.append_session_id(&self.key, session_id).await {
            tracing::warn!(session_key = %self.key, error = %err, "failed to record session id");
        }
        Ok(())
    }
}

/// Events for one agent message, in block order.
pub fn message_events(message: &AgentMessage) -> Vec<NormalizedEvent> {
    if message.is_compact_boundary() {
        return vec![NormalizedEvent::Compacting];
    }
    if message.is_assistant() {
        return message.blocks().iter().filter_map(block_event).collect();
    }
    if message.is_user() {
        // User turns only matter for the tool results they carry.
        return message
            .blocks()
            .iter()
            .filter(|block| matches!(block, ContentBlock::ToolResult { .. }))
            .filter_map(block_event)
            .collect();
    }
    Vec::new()
}

fn block_event(block: &ContentBlock) -> Option<NormalizedEvent> {
    let event = match block {
        ContentBlock::Text { text } => NormalizedEvent::Text { text: text.clone() },
        ContentBlock::Thinking { thinking } => NormalizedEvent::Thinking {
            text: thinking.clone(),
        },
        ContentBlock::ToolUse { name, input, .. } => NormalizedEvent::ToolUse {
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult { content, .. } => NormalizedEvent::ToolResult {
            content: flatten_tool_result(content),
        },
        ContentBlock::Unknown => return None,
    };
    Some(event)
}

/// Tool output as plain text: strings verbatim, arrays newline-joined,
/// text fragments pulled out of objects, anything else as JSON.
pub fn flatten_tool_result(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(flatten_fragment)
            .collect::<Vec<_>>()
            .join("\n"),
        other => flatten_fragment(other),
    }
}

fn flatten_fragment(fragment: &Value) -> String {
    match fragment {
        Value::String(text) => text.clone(),
        Value::Array(_) => flatten_tool_result(fragment),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                text.clone()
            } else if let Some(nested) = map.get("content") {
                flatten_tool_result(nested)
            } else {
                fragment.to_string()
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_structured_tool_results() {
        assert_eq!(flatten_tool_result(&json!("plain")), "plain");
        assert_eq!(
            flatten_tool_result(&json!([
                {"type": "text", "text": "a.txt"},
                {"type": "text", "text": "b.txt"}
            ])),
            "a.txt\nb.txt"
        );
        assert_eq!(
            flatten_tool_result(&json!([
                {"type": "tool_result", "content": [{"type": "text", "text": "nested"}]},
                {"source": {"type": "base64"}, "type": "image"}
            ])),
            "nested\n{\"source\":{\"type\":\"base64\"},\"type\":\"image\"}"
        );
        assert_eq!(flatten_tool_result(&json!(42)), "42");
    }

    #[test]
    fn assistant_blocks_map_one_event_each() {
        let message = AgentMessage::assistant(
            "s",
            vec![
                ContentBlock::Thinking {
                    thinking: "plan".to_string(),
                },
                ContentBlock::Text {
                    text: "Listing".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "LS".to_string(),
                    input: json!({"path": "."}),
                },
                ContentBlock::Unknown,
            ],
        );
        assert_eq!(
            message_events(&message),
            vec![
                NormalizedEvent::Thinking {
                    text: "plan".to_string()
                },
                NormalizedEvent::text("Listing"),
                NormalizedEvent::ToolUse {
                    name: "LS".to_string(),
                    input: json!({"path": "."})
                },
            ]
        );
    }

    #[test]
    fn user_messages_only_contribute_tool_results() {
        let message = AgentMessage::user(
            "s",
            vec![
                ContentBlock::Text {
                    text: "echoed prompt".to_string(),
                },
                ContentBlock::ToolResult {
                    tool_use_id: "t1".to_string(),
                    content: json!(["a", "b"]),
                    is_error: None,
                },
            ],
        );
        assert_eq!(
            message_events(&message),
            vec![NormalizedEvent::ToolResult {
                content: "a\nb".to_string()
            }]
        );
    }

    #[test]
    fn compact_boundary_maps_to_compacting() {
        let message = AgentMessage::system("compact_boundary", "s");
        assert_eq!(message_events(&message), vec![NormalizedEvent::Compacting]);
        assert!(message_events(&AgentMessage::system("init", "s")).is_empty());
    }
}
