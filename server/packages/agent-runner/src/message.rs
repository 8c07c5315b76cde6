use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of agent output.
///
/// The shape follows the stream-json records the `claude` CLI prints, which is
/// also what it appends to its on-disk session logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

impl AgentMessage {
    fn new(kind: &str, session_id: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            subtype: None,
            session_id: session_id.map(ToOwned::to_owned),
            message: None,
            is_error: None,
            result: None,
        }
    }

    pub fn system(subtype: &str, session_id: &str) -> Self {
        let mut message = Self::new("system", Some(session_id));
        message.subtype = Some(subtype.to_string());
        message
    }

    pub fn assistant(session_id: &str, blocks: Vec<ContentBlock>) -> Self {
        let mut message = Self::new("assistant", Some(session_id));
        message.message = Some(MessageBody {
            role: Some("assistant".to_string()),
            content: MessageContent::Blocks(blocks),
            stop_reason: None,
        });
        message
    }

    pub fn user(session_id: &str, blocks: Vec<ContentBlock>) -> Self {
        let mut message = Self::new("user", Some(session_id));
        message.message = Some(MessageBody {
            role: Some("user".to_string()),
            content: MessageContent::Blocks(blocks),
            stop_reason: None,
        });
        message
    }

    pub fn result(session_id: &str, subtype: &str, is_error: bool, result: Option<String>) -> Self {
        let mut message = Self::new("result", Some(session_id));
        message.subtype = Some(subtype.to_string());
        message.is_error = Some(is_error);
        message.result = result;
        message
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self.message.as_ref().map(|body| &body.content) {
            Some(MessageContent::Blocks(blocks)) => blocks,
            _ => &[],
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.kind == "assistant"
    }

    pub fn is_user(&self) -> bool {
        self.kind == "user"
    }

    pub fn is_result(&self) -> bool {
        self.kind == "result"
    }

    pub fn is_compact_boundary(&self) -> bool {
        self.kind == "system" && self.subtype.as_deref() == Some("compact_boundary")
    }

    /// Failure text for a `result` line that reports an unsuccessful run.
    /// Hitting the turn limit ends the run normally.
    pub fn result_error(&self) -> Option<String> {
        if !self.is_result() || !self.is_error.unwrap_or(false) {
            return None;
        }
        if self.subtype.as_deref() == Some("error_max_turns") {
            return None;
        }
        Some(
            self.result
                .clone()
                .or_else(|| self.subtype.clone())
                .unwrap_or_else(|| "agent reported an error".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_assistant_line_with_mixed_blocks() {
        let line = json!({
            "type": "assistant",
            "session_id": "s-1",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "hmm", "signature": "x"},
                    {"type": "text", "text": "Listing"},
                    {"type": "tool_use", "id": "t1", "name": "LS", "input": {"path": "."}},
                    {"type": "server_tool_use", "id": "t2"}
                ]
            }
        });
        let message: AgentMessage = serde_json::from_value(line).expect("parse");
        assert_eq!(message.session_id.as_deref(), Some("s-1"));
        assert_eq!(
            message.blocks(),
            &[
                ContentBlock::Thinking {
                    thinking: "hmm".to_string()
                },
                ContentBlock::Text {
                    text: "Listing".to_string()
                },
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "LS".to_string(),
                    input: json!({"path": "."}),
                },
                ContentBlock::Unknown,
            ]
        );
    }

    #[test]
    fn user_string_content_has_no_blocks() {
        let line = json!({
            "type": "user",
            "message": {"role": "user", "content": "hello"}
        });
        let message: AgentMessage = serde_json::from_value(line).expect("parse");
        assert!(message.blocks().is_empty());
        assert!(message.session_id.is_none());
    }

    #[test]
    fn max_turns_result_is_not_an_error() {
        let message = AgentMessage::result("s", "error_max_turns", true, None);
        assert_eq!(message.result_error(), None);
        let failed = AgentMessage::result("s", "error_during_execution", true, None);
        assert_eq!(failed.result_error().as_deref(), Some("error_during_execution"));
    }
}
