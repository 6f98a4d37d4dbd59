//! Conversation types shared by providers and callers

use serde::{Deserialize, Serialize};

/// Where a model is served from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// e.g. "claude-sonnet-4-20250514"
    pub id: String,
    pub base_url: String,
}

impl Model {
    pub fn anthropic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Token counts reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// Why the model stopped generating. Names follow the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One block of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    ToolCall(ToolCall),
    /// Output of a tool, carried back in a user turn
    ToolResult {
        tool_call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::ToolCall(ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Content>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Content::text(text)],
        }
    }

    pub fn assistant(content: Vec<Content>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// A user turn answering the tool call `tool_call_id`
    pub fn tool_result(tool_call_id: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::User,
            content: vec![Content::ToolResult {
                tool_call_id: tool_call_id.into(),
                content: output.into(),
                is_error,
            }],
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text blocks
    pub fn text(&self) -> String {
        self.content.iter().filter_map(Content::as_text).collect()
    }
}

/// A function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: serde_json::Value,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Everything a provider needs for one request
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
}

/// Sampling parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl StreamOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_is_user_turn() {
        let msg = Message::tool_result("toolu_1", r#"{"error":"File not found"}"#, true);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_call_id"], "toolu_1");
        assert_eq!(json["content"][0]["is_error"], true);
    }

    #[test]
    fn test_tool_calls_and_text() {
        let msg = Message::assistant(vec![
            Content::text("working "),
            Content::tool_call("toolu_9", "writeFiles", serde_json::json!({"edits": []})),
            Content::text("on it"),
        ]);
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "writeFiles");
        assert_eq!(msg.text(), "working on it");

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][1]["type"], "tool_call");
        assert_eq!(json["content"][1]["id"], "toolu_9");
    }

    #[test]
    fn test_unknown_stop_reason() {
        let reason: StopReason = serde_json::from_str(r#""pause_turn""#).unwrap();
        assert_eq!(reason, StopReason::Other);
        let reason: StopReason = serde_json::from_str(r#""max_tokens""#).unwrap();
        assert_eq!(reason, StopReason::MaxTokens);
    }
}
