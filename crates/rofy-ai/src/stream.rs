//! Provider-neutral streaming events and the assistant message accumulator

use crate::types::{Content, Message, StopReason, Usage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use tokio_stream::Stream;

/// One increment of a streamed assistant turn.
///
/// `index` identifies the content block a delta belongs to. A stream ends with
/// exactly one `Done` or `Error`, unless it was cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    TextDelta {
        index: usize,
        delta: String,
    },
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    /// A fragment of the tool call's JSON arguments
    ToolCallDelta {
        index: usize,
        delta: String,
    },
    /// The block at `index` is complete
    BlockEnd {
        index: usize,
    },
    Done {
        stop_reason: StopReason,
        usage: Usage,
    },
    Error {
        message: String,
    },
}

pub type MessageEventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

#[derive(Debug)]
enum Block {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        json: String,
    },
}

/// Folds [`MessageEvent`]s into the assistant [`Message`] they describe
#[derive(Debug, Default)]
pub struct MessageBuilder {
    blocks: BTreeMap<usize, Block>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_event(&mut self, event: &MessageEvent) {
        match event {
            MessageEvent::TextDelta { index, delta } => {
                let block = self
                    .blocks
                    .entry(*index)
                    .or_insert_with(|| Block::Text(String::new()));
                if let Block::Text(text) = block {
                    text.push_str(delta);
                }
            }
            MessageEvent::ToolCallStart { index, id, name } => {
                self.blocks.insert(
                    *index,
                    Block::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        json: String::new(),
                    },
                );
            }
            MessageEvent::ToolCallDelta { index, delta } => {
                if let Some(Block::ToolCall { json, .. }) = self.blocks.get_mut(index) {
                    json.push_str(delta);
                }
            }
            _ => {}
        }
    }

    pub fn has_tool_call(&self) -> bool {
        self.blocks
            .values()
            .any(|b| matches!(b, Block::ToolCall { .. }))
    }

    /// Blocks in index order. Arguments that are not valid JSON become `Null`;
    /// an empty argument string is an empty object.
    pub fn build(self) -> Message {
        let content = self
            .blocks
            .into_values()
            .map(|block| match block {
                Block::Text(text) => Content::Text { text },
                Block::ToolCall { id, name, json } => {
                    let arguments = if json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&json).unwrap_or(serde_json::Value::Null)
                    };
                    Content::tool_call(id, name, arguments)
                }
            })
            .collect();
        Message::assistant(content)
    }
}
