//! Anthropic Messages API provider

use crate::{
    error::{Error, ErrorDetail, Result},
    providers::LlmProvider,
    retry::RetryConfig,
    stream::{MessageEvent, MessageEventStream},
    types::{Content, Context, Message, Model, Role, StopReason, StreamOptions, Tool, Usage},
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    retry: RetryConfig,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key).map_err(|_| Error::InvalidApiKey)?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        Ok(headers)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> Result<MessageEventStream> {
        let body = serde_json::to_value(request_body(model, context, options))?;
        let headers = self.headers()?;
        let url = format!("{}/v1/messages", model.base_url.trim_end_matches('/'));
        debug!(url = %url, model = %model.id, messages = context.messages.len(), "opening stream");

        let client = self.client.clone();
        let open = move || client.post(&url).headers(headers.clone()).json(&body);
        Ok(Box::pin(event_stream(open, self.retry.clone(), cancel)))
    }
}

/// Reconnects on retryable failures as long as no content block has started;
/// after that a failure becomes the terminal `Error` event.
fn event_stream<F>(
    open: F,
    retry: RetryConfig,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = MessageEvent>
where
    F: Fn() -> reqwest::RequestBuilder + Send + 'static,
{
    stream! {
        let mut decoder = SseDecoder::default();
        let mut attempt = 0u32;

        'connect: while !decoder.is_finished() {
            let mut source = match EventSource::new(open()) {
                Ok(source) => source,
                Err(e) => {
                    decoder.fail(format!("Failed to open stream: {e}"));
                    break;
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = source.next() => Some(next),
                };
                let Some(next) = next else {
                    source.close();
                    debug!("stream cancelled");
                    return;
                };

                let error = match next {
                    None => break 'connect,
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(frame))) => {
                        for event in decoder.handle(&frame.data) {
                            yield event;
                        }
                        if decoder.is_finished() {
                            source.close();
                            break 'connect;
                        }
                        continue;
                    }
                    Some(Err(e)) => {
                        source.close();
                        classify(e).await
                    }
                };

                let delay = if decoder.has_output() { None } else { retry.delay(attempt, &error) };
                let Some(delay) = delay else {
                    decoder.fail(error.to_string());
                    break 'connect;
                };
                attempt += 1;
                warn!(attempt, error = %error, delay = ?delay, "stream request failed, retrying");
                let cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if cancelled {
                    return;
                }
                continue 'connect;
            }
        }

        yield decoder.finish();
    }
}

async fn classify(err: reqwest_eventsource::Error) -> Error {
    match err {
        reqwest_eventsource::Error::Transport(e) => Error::Http(e),
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let body = response.text().await.unwrap_or_default();
            Error::from_status(status.as_u16(), retry_after, &body)
        }
        other => Error::Sse(other.to_string()),
    }
}

// Wire events, dispatched on the `type` field of each frame's data

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: WireBlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorDetail,
    },
}

#[derive(Debug, Deserialize)]
struct WireMessageStart {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<StopReason>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

/// Turns the data of each SSE frame into [`MessageEvent`]s.
///
/// Blocks of kinds other than text and tool use are skipped along with their
/// deltas.
#[derive(Debug, Default)]
pub struct SseDecoder {
    open: BTreeSet<usize>,
    started: bool,
    usage: Usage,
    stop_reason: Option<StopReason>,
    error: Option<String>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `message_stop` or an error has been seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// A content block has started, so the request can no longer be replayed
    pub fn has_output(&self) -> bool {
        self.started
    }

    pub fn fail(&mut self, message: String) {
        self.error = Some(message);
        self.finished = true;
    }

    pub fn handle(&mut self, data: &str) -> Vec<MessageEvent> {
        let event = match serde_json::from_str::<WireEvent>(data) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "skipping unrecognised stream frame");
                return vec![];
            }
        };

        match event {
            WireEvent::MessageStart { message } => {
                self.add_usage(message.usage);
                vec![]
            }
            WireEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                WireBlockStart::Text { text } => {
                    self.open_block(index);
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![MessageEvent::TextDelta { index, delta: text }]
                    }
                }
                WireBlockStart::ToolUse { id, name } => {
                    self.open_block(index);
                    vec![MessageEvent::ToolCallStart { index, id, name }]
                }
                WireBlockStart::Other => vec![],
            },
            WireEvent::ContentBlockDelta { index, delta } if self.open.contains(&index) => {
                match delta {
                    WireDelta::TextDelta { text } => vec![MessageEvent::TextDelta { index, delta: text }],
                    WireDelta::InputJsonDelta { partial_json } => vec![MessageEvent::ToolCallDelta {
                        index,
                        delta: partial_json,
                    }],
                    WireDelta::Other => vec![],
                }
            }
            WireEvent::ContentBlockStop { index } if self.open.remove(&index) => {
                vec![MessageEvent::BlockEnd { index }]
            }
            WireEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                self.add_usage(usage);
                vec![]
            }
            WireEvent::MessageStop => {
                self.finished = true;
                vec![]
            }
            WireEvent::Error { error } => {
                self.fail(error.message);
                vec![]
            }
            _ => vec![],
        }
    }

    /// The terminal event
    pub fn finish(self) -> MessageEvent {
        match self.error {
            Some(message) => MessageEvent::Error { message },
            None => MessageEvent::Done {
                stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                usage: self.usage,
            },
        }
    }

    fn open_block(&mut self, index: usize) {
        self.open.insert(index);
        self.started = true;
    }

    fn add_usage(&mut self, usage: Option<WireUsage>) {
        let usage = usage.unwrap_or_default();
        if let Some(input) = usage.input_tokens {
            self.usage.input_tokens = input;
        }
        if let Some(output) = usage.output_tokens {
            self.usage.output_tokens = output;
        }
    }
}

// Request body

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: Vec<WireBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock<'a> {
    Text {
        text: &'a str,
    },
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: &'a str,
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: serde_json::Value,
}

fn request_body<'a>(model: &'a Model, context: &'a Context, options: &StreamOptions) -> RequestBody<'a> {
    RequestBody {
        model: &model.id,
        max_tokens: options.max_tokens,
        temperature: options.temperature,
        stream: true,
        system: Some(context.system.as_str()).filter(|s| !s.is_empty()),
        messages: wire_messages(&context.messages),
        tools: context.tools.iter().map(wire_tool).collect(),
    }
}

/// Blank text blocks are rejected by the API, and so are turns left empty
/// once they are dropped.
fn wire_messages(messages: &[Message]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .filter_map(|message| {
            let content: Vec<WireBlock<'_>> = message
                .content
                .iter()
                .filter_map(|block| match block {
                    Content::Text { text } if text.trim().is_empty() => None,
                    Content::Text { text } => Some(WireBlock::Text { text }),
                    Content::ToolCall(call) => Some(WireBlock::ToolUse {
                        id: &call.id,
                        name: &call.name,
                        input: if call.arguments.is_object() {
                            call.arguments.clone()
                        } else {
                            serde_json::json!({})
                        },
                    }),
                    Content::ToolResult {
                        tool_call_id,
                        content,
                        is_error,
                    } => Some(WireBlock::ToolResult {
                        tool_use_id: tool_call_id,
                        content,
                        is_error: *is_error,
                    }),
                })
                .collect();
            (!content.is_empty()).then_some(WireMessage {
                role: message.role,
                content,
            })
        })
        .collect()
}

fn wire_tool(tool: &Tool) -> WireTool<'_> {
    let mut input_schema = match &tool.parameters {
        serde_json::Value::Object(_) => tool.parameters.clone(),
        _ => serde_json::json!({ "properties": {} }),
    };
    if let Some(schema) = input_schema.as_object_mut() {
        schema.entry("type").or_insert_with(|| serde_json::json!("object"));
    }
    WireTool {
        name: &tool.name,
        description: &tool.description,
        input_schema,
    }
}
