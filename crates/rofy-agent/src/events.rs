//! Session event types and the sink trait

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// File operation verb shown in progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Creating,
    Updating,
    Created,
    Updated,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verb::Creating => "Creating",
            Verb::Updating => "Updating",
            Verb::Created => "Created",
            Verb::Updated => "Updated",
        };
        f.write_str(s)
    }
}

/// Tool progress payload, tagged by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ToolProgress {
    /// A lookup tool started
    Searching,
    /// An editing tool started
    Start { name: String },
    /// A target path was seen in the streaming arguments
    FileStart { verb: Verb, path: String },
    /// A file was written
    File { verb: Verb, path: String },
    /// A lookup tool finished
    SearchDone,
}

/// Incremental assistant text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDelta {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl TextDelta {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            kind: "text_delta".to_string(),
            text: text.into(),
        }
    }
}

/// Events delivered to the caller of a run and to live listeners.
///
/// Serializes as `{"event": <name>, "data": <payload>}`, the frame shape used
/// on WebSocket connections; SSE uses [`name`](Self::name) and
/// [`data`](Self::data) separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Assistant {
        delta: TextDelta,
    },
    ToolProgress(ToolProgress),
    Notice {
        message: String,
    },
    Error {
        message: String,
        fatal: bool,
    },
    Ping {},
    Log {
        level: String,
        message: String,
        stack: Option<String>,
        ts: i64,
    },
}

impl SessionEvent {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::Session {
            session_id: session_id.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Assistant {
            delta: TextDelta::new(text),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Self::Error {
            message: message.into(),
            fatal,
        }
    }

    /// The notice that ends every run that was not failed
    pub fn stopped() -> Self {
        Self::notice("stopped")
    }

    /// An error-level log line from the running app
    pub fn log_error(message: impl Into<String>) -> Self {
        Self::Log {
            level: "error".to_string(),
            message: message.into(),
            stack: None,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Wire event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::Assistant { .. } => "assistant",
            Self::ToolProgress(_) => "tool_progress",
            Self::Notice { .. } => "notice",
            Self::Error { .. } => "error",
            Self::Ping {} => "ping",
            Self::Log { .. } => "log",
        }
    }

    /// Wire payload
    pub fn data(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => map
                .remove("data")
                .unwrap_or_else(|| serde_json::json!({})),
            _ => serde_json::json!({}),
        }
    }
}

/// Destination for events produced by a run
pub trait EventSink<E>: Send + Sync {
    fn emit(&self, event: E);

    /// Whether the receiving side has gone away
    fn is_closed(&self) -> bool {
        false
    }
}

impl<E: Send> EventSink<E> for mpsc::UnboundedSender<E> {
    fn emit(&self, event: E) {
        let _ = self.send(event);
    }

    fn is_closed(&self) -> bool {
        mpsc::UnboundedSender::is_closed(self)
    }
}

/// Sink that keeps every event, for callers that only want the outcome
#[derive(Debug, Clone)]
pub struct CollectSink<E> {
    events: Arc<Mutex<Vec<E>>>,
}

impl<E> Default for CollectSink<E> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> CollectSink<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().clone()
    }
}

impl<E: Send> EventSink<E> for CollectSink<E> {
    fn emit(&self, event: E) {
        self.events.lock().push(event);
    }
}
