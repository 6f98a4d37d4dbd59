//! Streaming access to Anthropic models.
//!
//! [`LlmProvider`] turns a [`Context`] into a stream of [`MessageEvent`]s;
//! [`MessageBuilder`] folds them back into the assistant [`Message`].

pub mod error;
pub mod providers;
pub mod retry;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use providers::LlmProvider;
pub use retry::RetryConfig;
pub use stream::{MessageBuilder, MessageEvent, MessageEventStream};
pub use types::{Content, Context, Message, Model, Role, StopReason, StreamOptions, Tool, ToolCall, Usage};
