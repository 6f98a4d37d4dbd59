//! Model backends

pub mod anthropic;

use crate::{Context, MessageEventStream, Model, Result, StreamOptions};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A streaming chat-completion backend.
///
/// Failing to open the request is an `Err`; failures after that arrive as a
/// terminal [`crate::MessageEvent::Error`]. Once `cancel` fires the stream
/// ends without a terminal event and the connection is dropped.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> Result<MessageEventStream>;
}
