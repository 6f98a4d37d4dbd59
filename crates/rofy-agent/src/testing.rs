//! Scripted provider and event builders shared by the unit tests

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rofy_ai::{
    Context, LlmProvider, MessageEvent, MessageEventStream, Model, StopReason, StreamOptions,
    Usage,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What the provider does for one `stream` call
pub(crate) enum Script {
    Events(Vec<MessageEvent>),
    Hang(Vec<MessageEvent>),
    Fail(String),
}

#[derive(Default)]
pub(crate) struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    contexts: Mutex<Vec<Context>>,
}

impl ScriptedProvider {
    pub(crate) fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn contexts(&self) -> Vec<Context> {
        self.contexts.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn stream(
        &self,
        _model: &Model,
        context: &Context,
        _options: &StreamOptions,
        _cancel: CancellationToken,
    ) -> rofy_ai::Result<MessageEventStream> {
        self.contexts.lock().push(context.clone());
        let script = self.scripts.lock().pop_front();
        match script {
            Some(Script::Events(events)) => Ok(Box::pin(futures::stream::iter(events))),
            Some(Script::Hang(events)) => Ok(Box::pin(
                futures::stream::iter(events).chain(futures::stream::pending()),
            )),
            Some(Script::Fail(message)) => Err(rofy_ai::Error::Status {
                status: 529,
                kind: "overloaded_error".into(),
                message,
                retry_after: None,
            }),
            None => Ok(Box::pin(futures::stream::iter(text_pass("done")))),
        }
    }
}

pub(crate) fn done() -> MessageEvent {
    MessageEvent::Done {
        stop_reason: StopReason::EndTurn,
        usage: Usage::default(),
    }
}

pub(crate) fn text_events(index: usize, text: &str) -> Vec<MessageEvent> {
    vec![
        MessageEvent::TextDelta {
            index,
            delta: text.to_string(),
        },
        MessageEvent::BlockEnd { index },
    ]
}

pub(crate) fn text_pass(text: &str) -> Vec<MessageEvent> {
    let mut events = text_events(0, text);
    events.push(done());
    events
}

pub(crate) fn tool_pass(preamble: &str, name: &str, chunks: &[&str]) -> Vec<MessageEvent> {
    let mut events = Vec::new();
    let mut index = 0;
    if !preamble.is_empty() {
        events.extend(text_events(0, preamble));
        index = 1;
    }
    events.push(MessageEvent::ToolCallStart {
        index,
        id: "toolu_1".into(),
        name: name.into(),
    });
    events.extend(chunks.iter().map(|chunk| MessageEvent::ToolCallDelta {
        index,
        delta: chunk.to_string(),
    }));
    events.push(MessageEvent::BlockEnd { index });
    events.push(done());
    events
}
