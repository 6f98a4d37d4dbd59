//! The multi-pass model/tool loop
//!
//! One run streams a model response, relays filtered text, executes the first
//! tool call of each pass against the sandbox and feeds the result back, until
//! the model stops asking for tools, the run is cancelled or a fatal error
//! occurs.

use futures::StreamExt;
use rofy_ai::{Content, Context, LlmProvider, Message, MessageEvent, Model, StreamOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{ToolCallAccumulator, short_path};
use crate::bus::SessionBus;
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent, ToolProgress};
use crate::registry::{RunHandle, RunRegistry};
use crate::relay::TextFilter;
use crate::sandbox::Sandbox;
use crate::store::{DurableStore, MemoryStore, TurnRecord};
use crate::tool::{ToolKind, ToolSet};

/// Model parameters and limits for orchestration runs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: Model,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound on model passes per run
    pub max_passes: u32,
    /// Prefix the model uses for sandbox paths
    pub root_name: String,
}

impl OrchestratorConfig {
    pub const DEFAULT_TEMPERATURE: f32 = 0.3;
    pub const DEFAULT_MAX_TOKENS: u32 = 20_000;
    pub const DEFAULT_MAX_PASSES: u32 = 64;

    pub fn new(model: Model, system_prompt: impl Into<String>) -> Self {
        Self {
            model,
            system_prompt: system_prompt.into(),
            temperature: Self::DEFAULT_TEMPERATURE,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            max_passes: Self::DEFAULT_MAX_PASSES,
            root_name: Sandbox::DEFAULT_ROOT_NAME.to_string(),
        }
    }
}

/// A request to start a run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: String,
    pub prompt: String,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The model finished without requesting another tool
    Completed { passes: u32 },
    /// Stopped externally or by caller disconnect
    Cancelled { passes: u32 },
    /// A fatal error ended the run
    Failed { message: String },
}

enum PassEnd {
    Finished,
    ToolExecuted,
    Cancelled,
}

/// Text relayed during one pass. Whitespace-only output is held back and
/// sent with the next visible text.
#[derive(Default)]
struct PassText {
    text: String,
    held: String,
}

struct RunState {
    conversation: Vec<Message>,
    transcript: String,
    passes: u32,
}

/// Drives orchestration runs; share it behind an `Arc`
pub struct Orchestrator {
    config: OrchestratorConfig,
    provider: Arc<dyn LlmProvider>,
    tools: ToolSet,
    registry: RunRegistry,
    bus: SessionBus,
    store: Arc<dyn DurableStore>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, provider: Arc<dyn LlmProvider>, tools: ToolSet) -> Self {
        Self {
            config,
            provider,
            tools,
            registry: RunRegistry::new(),
            bus: SessionBus::new(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn with_registry(mut self, registry: RunRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_bus(mut self, bus: SessionBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &SessionBus {
        &self.bus
    }

    /// Execute one run to completion.
    ///
    /// `handle` is registered under the session id; aborting it (directly or
    /// through [`RunRegistry::stop`]) cancels the run. `sink` receives every
    /// event, and all but the initial `session` event are also published on
    /// the bus.
    pub async fn run<S: EventSink<SessionEvent>>(
        &self,
        request: RunRequest,
        handle: RunHandle,
        sink: S,
    ) -> RunOutcome {
        let RunRequest { session_id, prompt } = request;
        let cancel = handle.token();

        if let Some(displaced) = self.registry.register(&session_id, handle.clone()) {
            warn!(
                session_id = %session_id,
                displaced = %displaced.id(),
                "replacing a run that is still in progress"
            );
        }
        info!(session_id = %session_id, run_id = %handle.id(), "run started");

        sink.emit(SessionEvent::session(&session_id));
        self.record_in_background(&session_id, TurnRecord::user(&prompt));

        let mut state = RunState {
            conversation: vec![Message::user(prompt)],
            transcript: String::new(),
            passes: 0,
        };

        let outcome = loop {
            if sink.is_closed() {
                handle.abort();
            }
            if handle.is_aborted() {
                break RunOutcome::Cancelled {
                    passes: state.passes,
                };
            }
            if state.passes >= self.config.max_passes {
                break self.fail(&session_id, &sink, Error::PassLimit(state.passes));
            }
            state.passes += 1;
            debug!(session_id = %session_id, pass = state.passes, "starting model pass");

            match self.run_pass(&session_id, &mut state, &sink, &cancel).await {
                Ok(PassEnd::ToolExecuted) => continue,
                Ok(PassEnd::Finished) => {
                    break RunOutcome::Completed {
                        passes: state.passes,
                    };
                }
                Ok(PassEnd::Cancelled) => {
                    break RunOutcome::Cancelled {
                        passes: state.passes,
                    };
                }
                Err(e) => break self.fail(&session_id, &sink, e),
            }
        };

        self.finalize(&session_id, &handle, state.transcript, &outcome, &sink)
            .await;
        info!(session_id = %session_id, outcome = ?outcome, "run finished");
        outcome
    }

    async fn run_pass<S: EventSink<SessionEvent>>(
        &self,
        session_id: &str,
        state: &mut RunState,
        sink: &S,
        cancel: &CancellationToken,
    ) -> Result<PassEnd> {
        let context = Context {
            system: self.config.system_prompt.clone(),
            messages: state.conversation.clone(),
            tools: self.tools.definitions(),
        };
        let options = StreamOptions::new(self.config.temperature, self.config.max_tokens);
        let pass_cancel = cancel.child_token();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PassEnd::Cancelled),
            stream = self.provider.stream(&self.config.model, &context, &options, pass_cancel.clone()) => stream?,
        };

        let mut filter = TextFilter::new();
        let mut pass_text = PassText::default();
        let mut active: Option<ToolCallAccumulator> = None;

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PassEnd::Cancelled,
                next = stream.next() => next,
            };
            let Some(event) = next else {
                break if cancel.is_cancelled() {
                    PassEnd::Cancelled
                } else {
                    PassEnd::Finished
                };
            };
            if sink.is_closed() {
                debug!(session_id = %session_id, "caller went away, cancelling run");
                cancel.cancel();
                break PassEnd::Cancelled;
            }

            match event {
                MessageEvent::TextDelta { delta, .. } => {
                    let out = filter.push(&delta);
                    self.relay_text(session_id, sink, state, &mut pass_text, out);
                }
                MessageEvent::ToolCallStart { id, name, .. } => {
                    let progress = match self.tools.kind_of(&name) {
                        ToolKind::Lookup => ToolProgress::Searching,
                        _ => ToolProgress::Start { name: name.clone() },
                    };
                    self.tee(session_id, sink, SessionEvent::ToolProgress(progress));
                    active = Some(ToolCallAccumulator::new(id, name));
                }
                MessageEvent::ToolCallDelta { delta, .. } => {
                    if let Some(acc) = active.as_mut() {
                        let verb = self.tools.kind_of(acc.name()).pending_verb();
                        for path in acc.push(&delta) {
                            let path = short_path(&path, &self.config.root_name);
                            self.tee(
                                session_id,
                                sink,
                                SessionEvent::ToolProgress(ToolProgress::FileStart { verb, path }),
                            );
                        }
                    }
                }
                MessageEvent::BlockEnd { .. } => {
                    let out = filter.finish();
                    self.relay_text(session_id, sink, state, &mut pass_text, out);
                    if let Some(acc) = active.take() {
                        pass_cancel.cancel();
                        self.execute_tool_call(session_id, sink, state, acc, &pass_text.text)
                            .await?;
                        break PassEnd::ToolExecuted;
                    }
                }
                MessageEvent::Done { .. } => break PassEnd::Finished,
                MessageEvent::Error { message } => return Err(Error::Stream(message)),
            }
        };

        if !matches!(end, PassEnd::ToolExecuted) {
            let out = filter.finish();
            self.relay_text(session_id, sink, state, &mut pass_text, out);
        }
        Ok(end)
    }

    /// Execute a finished tool call and append the assistant/tool-result turns.
    ///
    /// Tool-local failures are returned to the model as an error result; any
    /// other failure ends the run.
    async fn execute_tool_call<S: EventSink<SessionEvent>>(
        &self,
        session_id: &str,
        sink: &S,
        state: &mut RunState,
        acc: ToolCallAccumulator,
        pass_text: &str,
    ) -> Result<()> {
        let id = acc.id().to_string();
        let name = acc.name().to_string();
        let kind = self.tools.kind_of(&name);
        let parsed = acc.finish();

        let mut content = Vec::new();
        if !pass_text.trim().is_empty() {
            content.push(Content::text(pass_text));
        }
        let arguments = parsed
            .as_ref()
            .map(|call| call.arguments.clone())
            .unwrap_or_else(|_| serde_json::json!({}));
        content.push(Content::tool_call(&id, &name, arguments));
        state.conversation.push(Message::assistant(content));

        let result = match parsed {
            Ok(call) => self
                .tools
                .execute(&name, call.arguments)
                .await
                .map_err(Error::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => {
                debug!(session_id = %session_id, tool = %name, "tool call succeeded");
                match kind {
                    ToolKind::Lookup => {
                        self.tee(
                            session_id,
                            sink,
                            SessionEvent::ToolProgress(ToolProgress::SearchDone),
                        );
                    }
                    ToolKind::Create | ToolKind::Update => {
                        let verb = kind.done_verb();
                        for file in &output.files {
                            let path = short_path(file, &self.config.root_name);
                            state.transcript.push_str(&progress_fragment(&verb.to_string(), &path));
                            self.tee(
                                session_id,
                                sink,
                                SessionEvent::ToolProgress(ToolProgress::File { verb, path }),
                            );
                        }
                    }
                }
                state
                    .conversation
                    .push(Message::tool_result(&id, output.value.to_string(), false));
            }
            Err(e) if !e.is_tool_local() => return Err(e),
            Err(e) => {
                warn!(session_id = %session_id, tool = %name, error = %e, "tool call failed");
                self.tee(session_id, sink, SessionEvent::error(e.to_string(), false));
                let body = serde_json::json!({ "error": e.to_string() });
                state
                    .conversation
                    .push(Message::tool_result(&id, body.to_string(), true));
            }
        }
        Ok(())
    }

    fn relay_text<S: EventSink<SessionEvent>>(
        &self,
        session_id: &str,
        sink: &S,
        state: &mut RunState,
        pass_text: &mut PassText,
        text: String,
    ) {
        if text.trim().is_empty() {
            pass_text.held.push_str(&text);
            return;
        }
        let text = std::mem::take(&mut pass_text.held) + &text;
        state.transcript.push_str(&text);
        pass_text.text.push_str(&text);
        self.tee(session_id, sink, SessionEvent::text(text));
    }

    /// Send to the caller and to every bus listener of the session
    fn tee<S: EventSink<SessionEvent>>(&self, session_id: &str, sink: &S, event: SessionEvent) {
        self.bus.publish(session_id, &event);
        sink.emit(event);
    }

    fn fail<S: EventSink<SessionEvent>>(&self, session_id: &str, sink: &S, error: Error) -> RunOutcome {
        let message = error.to_string();
        warn!(session_id = %session_id, error = %message, "run failed");
        self.tee(session_id, sink, SessionEvent::error(&message, true));
        RunOutcome::Failed { message }
    }

    async fn finalize<S: EventSink<SessionEvent>>(
        &self,
        session_id: &str,
        handle: &RunHandle,
        transcript: String,
        outcome: &RunOutcome,
        sink: &S,
    ) {
        if !transcript.is_empty() {
            let turn = TurnRecord::assistant(transcript);
            if let Err(e) = self.store.record_turn(session_id, turn).await {
                warn!(session_id = %session_id, error = %e, "failed to persist transcript");
                self.tee(
                    session_id,
                    sink,
                    SessionEvent::notice(format!("persistence failed: {}", e)),
                );
            }
        }

        self.registry.finish(session_id, handle.id());

        if !matches!(outcome, RunOutcome::Failed { .. }) {
            self.tee(session_id, sink, SessionEvent::stopped());
        }
    }

    fn record_in_background(&self, session_id: &str, turn: TurnRecord) {
        let store = Arc::clone(&self.store);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.record_turn(&session_id, turn).await {
                warn!(session_id = %session_id, error = %e, "failed to persist turn");
            }
        });
    }
}

/// Transcript line recorded for each written file
pub fn progress_fragment(verb: &str, short_path: &str) -> String {
    format!(
        "<div class=\"text-sm flex items-center gap-2\">\n  <span class=\"text-green-600\">✓</span>\n  <span class=\"text-green-700\">\n    {} {}\n  </span>\n</div>",
        verb, short_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectSink, Verb};
    use crate::registry::RunStatus;
    use crate::testing::{Script, ScriptedProvider, done, text_pass, tool_pass};
    use crate::tools::sandbox_tools;
    use tokio::sync::mpsc;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryStore>,
        dir: tempfile::TempDir,
    }

    fn harness(scripts: Vec<Script>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(scripts);
        let store = Arc::new(MemoryStore::new());
        let tools = sandbox_tools(Arc::new(Sandbox::new(dir.path())));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::new(Model::anthropic("test-model"), "You edit apps."),
            provider.clone(),
            tools,
        )
        .with_store(store.clone());
        Harness {
            orchestrator: Arc::new(orchestrator),
            provider,
            store,
            dir,
        }
    }

    fn request(prompt: &str) -> RunRequest {
        RunRequest {
            session_id: "s1".into(),
            prompt: prompt.into(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count_stopped(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|e| **e == SessionEvent::stopped())
            .count()
    }

    #[tokio::test]
    async fn test_write_then_finish() {
        let h = harness(vec![
            Script::Events(tool_pass(
                "Writing now. ",
                "writeFiles",
                &[
                    r#"{"edits":[{"path":"myApp/client/src/App.tsx","#,
                    r#""content":"export default 1"}]}"#,
                ],
            )),
            Script::Events(text_pass("All set.")),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = h
            .orchestrator
            .run(request("make an app"), RunHandle::new(), tx)
            .await;
        assert_eq!(outcome, RunOutcome::Completed { passes: 2 });

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                SessionEvent::session("s1"),
                SessionEvent::text("Writing now. "),
                SessionEvent::ToolProgress(ToolProgress::Start {
                    name: "writeFiles".into()
                }),
                SessionEvent::ToolProgress(ToolProgress::FileStart {
                    verb: Verb::Creating,
                    path: "src/App.tsx".into()
                }),
                SessionEvent::ToolProgress(ToolProgress::File {
                    verb: Verb::Created,
                    path: "src/App.tsx".into()
                }),
                SessionEvent::text("All set."),
                SessionEvent::stopped(),
            ]
        );

        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("client/src/App.tsx")).unwrap(),
            "export default 1"
        );

        let contexts = h.provider.contexts();
        assert_eq!(contexts.len(), 2);
        let second = &contexts[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].text(), "Writing now. ");
        assert_eq!(second[1].tool_calls()[0].name, "writeFiles");
        assert_eq!(second[2].role, rofy_ai::Role::User);
        match &second[2].content[0] {
            Content::ToolResult {
                content, is_error, ..
            } => {
                assert!(!is_error);
                assert_eq!(content, r#"{"written":1}"#);
            }
            other => panic!("expected tool result, got {:?}", other),
        }

        let turns = h.store.turns("s1").await.unwrap();
        let transcript = turns
            .iter()
            .find(|t| t.role == crate::store::Role::Assistant)
            .unwrap();
        assert!(transcript.message.starts_with("Writing now. "));
        assert!(transcript.message.contains("Created src/App.tsx"));
        assert!(transcript.message.ends_with("All set."));
        assert_eq!(h.orchestrator.registry().status("s1"), Some(RunStatus::Stopped));
    }

    #[tokio::test]
    async fn test_search_progress() {
        let h = harness(vec![Script::Events(tool_pass(
            "",
            "searchFiles",
            &[r#"{"query":"*"}"#],
        ))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = h.orchestrator.run(request("look"), RunHandle::new(), tx).await;
        assert_eq!(outcome, RunOutcome::Completed { passes: 2 });

        let events = drain(&mut rx);
        assert_eq!(events[1], SessionEvent::ToolProgress(ToolProgress::Searching));
        assert_eq!(events[2], SessionEvent::ToolProgress(ToolProgress::SearchDone));
        assert_eq!(events[3], SessionEvent::text("done"));
    }

    #[tokio::test]
    async fn test_tool_failure_is_fed_back() {
        let h = harness(vec![
            Script::Events(tool_pass(
                "",
                "writePatches",
                &[r#"{"patches":[{"path":"myApp/client/src/none.ts","find":"a","replace":"b"}]}"#],
            )),
            Script::Events(text_pass("Sorry.")),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = h.orchestrator.run(request("patch"), RunHandle::new(), tx).await;
        assert_eq!(outcome, RunOutcome::Completed { passes: 2 });

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Error { fatal: false, message } if message.contains("File not found")
        )));
        assert_eq!(count_stopped(&events), 1);

        let second = &h.provider.contexts()[1].messages;
        match &second[2].content[0] {
            Content::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert!(content.contains("File not found"));
            }
            other => panic!("expected tool result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_fed_back() {
        let h = harness(vec![
            Script::Events(tool_pass("", "writeFiles", &[r#"{"edits":[{"path":"#])),
            Script::Events(text_pass("Retrying.")),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = h.orchestrator.run(request("write"), RunHandle::new(), tx).await;
        assert_eq!(outcome, RunOutcome::Completed { passes: 2 });

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Error { fatal: false, message } if message.contains("Malformed arguments")
        )));
        let second = &h.provider.contexts()[1].messages;
        assert_eq!(second[1].tool_calls()[0].arguments, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_provider_failure_is_fatal() {
        let h = harness(vec![Script::Fail("busy".into())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = h.orchestrator.run(request("x"), RunHandle::new(), tx).await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], SessionEvent::Error { fatal: true, .. }));
        assert_eq!(count_stopped(&events), 0);
    }

    #[tokio::test]
    async fn test_stream_error_event_is_fatal() {
        let h = harness(vec![Script::Events(vec![
            MessageEvent::Error {
                message: "overloaded".into(),
            },
        ])]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = h.orchestrator.run(request("x"), RunHandle::new(), tx).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                message: "Model stream failed: overloaded".into()
            }
        );
        assert_eq!(count_stopped(&drain(&mut rx)), 0);
    }

    #[tokio::test]
    async fn test_pass_limit() {
        let h = harness(vec![Script::Events(tool_pass(
            "",
            "searchFiles",
            &[r#"{"query":"*"}"#],
        ))]);
        let mut config = h.orchestrator.config().clone();
        config.max_passes = 1;
        let orchestrator = Orchestrator::new(
            config,
            h.provider.clone(),
            sandbox_tools(Arc::new(Sandbox::new(h.dir.path()))),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = orchestrator.run(request("x"), RunHandle::new(), tx).await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(SessionEvent::Error { fatal: true, .. })));
    }

    #[tokio::test]
    async fn test_stop_cancels_run_once() {
        let h = harness(vec![Script::Hang(vec![
            MessageEvent::TextDelta {
                index: 0,
                delta: "thinking".into(),
            },
        ])]);
        let (listener, mut bus_rx) = h.orchestrator.bus().subscribe_channel("s1");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let orchestrator = Arc::clone(&h.orchestrator);
        let task = tokio::spawn(async move {
            orchestrator.run(request("x"), RunHandle::new(), tx).await
        });

        assert_eq!(rx.recv().await.unwrap(), SessionEvent::session("s1"));
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::text("thinking"));

        h.orchestrator.registry().stop("s1").unwrap();
        h.orchestrator.registry().stop("s1").unwrap();
        let outcome = task.await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled { passes: 1 });

        let rest = drain(&mut rx);
        assert_eq!(rest, vec![SessionEvent::stopped()]);

        let seen_by_listener = drain(&mut bus_rx);
        assert_eq!(
            seen_by_listener,
            vec![SessionEvent::text("thinking"), SessionEvent::stopped()]
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_hypothesis_never_relayed() {
        let h = harness(vec![Script::Events(text_pass(
            "Done<rofy-hypothesis>maybe the router</rofy-hypothesis>!SEARCH_UI",
        ))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.orchestrator.run(request("x"), RunHandle::new(), tx).await;

        let text: String = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Assistant { delta } => Some(delta.text),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Done!");
    }

    #[tokio::test]
    async fn test_whitespace_joins_next_text() {
        let delta = |text: &str| MessageEvent::TextDelta {
            index: 0,
            delta: text.into(),
        };
        let h = harness(vec![Script::Events(vec![
            delta("Hello"),
            delta(" "),
            delta("\n"),
            delta("world"),
            delta("  "),
            MessageEvent::BlockEnd { index: 0 },
            done(),
        ])]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.orchestrator.run(request("x"), RunHandle::new(), tx).await;

        let deltas: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Assistant { delta } => Some(delta.text),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hello".to_string(), " \nworld".to_string()]);
    }

    /// Reports closed once it has received `capacity` events
    struct ClosingSink {
        capacity: usize,
        seen: CollectSink<SessionEvent>,
    }

    impl EventSink<SessionEvent> for ClosingSink {
        fn emit(&self, event: SessionEvent) {
            self.seen.emit(event);
        }

        fn is_closed(&self) -> bool {
            self.seen.events().len() >= self.capacity
        }
    }

    #[tokio::test]
    async fn test_closed_sink_cancels_run() {
        let h = harness(vec![]);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = RunHandle::new();
        let outcome = h.orchestrator.run(request("x"), handle.clone(), tx).await;

        assert_eq!(outcome, RunOutcome::Cancelled { passes: 0 });
        assert!(handle.is_aborted());
        assert!(h.provider.contexts().is_empty());
    }

    #[tokio::test]
    async fn test_sink_closing_mid_pass_cancels_run() {
        let h = harness(vec![Script::Events(vec![
            MessageEvent::TextDelta {
                index: 0,
                delta: "first".into(),
            },
            MessageEvent::TextDelta {
                index: 0,
                delta: "second".into(),
            },
            MessageEvent::BlockEnd { index: 0 },
            done(),
        ])]);
        let seen = CollectSink::new();
        let sink = ClosingSink {
            capacity: 2,
            seen: seen.clone(),
        };
        let handle = RunHandle::new();
        let outcome = h.orchestrator.run(request("x"), handle.clone(), sink).await;

        assert_eq!(outcome, RunOutcome::Cancelled { passes: 1 });
        assert!(handle.is_aborted());
        let events = seen.events();
        assert_eq!(events[..2], [SessionEvent::session("s1"), SessionEvent::text("first")]);
        assert!(!events.contains(&SessionEvent::text("second")));
    }

    #[test]
    fn test_progress_fragment() {
        let fragment = progress_fragment("Updated", "src/App.tsx");
        assert!(fragment.starts_with("<div class=\"text-sm flex items-center gap-2\">"));
        assert!(fragment.contains("✓"));
        assert!(fragment.contains("Updated src/App.tsx"));
    }
}
