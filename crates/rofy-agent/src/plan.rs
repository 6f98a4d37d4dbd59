//! The structured planning turn
//!
//! Given a chat's initial prompt, the planner asks the model for an app plan
//! through the `emit_app_plan` tool. A model that declines to plan answers in
//! text instead: either a NON_INTENT / POLICY_BLOCK JSON object or free-form
//! suggestions.

use futures::StreamExt;
use regex::Regex;
use rofy_ai::{Context, LlmProvider, Message, MessageBuilder, MessageEvent, Model, StreamOptions};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, StoreError};
use crate::events::EventSink;
use crate::store::{AppSummary, ChatRecord, DurableStore, PlanMessage, PlanMessageKind, Role};

/// Name of the plan tool
pub const EMIT_APP_PLAN: &str = "emit_app_plan";

const MAX_LATER_FEATURES: usize = 4;

static TRAILING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*`{3,}\s*$").expect("fence pattern compiles"));
static LEADING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*```json\s*").expect("fence pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanIntent {
    AppIntent,
    NonIntent,
    PolicyBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPlan {
    pub summary: String,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignLanguage {
    pub summary: String,
    pub styles: Vec<String>,
}

/// A structured app plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPlan {
    pub intent: PlanIntent,
    pub app_name: String,
    pub description: String,
    pub icon: String,
    pub initial_version: VersionPlan,
    pub later_version: VersionPlan,
    pub design_language: DesignLanguage,
}

impl AppPlan {
    pub fn validate(&self) -> Result<()> {
        if self.intent != PlanIntent::AppIntent {
            return Err(Error::InvalidPlan(format!(
                "plan intent must be APP_INTENT, got {:?}",
                self.intent
            )));
        }
        if self.initial_version.features.is_empty() {
            return Err(Error::InvalidPlan(
                "initialVersion needs at least one feature".into(),
            ));
        }
        if self.later_version.features.len() > MAX_LATER_FEATURES {
            return Err(Error::InvalidPlan(format!(
                "laterVersion allows at most {} features, got {}",
                MAX_LATER_FEATURES,
                self.later_version.features.len()
            )));
        }
        if self.design_language.styles.is_empty() {
            return Err(Error::InvalidPlan(
                "designLanguage needs at least one style".into(),
            ));
        }
        Ok(())
    }

    /// Chat summary fields derived from the plan
    pub fn summary(&self) -> AppSummary {
        AppSummary {
            app_name: Some(self.app_name.clone()),
            app_description: Some(self.description.clone()),
            app_icon: Some(self.icon.clone()),
            app_initial_version: serde_json::to_string(&self.initial_version).ok(),
            app_later_version: serde_json::to_string(&self.later_version).ok(),
            app_design_language: serde_json::to_string(&self.design_language).ok(),
        }
    }
}

fn version_schema(min_items: u32, max_items: Option<u32>, items_key: &str) -> serde_json::Value {
    let mut list = json!({ "type": "array", "minItems": min_items, "items": { "type": "string" } });
    if let Some(max) = max_items {
        list["maxItems"] = json!(max);
    }
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "summary": { "type": "string" },
            items_key: list
        },
        "required": ["summary", items_key]
    })
}

/// JSON schema of the `emit_app_plan` tool input
pub fn emit_app_plan_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "intent": {
                "type": "string",
                "enum": ["APP_INTENT"],
                "description": "Always 'APP_INTENT' for successful plan outputs."
            },
            "appName": { "type": "string" },
            "description": {
                "type": "string",
                "description": "1-2 sentence summary. For edits, include a compact change summary: +Feature, -Feature, ~Feature."
            },
            "icon": {
                "type": "string",
                "description": "React Icons component name (e.g. FiShoppingBag, MdOutlineTaskAlt)."
            },
            "initialVersion": version_schema(1, None, "features"),
            "laterVersion": version_schema(0, Some(MAX_LATER_FEATURES as u32), "features"),
            "designLanguage": version_schema(1, None, "styles")
        },
        "required": [
            "intent",
            "appName",
            "description",
            "icon",
            "initialVersion",
            "laterVersion",
            "designLanguage"
        ]
    })
}

pub fn emit_app_plan_tool() -> rofy_ai::Tool {
    rofy_ai::Tool::new(
        EMIT_APP_PLAN,
        "Return the final (new or edited) app plan as a single JSON object matching the required schema.",
        emit_app_plan_schema(),
    )
}

/// Events streamed to a plan requester, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    JsonDelta { delta: String },
    SuggestionsDelta { delta: String },
    NonIntent { payload: serde_json::Value },
    PolicyBlock { payload: serde_json::Value },
    Suggestions { text: String },
    Error { message: String },
    Done,
}

/// What a planning turn produced
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Plan(AppPlan),
    NonIntent(serde_json::Value),
    PolicyBlock(serde_json::Value),
    Suggestions(String),
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub model: Model,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl PlannerConfig {
    pub const DEFAULT_TEMPERATURE: f32 = 0.3;
    pub const DEFAULT_MAX_TOKENS: u32 = 4000;

    pub fn new(model: Model, system_prompt: impl Into<String>) -> Self {
        Self {
            model,
            system_prompt: system_prompt.into(),
            temperature: Self::DEFAULT_TEMPERATURE,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
        }
    }
}

/// Runs planning turns against the durable store
pub struct Planner {
    config: PlannerConfig,
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn DurableStore>,
    validator: Option<jsonschema::Validator>,
}

impl Planner {
    pub fn new(
        config: PlannerConfig,
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        let validator = match jsonschema::validator_for(&emit_app_plan_schema()) {
            Ok(validator) => Some(validator),
            Err(e) => {
                warn!("Invalid plan schema, skipping validation: {}", e);
                None
            }
        };
        Self {
            config,
            provider,
            store,
            validator,
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Run one planning turn for a chat.
    ///
    /// Every outcome ends the event sequence with `done`; failures emit a
    /// single `error` instead.
    pub async fn run<S: EventSink<PlanEvent>>(
        &self,
        chat_id: &str,
        sink: &S,
        cancel: CancellationToken,
    ) -> Result<PlanOutcome> {
        match self.plan(chat_id, sink, cancel).await {
            Ok(outcome) => {
                info!(chat_id = %chat_id, "planning turn finished");
                sink.emit(PlanEvent::Done);
                Ok(outcome)
            }
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "planning turn failed");
                let message = match &e {
                    Error::Store(StoreError::ChatNotFound(_)) => "Chat not found.".to_string(),
                    other => other.to_string(),
                };
                sink.emit(PlanEvent::Error { message });
                Err(e)
            }
        }
    }

    async fn plan<S: EventSink<PlanEvent>>(
        &self,
        chat_id: &str,
        sink: &S,
        cancel: CancellationToken,
    ) -> Result<PlanOutcome> {
        let chat = self
            .store
            .chat(chat_id)
            .await?
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
        let history = self.store.plan_messages(chat_id).await?;
        let current = latest_plan(&history);

        let context = Context {
            system: compose_system_prompt(&self.config.system_prompt, current.as_ref()),
            messages: vec![Message::user(chat.initial_prompt.clone())],
            tools: vec![emit_app_plan_tool()],
        };
        let options = StreamOptions::new(self.config.temperature, self.config.max_tokens);
        let mut stream = self
            .provider
            .stream(&self.config.model, &context, &options, cancel.clone())
            .await?;

        let mut builder = MessageBuilder::new();
        let mut suggestions = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(rofy_ai::Error::Aborted.into()),
                next = stream.next() => next,
            };
            let Some(event) = next else { break };
            if sink.is_closed() {
                debug!(chat_id = %chat_id, "listener went away, abandoning plan");
                return Err(rofy_ai::Error::Aborted.into());
            }
            builder.process_event(&event);

            match event {
                MessageEvent::ToolCallDelta { delta, .. } => {
                    sink.emit(PlanEvent::JsonDelta { delta });
                }
                MessageEvent::TextDelta { delta, .. } if !builder.has_tool_call() => {
                    suggestions.push_str(&delta);
                    sink.emit(PlanEvent::SuggestionsDelta { delta });
                }
                MessageEvent::Error { message } => return Err(Error::Stream(message)),
                MessageEvent::Done { .. } => break,
                _ => {}
            }
        }

        self.finalize(&chat, builder.build(), suggestions, sink).await
    }

    async fn finalize<S: EventSink<PlanEvent>>(
        &self,
        chat: &ChatRecord,
        message: Message,
        suggestions: String,
        sink: &S,
    ) -> Result<PlanOutcome> {
        if let Some(call) = message
            .tool_calls()
            .into_iter()
            .find(|call| call.name == EMIT_APP_PLAN)
        {
            let plan = self.parse_plan(&call.arguments)?;
            let value = serde_json::to_value(&plan).map_err(|e| Error::InvalidPlan(e.to_string()))?;
            self.store
                .append_plan_message(
                    &chat.id,
                    PlanMessage::new(Role::Assistant, PlanMessageKind::Plan, value),
                )
                .await?;
            self.store.update_summary(&chat.id, plan.summary()).await?;
            debug!(chat_id = %chat.id, app = %plan.app_name, "plan stored");
            return Ok(PlanOutcome::Plan(plan));
        }

        let text = message.text();
        let text = if text.trim().is_empty() {
            suggestions
        } else {
            text
        };
        let text = text.trim().to_string();

        if let Some((intent, payload)) = parse_intent_reply(&text) {
            let (kind, event, outcome) = match intent {
                PlanIntent::PolicyBlock => (
                    PlanMessageKind::PolicyBlock,
                    PlanEvent::PolicyBlock {
                        payload: payload.clone(),
                    },
                    PlanOutcome::PolicyBlock(payload.clone()),
                ),
                _ => (
                    PlanMessageKind::NonIntent,
                    PlanEvent::NonIntent {
                        payload: payload.clone(),
                    },
                    PlanOutcome::NonIntent(payload.clone()),
                ),
            };
            self.store
                .append_plan_message(&chat.id, PlanMessage::new(Role::Assistant, kind, payload))
                .await?;
            sink.emit(event);
            return Ok(outcome);
        }

        self.store
            .append_plan_message(
                &chat.id,
                PlanMessage::new(
                    Role::Assistant,
                    PlanMessageKind::Suggestions,
                    json!(text.clone()),
                ),
            )
            .await?;
        sink.emit(PlanEvent::Suggestions { text: text.clone() });
        Ok(PlanOutcome::Suggestions(text))
    }

    fn parse_plan(&self, arguments: &serde_json::Value) -> Result<AppPlan> {
        if let Some(validator) = &self.validator {
            let errors: Vec<String> = validator
                .iter_errors(arguments)
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            if !errors.is_empty() {
                return Err(Error::InvalidPlan(errors.join("; ")));
            }
        }
        let plan: AppPlan = serde_json::from_value(arguments.clone())
            .map_err(|e| Error::InvalidPlan(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }
}

/// Create a chat and record its prompt as the first plan message
pub async fn start_chat(
    store: &dyn DurableStore,
    user_id: &str,
    prompt: &str,
) -> Result<ChatRecord> {
    let chat = store.create_chat(user_id, prompt).await?;
    store
        .append_plan_message(
            &chat.id,
            PlanMessage::new(Role::User, PlanMessageKind::Prompt, json!(prompt)),
        )
        .await?;
    Ok(chat)
}

/// Most recent APP_INTENT plan in a chat's plan history
pub fn latest_plan(messages: &[PlanMessage]) -> Option<AppPlan> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .filter(|m| m.message.get("intent").and_then(|i| i.as_str()) == Some("APP_INTENT"))
        .find_map(|m| serde_json::from_value(m.message.clone()).ok())
}

/// The planner system prompt, with the current plan embedded when there is one
pub fn compose_system_prompt(base: &str, current: Option<&AppPlan>) -> String {
    match current.and_then(|plan| serde_json::to_string_pretty(plan).ok()) {
        Some(plan) => format!(
            "{}\n\n<BEGIN_CURRENT_PLAN>\n{}\n<END_CURRENT_PLAN>",
            base, plan
        ),
        None => base.to_string(),
    }
}

/// Extract a NON_INTENT / POLICY_BLOCK object from a text reply.
///
/// Takes everything from the first `{`, strips code fences and, when that
/// does not parse, retries up to the last `}`.
pub fn parse_intent_reply(text: &str) -> Option<(PlanIntent, serde_json::Value)> {
    let brace = text.find('{')?;
    let blob = LEADING_FENCE.replace(&text[brace..], "");
    let blob = TRAILING_FENCE.replace(&blob, "");
    let blob = blob.trim();

    let value: serde_json::Value = serde_json::from_str(blob).ok().or_else(|| {
        let last = blob.rfind('}').filter(|&i| i > 0)?;
        serde_json::from_str(&blob[..=last]).ok()
    })?;

    let intent: PlanIntent = serde_json::from_value(value.get("intent")?.clone()).ok()?;
    matches!(intent, PlanIntent::NonIntent | PlanIntent::PolicyBlock).then_some((intent, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectSink;
    use crate::store::MemoryStore;
    use crate::testing::{Script, ScriptedProvider, text_pass, tool_pass};

    fn sample_plan() -> serde_json::Value {
        json!({
            "intent": "APP_INTENT",
            "appName": "Habit Hero",
            "description": "Track daily habits.",
            "icon": "MdOutlineTaskAlt",
            "initialVersion": { "summary": "MVP", "features": ["Add habits", "Daily check-in"] },
            "laterVersion": { "summary": "Next", "features": ["Streak badges"] },
            "designLanguage": { "summary": "Calm", "styles": ["#2563EB", "Inter"] }
        })
    }

    async fn setup(scripts: Vec<Script>) -> (Planner, Arc<ScriptedProvider>, Arc<MemoryStore>, ChatRecord) {
        let provider = ScriptedProvider::new(scripts);
        let store = Arc::new(MemoryStore::new());
        let chat = start_chat(store.as_ref(), "user_1", "a habit tracker")
            .await
            .unwrap();
        let planner = Planner::new(
            PlannerConfig::new(Model::anthropic("test-model"), "Make a plan."),
            provider.clone(),
            store.clone(),
        );
        (planner, provider, store, chat)
    }

    #[tokio::test]
    async fn test_plan_via_tool() {
        let plan = sample_plan().to_string();
        let (head, tail) = plan.split_at(20);
        let (planner, _provider, store, chat) =
            setup(vec![Script::Events(tool_pass("Here you go", EMIT_APP_PLAN, &[head, tail]))]).await;

        let sink = CollectSink::new();
        let outcome = planner
            .run(&chat.id, &sink, CancellationToken::new())
            .await
            .unwrap();
        let PlanOutcome::Plan(plan) = outcome else {
            panic!("expected a plan");
        };
        assert_eq!(plan.app_name, "Habit Hero");

        let events = sink.events();
        assert_eq!(
            events[0],
            PlanEvent::SuggestionsDelta {
                delta: "Here you go".into()
            }
        );
        assert_eq!(events[1], PlanEvent::JsonDelta { delta: head.into() });
        assert_eq!(events[2], PlanEvent::JsonDelta { delta: tail.into() });
        assert_eq!(events.last(), Some(&PlanEvent::Done));

        let messages = store.plan_messages(&chat.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].kind, PlanMessageKind::Plan);
        let chat = store.chat(&chat.id).await.unwrap().unwrap();
        assert_eq!(chat.summary.app_name.as_deref(), Some("Habit Hero"));
        assert!(chat.summary.app_initial_version.unwrap().contains("Daily check-in"));
    }

    #[tokio::test]
    async fn test_non_intent_reply() {
        let reply = "```json\n{\"intent\":\"NON_INTENT\",\"message\":\"I build apps.\"}\n```";
        let (planner, _provider, store, chat) = setup(vec![Script::Events(text_pass(reply))]).await;

        let sink = CollectSink::new();
        let outcome = planner
            .run(&chat.id, &sink, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, PlanOutcome::NonIntent(ref v) if v["message"] == "I build apps."));

        let events = sink.events();
        assert!(matches!(&events[events.len() - 2], PlanEvent::NonIntent { .. }));
        assert_eq!(events.last(), Some(&PlanEvent::Done));
        let messages = store.plan_messages(&chat.id).await.unwrap();
        assert_eq!(messages.last().unwrap().kind, PlanMessageKind::NonIntent);
    }

    #[tokio::test]
    async fn test_suggestions_reply() {
        let (planner, _provider, _store, chat) =
            setup(vec![Script::Events(text_pass("  Could you say more about the audience?  "))]).await;
        let sink = CollectSink::new();
        let outcome = planner
            .run(&chat.id, &sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PlanOutcome::Suggestions("Could you say more about the audience?".into())
        );
        let events = sink.events();
        assert_eq!(
            events[events.len() - 2],
            PlanEvent::Suggestions {
                text: "Could you say more about the audience?".into()
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_plan_is_rejected() {
        let mut bad = sample_plan();
        bad["initialVersion"]["features"] = json!([]);
        let (planner, _provider, store, chat) = setup(vec![Script::Events(tool_pass(
            "",
            EMIT_APP_PLAN,
            &[&bad.to_string()],
        ))])
        .await;

        let sink = CollectSink::new();
        let err = planner
            .run(&chat.id, &sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));
        assert!(matches!(sink.events().last(), Some(PlanEvent::Error { .. })));
        assert_eq!(store.plan_messages(&chat.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_chat() {
        let (planner, _provider, _store, _chat) = setup(vec![]).await;
        let sink = CollectSink::new();
        let err = planner
            .run("nope", &sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::ChatNotFound(_))));
        assert_eq!(
            sink.events(),
            vec![PlanEvent::Error {
                message: "Chat not found.".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_closed_listener_abandons_plan() {
        let plan = sample_plan().to_string();
        let (planner, _provider, store, chat) =
            setup(vec![Script::Events(tool_pass("", EMIT_APP_PLAN, &[plan.as_str()]))]).await;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<PlanEvent>();
        drop(rx);

        let err = planner
            .run(&chat.id, &tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ai(rofy_ai::Error::Aborted)));
        assert_eq!(store.plan_messages(&chat.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_current_plan_embedded_in_system_prompt() {
        let (planner, provider, store, chat) = setup(vec![Script::Events(text_pass("ok"))]).await;
        store
            .append_plan_message(
                &chat.id,
                PlanMessage::new(Role::Assistant, PlanMessageKind::Plan, sample_plan()),
            )
            .await
            .unwrap();

        planner
            .run(&chat.id, &CollectSink::new(), CancellationToken::new())
            .await
            .unwrap();
        let system = provider.contexts()[0].system.clone();
        assert!(system.starts_with("Make a plan.\n\n<BEGIN_CURRENT_PLAN>\n"));
        assert!(system.contains("\"appName\": \"Habit Hero\""));
        assert!(system.ends_with("<END_CURRENT_PLAN>"));
    }

    #[test]
    fn test_parse_intent_reply() {
        let (intent, value) =
            parse_intent_reply("Sorry! {\"intent\":\"POLICY_BLOCK\",\"reason\":\"unsafe\"} thanks")
                .unwrap();
        assert_eq!(intent, PlanIntent::PolicyBlock);
        assert_eq!(value["reason"], "unsafe");

        assert!(parse_intent_reply("no json here").is_none());
        assert!(parse_intent_reply("{\"intent\":\"APP_INTENT\"}").is_none());
        assert!(parse_intent_reply("{broken").is_none());
    }

    #[test]
    fn test_validate_bounds() {
        let mut plan: AppPlan = serde_json::from_value(sample_plan()).unwrap();
        assert!(plan.validate().is_ok());

        plan.later_version.features = vec!["a".into(); 5];
        assert!(plan.validate().is_err());
        plan.later_version.features.clear();
        assert!(plan.validate().is_ok());

        plan.design_language.styles.clear();
        assert!(plan.validate().is_err());
    }
}
