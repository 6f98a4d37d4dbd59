//! Durable storage of transcripts, chats and plan messages

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry of an orchestration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub role: Role,
    pub message: String,
    pub created_at: i64,
}

impl TurnRecord {
    pub fn new(role: Role, message: impl Into<String>) -> Self {
        Self {
            role,
            message: message.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(Role::User, message)
    }

    pub fn assistant(message: impl Into<String>) -> Self {
        Self::new(Role::Assistant, message)
    }
}

/// App metadata derived from an approved-shape plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_initial_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_later_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_design_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: String,
    pub user_id: String,
    pub initial_prompt: String,
    pub plan_approved: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(flatten)]
    pub summary: AppSummary,
}

/// What a plan message holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMessageKind {
    Prompt,
    Plan,
    NonIntent,
    PolicyBlock,
    Suggestions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMessage {
    pub id: String,
    pub role: Role,
    pub kind: PlanMessageKind,
    /// Prompt text, plan object or refusal payload
    pub message: serde_json::Value,
    pub created_at: i64,
}

impl PlanMessage {
    pub fn new(role: Role, kind: PlanMessageKind, message: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            kind,
            message,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Persistence used by the orchestration loop and the planning flow
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn record_turn(&self, session_id: &str, turn: TurnRecord) -> StoreResult<()>;

    async fn turns(&self, session_id: &str) -> StoreResult<Vec<TurnRecord>>;

    /// Merge non-empty summary fields into the chat
    async fn update_summary(&self, chat_id: &str, summary: AppSummary) -> StoreResult<()>;

    async fn create_chat(&self, user_id: &str, initial_prompt: &str) -> StoreResult<ChatRecord>;

    async fn chat(&self, chat_id: &str) -> StoreResult<Option<ChatRecord>>;

    async fn append_plan_message(&self, chat_id: &str, message: PlanMessage) -> StoreResult<()>;

    async fn plan_messages(&self, chat_id: &str) -> StoreResult<Vec<PlanMessage>>;

    async fn approve_plan(&self, chat_id: &str) -> StoreResult<()>;
}

fn new_chat(user_id: &str, initial_prompt: &str) -> ChatRecord {
    let now = chrono::Utc::now().timestamp_millis();
    ChatRecord {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        initial_prompt: initial_prompt.to_string(),
        plan_approved: false,
        created_at: now,
        updated_at: now,
        summary: AppSummary::default(),
    }
}

fn merge_summary(chat: &mut ChatRecord, summary: AppSummary) {
    let target = &mut chat.summary;
    let fields = [
        (&mut target.app_name, summary.app_name),
        (&mut target.app_description, summary.app_description),
        (&mut target.app_icon, summary.app_icon),
        (&mut target.app_initial_version, summary.app_initial_version),
        (&mut target.app_later_version, summary.app_later_version),
        (&mut target.app_design_language, summary.app_design_language),
    ];
    for (slot, value) in fields {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            *slot = Some(value);
        }
    }
    chat.updated_at = chrono::Utc::now().timestamp_millis();
}

#[derive(Default)]
struct MemoryState {
    turns: HashMap<String, Vec<TurnRecord>>,
    chats: HashMap<String, ChatRecord>,
    plans: HashMap<String, Vec<PlanMessage>>,
}

/// In-process store; contents are lost on restart
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn record_turn(&self, session_id: &str, turn: TurnRecord) -> StoreResult<()> {
        self.state
            .lock()
            .turns
            .entry(session_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn turns(&self, session_id: &str) -> StoreResult<Vec<TurnRecord>> {
        Ok(self
            .state
            .lock()
            .turns
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_summary(&self, chat_id: &str, summary: AppSummary) -> StoreResult<()> {
        let mut state = self.state.lock();
        let chat = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
        merge_summary(chat, summary);
        Ok(())
    }

    async fn create_chat(&self, user_id: &str, initial_prompt: &str) -> StoreResult<ChatRecord> {
        let chat = new_chat(user_id, initial_prompt);
        self.state
            .lock()
            .chats
            .insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn chat(&self, chat_id: &str) -> StoreResult<Option<ChatRecord>> {
        Ok(self.state.lock().chats.get(chat_id).cloned())
    }

    async fn append_plan_message(&self, chat_id: &str, message: PlanMessage) -> StoreResult<()> {
        let mut state = self.state.lock();
        if !state.chats.contains_key(chat_id) {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }
        state
            .plans
            .entry(chat_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn plan_messages(&self, chat_id: &str) -> StoreResult<Vec<PlanMessage>> {
        Ok(self
            .state
            .lock()
            .plans
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn approve_plan(&self, chat_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let chat = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
        chat.plan_approved = true;
        chat.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(())
    }
}

/// Directory-backed store.
///
/// Layout: `<root>/<id>/chat.json`, `<root>/<id>/turns.jsonl` and
/// `<root>/<id>/plan.jsonl`. Orchestration sessions and chats share ids.
pub struct FileStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    const CHAT_FILE: &'static str = "chat.json";
    const TURNS_FILE: &'static str = "turns.jsonl";
    const PLAN_FILE: &'static str = "plan.jsonl";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, id: &str) -> StoreResult<PathBuf> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    async fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: serde::de::DeserializeOwned>(&self, path: &Path) -> StoreResult<Vec<T>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!(
                    "Skipping unreadable line {} of {}: {}",
                    number + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(items)
    }

    async fn read_chat(&self, chat_id: &str) -> StoreResult<Option<ChatRecord>> {
        let path = self.dir(chat_id)?.join(Self::CHAT_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_chat(&self, chat: &ChatRecord) -> StoreResult<()> {
        let dir = self.dir(&chat.id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_string_pretty(chat)?;
        let path = dir.join(Self::CHAT_FILE);
        crate::sandbox::write_atomic(&path, &json).await?;
        Ok(())
    }

    async fn modify_chat<F>(&self, chat_id: &str, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut ChatRecord) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut chat = self
            .read_chat(chat_id)
            .await?
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
        change(&mut chat);
        self.write_chat(&chat).await
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn record_turn(&self, session_id: &str, turn: TurnRecord) -> StoreResult<()> {
        let path = self.dir(session_id)?.join(Self::TURNS_FILE);
        let _guard = self.write_lock.lock().await;
        self.append_line(&path, &turn).await
    }

    async fn turns(&self, session_id: &str) -> StoreResult<Vec<TurnRecord>> {
        let path = self.dir(session_id)?.join(Self::TURNS_FILE);
        self.read_lines(&path).await
    }

    async fn update_summary(&self, chat_id: &str, summary: AppSummary) -> StoreResult<()> {
        self.modify_chat(chat_id, |chat| merge_summary(chat, summary))
            .await
    }

    async fn create_chat(&self, user_id: &str, initial_prompt: &str) -> StoreResult<ChatRecord> {
        let chat = new_chat(user_id, initial_prompt);
        let _guard = self.write_lock.lock().await;
        self.write_chat(&chat).await?;
        Ok(chat)
    }

    async fn chat(&self, chat_id: &str) -> StoreResult<Option<ChatRecord>> {
        self.read_chat(chat_id).await
    }

    async fn append_plan_message(&self, chat_id: &str, message: PlanMessage) -> StoreResult<()> {
        if self.read_chat(chat_id).await?.is_none() {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }
        let path = self.dir(chat_id)?.join(Self::PLAN_FILE);
        let _guard = self.write_lock.lock().await;
        self.append_line(&path, &message).await
    }

    async fn plan_messages(&self, chat_id: &str) -> StoreResult<Vec<PlanMessage>> {
        let path = self.dir(chat_id)?.join(Self::PLAN_FILE);
        self.read_lines(&path).await
    }

    async fn approve_plan(&self, chat_id: &str) -> StoreResult<()> {
        self.modify_chat(chat_id, |chat| {
            chat.plan_approved = true;
            chat.updated_at = chrono::Utc::now().timestamp_millis();
        })
        .await
    }
}
