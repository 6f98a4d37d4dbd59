//! HTTP routes for the server.

use crate::{auth::UserId, state::AppState, ws::ws_handler};
use axum::{
    Extension, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{
        IntoResponse, Json,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::Stream;
use regex::Regex;
use rofy_agent::{
    CollectSink, RunHandle, RunRequest, SessionEvent, StoreError,
    plan::start_chat,
    store::{ChatRecord, Role},
};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    sync::LazyLock,
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

const SSE_RETRY: Duration = Duration::from_millis(1000);

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI pattern compiles")
});

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/orchestrator", post(orchestrate))
        .route("/orchestrator/stop", post(stop_run))
        .route("/stream", get(stream))
        .route("/ws", get(ws_handler))
        .route("/plan/create", post(plan_create))
        .route("/plan/get", post(plan_get))
        .route("/approve-plan", post(approve_plan))
        .route("/chats/messages", get(chat_messages))
        .route("/chats/info", get(chat_info))
        .route("/logs", post(post_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_token,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Standard API error response.
#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    code: String,
}

impl ApiError {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }

    fn not_found(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (StatusCode::NOT_FOUND, Json(Self::new(msg, "NOT_FOUND")))
    }

    fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (StatusCode::BAD_REQUEST, Json(Self::new(msg, "BAD_REQUEST")))
    }

    fn forbidden(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (StatusCode::FORBIDDEN, Json(Self::new(msg, "FORBIDDEN")))
    }

    fn internal(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Self::new(msg, "INTERNAL_ERROR")),
        )
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// `{success: false, error}` body used by the run and chat endpoints
fn failure(status: StatusCode, error: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({ "success": false, "error": error })),
    )
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn sse_event(event: &SessionEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}

// =============================================================================
// Health
// =============================================================================

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "success": true,
        "message": "Rofy AI Backend API is running",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "endpoints": { "health": "/health" }
    }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "success": true,
        "status": "healthy",
        "service": "rofy-ai-backend",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

// =============================================================================
// Orchestration
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrchestrateRequest {
    session_id: Option<String>,
    prompt: Option<String>,
}

/// Start a run and stream its events to the caller.
///
/// Dropping the response (client disconnect) cancels the run.
async fn orchestrate(
    State(state): State<AppState>,
    Json(req): Json<OrchestrateRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (Some(session_id), Some(prompt)) = (required(req.session_id), required(req.prompt)) else {
        return Err(ApiError::bad_request("Missing sessionId or prompt"));
    };

    let handle = RunHandle::new();
    let guard = handle.token().drop_guard();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator
            .run(RunRequest { session_id, prompt }, handle, tx)
            .await;
    });

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default().retry(SSE_RETRY));
        while let Some(event) = rx.recv().await {
            yield Ok(sse_event(&event));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest {
    session_id: Option<String>,
}

async fn stop_run(
    State(state): State<AppState>,
    Json(req): Json<StopRequest>,
) -> impl IntoResponse {
    let Some(session_id) = required(req.session_id) else {
        return failure(StatusCode::BAD_REQUEST, "Missing sessionId");
    };

    match state.registry().stop(&session_id) {
        Ok(()) => {
            info!(session_id = %session_id, "stop requested");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "success": true })),
            )
        }
        Err(_) => failure(StatusCode::NOT_FOUND, "Run not found"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Option<String>,
}

/// Passive listener for a session's events
async fn stream(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let Some(session_id) = required(query.session_id) else {
        return Err(ApiError::bad_request("Missing sessionId"));
    };

    let (subscription, mut rx) = state.bus().subscribe_channel(&session_id);
    let heartbeat = state.heartbeat;

    let stream = async_stream::stream! {
        let _subscription = subscription;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

        yield Ok(Event::default().retry(SSE_RETRY));
        yield Ok(sse_event(&SessionEvent::session(&session_id)));

        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = ping.tick() => Some(SessionEvent::Ping {}),
            };
            match event {
                Some(event) => yield Ok(sse_event(&event)),
                None => break,
            }
        }
    };

    Ok(Sse::new(stream))
}

// =============================================================================
// Planning
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanCreateRequest {
    user_prompt: Option<String>,
}

async fn plan_create(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Json(req): Json<PlanCreateRequest>,
) -> ApiResult<impl IntoResponse> {
    let Some(prompt) = required(req.user_prompt) else {
        return Err(ApiError::bad_request("userPrompt is required."));
    };

    let chat = start_chat(state.store.as_ref(), user.as_str(), &prompt)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    info!(chat_id = %chat.id, user = %user.as_str(), "chat created");
    Ok(Json(serde_json::json!({ "chatId": chat.id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    chat_id: Option<String>,
}

async fn owned_chat(state: &AppState, user: &UserId, chat_id: &str) -> ApiResult<ChatRecord> {
    let chat = state
        .store
        .chat(chat_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("Chat not found."))?;
    if chat.user_id != user.as_str() {
        return Err(ApiError::forbidden("You do not have access to this chat."));
    }
    Ok(chat)
}

/// Return a chat's plan messages, running the planner first when the
/// assistant has not answered yet
async fn plan_get(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let Some(chat_id) = required(req.chat_id) else {
        return Err(ApiError::bad_request("chatId is required."));
    };
    owned_chat(&state, &user, &chat_id).await?;

    let messages = state
        .store
        .plan_messages(&chat_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if messages.last().is_some_and(|m| m.role == Role::Assistant) {
        return Ok(Json(messages));
    }

    state
        .planner
        .run(&chat_id, &CollectSink::new(), CancellationToken::new())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let messages = state
        .store
        .plan_messages(&chat_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(messages))
}

async fn approve_plan(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let Some(chat_id) = required(req.chat_id) else {
        return failure(StatusCode::BAD_REQUEST, "chatId is required");
    };

    match state.store.approve_plan(&chat_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true })),
        ),
        Err(StoreError::ChatNotFound(_)) => failure(StatusCode::NOT_FOUND, "Chat not found"),
        Err(e) => failure(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

// =============================================================================
// Chats
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatQuery {
    chat_id: Option<String>,
}

async fn chat_messages(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
) -> impl IntoResponse {
    let Some(chat_id) = required(query.chat_id) else {
        return failure(StatusCode::BAD_REQUEST, "Missing chatId");
    };

    match state.store.turns(&chat_id).await {
        Ok(turns) if turns.is_empty() => failure(StatusCode::NOT_FOUND, "No messages found"),
        Ok(turns) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "messages": turns })),
        ),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn iso_millis(millis: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(millis).map(|t| t.to_rfc3339())
}

async fn chat_info(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
) -> impl IntoResponse {
    let Some(chat_id) = required(query.chat_id) else {
        return failure(StatusCode::BAD_REQUEST, "Missing chatId");
    };

    match state.store.chat(&chat_id).await {
        Ok(Some(chat)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "chatId": chat.id,
                "initialPrompt": chat.initial_prompt,
                "appName": chat.summary.app_name,
                "appDescription": chat.summary.app_description,
                "appIcon": chat.summary.app_icon,
                "appDesignLanguage": chat.summary.app_design_language,
                "planApproved": chat.plan_approved,
                "createdAt": iso_millis(chat.created_at),
                "updatedAt": iso_millis(chat.updated_at),
            })),
        ),
        Ok(None) => failure(StatusCode::NOT_FOUND, "Chat not found"),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

// =============================================================================
// App logs
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsRequest {
    session_id: Option<String>,
    data: Option<String>,
}

fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Forward an error log from the running app to the session's listeners
async fn post_logs(
    State(state): State<AppState>,
    Json(req): Json<LogsRequest>,
) -> ApiResult<impl IntoResponse> {
    let Some(session_id) = required(req.session_id) else {
        return Err(ApiError::bad_request("Missing sessionId"));
    };
    let Some(data) = req.data.filter(|d| !d.is_empty()) else {
        return Err(ApiError::bad_request("Missing log message"));
    };

    let bus = state.bus();
    if bus.listener_count(&session_id) == 0 {
        warn!(session_id = %session_id, "app log for a session with no listeners");
    }
    bus.publish(&session_id, &SessionEvent::log_error(strip_ansi(&data)));
    bus.publish(&session_id, &SessionEvent::notice("auto-fix-available"));

    Ok(Json(serde_json::json!({ "ok": true })))
}
