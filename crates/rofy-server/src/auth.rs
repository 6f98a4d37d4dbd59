//! Bearer token authentication

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

use crate::state::AppState;

/// Paths reachable without a token
const PUBLIC_PATHS: [&str; 3] = ["/", "/health", "/favicon.ico"];

/// Identity attached to authenticated requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Maps a presented token to a user
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: Option<&str>) -> Result<UserId, AuthError>;
}

/// Verifier backed by a fixed token table. With no tokens configured every
/// request is attributed to `anonymous`.
#[derive(Debug, Clone, Default)]
pub struct TokenVerifier {
    tokens: HashMap<String, String>,
}

impl TokenVerifier {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl AuthVerifier for TokenVerifier {
    async fn verify(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        if self.tokens.is_empty() {
            return Ok(UserId(Self::ANONYMOUS.to_string()));
        }
        token
            .and_then(|token| self.tokens.get(token))
            .map(|user| UserId(user.clone()))
            .ok_or(AuthError::Unauthorized)
    }
}

pub async fn require_token(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if PUBLIC_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let token = extract_token(req.headers());
    match state.auth.verify(token.as_deref()).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            Ok(next.run(req).await)
        }
        Err(e) => {
            warn!(path = %req.uri().path(), "authentication failed");
            Err(e)
        }
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_token_table() {
        let verifier = TokenVerifier::new(HashMap::from([("t1".to_string(), "user_1".to_string())]));
        assert_eq!(verifier.verify(Some("t1")).await.unwrap(), UserId("user_1".into()));
        assert!(verifier.verify(Some("t2")).await.is_err());
        assert!(verifier.verify(None).await.is_err());
    }

    #[tokio::test]
    async fn test_open_mode_is_anonymous() {
        let verifier = TokenVerifier::default();
        assert_eq!(verifier.verify(None).await.unwrap().as_str(), "anonymous");
    }

    #[test]
    fn test_extract_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc "));
        assert_eq!(extract_token(&headers).as_deref(), Some("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_token(&headers), None);
    }
}
