//! Bearer-token authentication.
//!
//! Tokens are opaque `kind.id.secret` strings. Only a digest of the secret is
//! stored; presented secrets are compared in constant time to mitigate timing attacks.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::errors::AppError;
use crate::models::{now_ms, Role};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn prefix(&self) -> &'static str {
        match self {
            TokenKind::Access => "a",
            TokenKind::Refresh => "r",
        }
    }
}

/// Identity attached to requests that passed [`bearer_auth_layer`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: i64,
    pub session_id: i64,
    pub token_id: i64,
    pub role: Role,
}

/// Random token secret.
pub fn generate_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Digest of a secret as stored in the database.
pub fn hash_secret(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

pub fn format_token(kind: TokenKind, id: i64, secret: &str) -> String {
    format!("{}.{}.{}", kind.prefix(), id, secret)
}

/// Split a token of the expected kind into its id and secret.
pub fn parse_token(token: &str, kind: TokenKind) -> Option<(i64, &str)> {
    let mut parts = token.splitn(3, '.');
    let prefix = parts.next()?;
    let id = parts.next()?.parse().ok()?;
    let secret = parts.next()?;
    (prefix == kind.prefix() && !secret.is_empty()).then_some((id, secret))
}

/// Whether a presented secret matches a stored digest.
pub fn secret_matches(secret: &str, stored_hash: &str) -> bool {
    constant_time_compare(&hash_secret(secret), stored_hash)
}

/// Extract the bearer token from a request's headers.
pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

/// Access-token authentication layer.
pub async fn bearer_auth_layer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
        return AppError::Unauthorized("Missing access token".to_string()).into_response();
    };

    match authenticate_access(&state, &token).await {
        Ok(context) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

async fn authenticate_access(state: &AppState, token: &str) -> Result<AuthContext, AppError> {
    let invalid = || AppError::Unauthorized("Invalid access token".to_string());

    let (id, secret) = parse_token(token, TokenKind::Access).ok_or_else(invalid)?;
    let row = state.repo.get_token(id).await?.ok_or_else(invalid)?;

    if !secret_matches(secret, &row.access_hash) || !row.session_active {
        return Err(invalid());
    }
    if row.access_expires_at <= now_ms() {
        return Err(AppError::Unauthorized("Access token expired".to_string()));
    }

    let user = state
        .repo
        .get_user(row.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User does not exist".to_string()))?;

    Ok(AuthContext {
        user_id: user.id,
        session_id: row.session_id,
        token_id: row.id,
        role: user.role,
    })
}

/// Perform constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    // Constant-time comparison
    a_bytes.ct_eq(b_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare("test-key-123", "test-key-123"));
    }

    #[test]
    fn test_constant_time_compare_not_equal() {
        assert!(!constant_time_compare("test-key-123", "test-key-124"));
    }

    #[test]
    fn test_constant_time_compare_different_lengths() {
        assert!(!constant_time_compare("short", "much-longer-key"));
    }

    #[test]
    fn test_constant_time_compare_empty() {
        assert!(constant_time_compare("", ""));
        assert!(!constant_time_compare("", "not-empty"));
    }

    #[test]
    fn test_token_format_round_trip() {
        let secret = generate_secret();
        let token = format_token(TokenKind::Refresh, 42, &secret);
        assert_eq!(parse_token(&token, TokenKind::Refresh), Some((42, secret.as_str())));
        assert_eq!(parse_token(&token, TokenKind::Access), None);
        assert_eq!(parse_token("r.x.secret", TokenKind::Refresh), None);
        assert_eq!(parse_token("r.1.", TokenKind::Refresh), None);
    }

    #[test]
    fn test_secret_matches_digest() {
        let secret = generate_secret();
        let stored = hash_secret(&secret);
        assert!(secret_matches(&secret, &stored));
        assert!(!secret_matches("guess", &stored));
    }
}
