//! Account and session endpoints.

use axum::{extract::State, http::HeaderMap, Extension, Json};

use super::{created, done, success, ApiResult};
use crate::auth::{self, AuthContext, TokenKind};
use crate::db::NewUser;
use crate::errors::AppError;
use crate::models::{now_ms, AuthPayload, LoginRequest, RegisterRequest, Role, UserInfo};
use crate::AppState;

const REFRESH_REUSED: &str = "Invalid refresh token. Either reused or invalidated.";
const SESSION_EXPIRED: &str = "Session does not exist or has expired";

fn check_username(issues: &mut Vec<String>, username: &str) {
    match username.chars().count() {
        n if n < 3 => issues.push("Username must be at least 3 characters long".to_string()),
        n if n > 32 => issues.push("Username cannot exceed 32 characters".to_string()),
        _ => {}
    }
}

fn check_password(issues: &mut Vec<String>, password: &str) {
    match password.chars().count() {
        n if n < 3 => issues.push("Password must be at least 3 characters long".to_string()),
        n if n > 256 => issues.push("Password cannot exceed 256 characters".to_string()),
        _ => {}
    }
}

fn reject_issues(issues: Vec<String>) -> Result<(), AppError> {
    if issues.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(issues.join("; ")))
    }
}

/// Start a new session line for a user and issue its first token pair.
async fn open_session(state: &AppState, user: UserInfo) -> Result<AuthPayload, AppError> {
    let session_id = state.repo.create_session(user.id).await?;
    let session = state
        .repo
        .issue_tokens(
            session_id,
            user.id,
            state.config.access_token_ttl,
            state.config.refresh_token_ttl,
        )
        .await?;
    Ok(AuthPayload { user, session })
}

/// POST /api/auth/register - Create an account and log it in.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<AuthPayload> {
    let displayname = request.username.trim().to_string();
    let username = displayname.to_lowercase();
    let email = request.email.trim().to_lowercase();
    let password = request.password.trim().to_string();

    let mut issues = Vec::new();
    check_username(&mut issues, &username);
    if !email.contains('@') || email.len() < 3 {
        issues.push("Email must be a valid email address".to_string());
    }
    check_password(&mut issues, &password);
    reject_issues(issues)?;

    tracing::info!("Attempted registration by {}", username);
    if state.repo.username_taken(&username).await? {
        return Err(AppError::BadRequest("Username is already taken".to_string()));
    }
    if state.repo.email_taken(&email).await? {
        return Err(AppError::BadRequest(
            "Email is already used on another account".to_string(),
        ));
    }

    let cost = state.config.password_hash_cost;
    let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;

    let role = if state.config.registered_users_limited {
        Role::Restricted
    } else {
        Role::Normal
    };
    let user = state
        .repo
        .create_user(&NewUser {
            username,
            displayname,
            email,
            password_hash,
            role,
        })
        .await?;

    let payload = open_session(&state, user).await?;
    tracing::info!(
        "User {} registered (session {})",
        payload.user.username,
        payload.session.session_id
    );
    created("Successfully registered user", payload)
}

/// POST /api/auth/login - Exchange credentials for a token pair.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<AuthPayload> {
    let login = request.username.trim().to_lowercase();
    let password = request.password.trim().to_string();

    let mut issues = Vec::new();
    if login.chars().count() < 3 {
        issues.push("Username/email must be at least 3 characters long".to_string());
    }
    check_password(&mut issues, &password);
    reject_issues(issues)?;

    tracing::info!("Attempted login as {}", login);
    let stored = state
        .repo
        .find_user_by_login(&login)
        .await?
        .ok_or_else(|| AppError::NotFound("User does not exist".to_string()))?;

    let hash = stored.password_hash.clone();
    let verified =
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false))
            .await?;
    if !verified {
        tracing::warn!("Incorrect password during login as {}", login);
        return Err(AppError::BadRequest("Invalid password".to_string()));
    }

    let payload = open_session(&state, stored.info).await?;
    tracing::info!(
        "User {} logged in (session {})",
        payload.user.username,
        payload.session.session_id
    );
    let message = format!("Logged in. Welcome, {}", payload.user.username);
    success(message, payload)
}

/// GET /api/auth/refresh - Rotate a token pair using the refresh token.
///
/// A refresh token works once. Presenting a spent one ends the whole session line.
pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<AuthPayload> {
    let forbidden = |message: &str| AppError::Forbidden(message.to_string());

    let token = auth::bearer_token(&headers).ok_or_else(|| forbidden("Missing refresh token"))?;
    let (id, secret) =
        auth::parse_token(token, TokenKind::Refresh).ok_or_else(|| forbidden("Invalid auth data"))?;
    let row = state
        .repo
        .get_token(id)
        .await?
        .ok_or_else(|| forbidden(SESSION_EXPIRED))?;

    if !auth::secret_matches(secret, &row.refresh_hash) {
        return Err(forbidden("Invalid auth data"));
    }
    if row.refresh_expires_at <= now_ms() {
        return Err(forbidden(SESSION_EXPIRED));
    }
    if !row.session_active {
        tracing::info!(
            "Invalidated session token {} used (session {})",
            row.id,
            row.session_id
        );
        return Err(forbidden(REFRESH_REUSED));
    }
    if !row.active || !state.repo.consume_refresh_token(row.id).await? {
        tracing::warn!(
            "Refresh token {} reused, ending session {}",
            row.id,
            row.session_id
        );
        state.repo.deactivate_session(row.session_id).await?;
        return Err(forbidden(REFRESH_REUSED));
    }

    let user = state
        .repo
        .get_user(row.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User does not exist".to_string()))?;
    let session = state
        .repo
        .issue_tokens(
            row.session_id,
            user.id,
            state.config.access_token_ttl,
            state.config.refresh_token_ttl,
        )
        .await?;

    tracing::info!("User {} refreshed session {}", user.username, row.session_id);
    success("Refreshed session", AuthPayload { user, session })
}

/// POST /api/auth/logout - End the current session line.
pub async fn logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<()> {
    state.repo.deactivate_session(auth.session_id).await?;
    tracing::info!("User {} logged out of session {}", auth.user_id, auth.session_id);
    done("Logged out")
}

/// GET /api/auth/self - Profile of the authenticated user.
pub async fn current_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<UserInfo> {
    let user = state
        .repo
        .get_user(auth.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User does not exist".to_string()))?;
    success("Current user", user)
}
