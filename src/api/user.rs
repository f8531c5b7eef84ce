//! Session lines of the signed-in account.

use axum::{
    extract::{Path, State},
    Extension,
};

use super::{done, success, ApiResult};
use crate::auth::AuthContext;
use crate::errors::AppError;
use crate::models::SessionInfo;
use crate::AppState;

/// GET /api/user/sessions - List the account's active session lines.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Vec<SessionInfo>> {
    let mut sessions = state.repo.list_sessions(auth.user_id).await?;
    for session in &mut sessions {
        session.current = session.id == auth.session_id;
    }
    success("Sessions", sessions)
}

/// DELETE /api/user/session/{id} - End one of the account's session lines.
pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(session_id): Path<i64>,
) -> ApiResult<()> {
    if !state.repo.revoke_session(auth.user_id, session_id).await? {
        return Err(AppError::NotFound("Session does not exist".to_string()));
    }
    tracing::info!("User {} revoked session {}", auth.user_id, session_id);
    done("Session revoked")
}
