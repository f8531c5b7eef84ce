//! Sync endpoints.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde_json::{json, Value};

use super::{success, ApiResult};
use crate::auth::AuthContext;
use crate::errors::AppError;
use crate::models::{
    Character, Game, RawSyncUp, Record, Role, Save, SyncDownData, SyncDownQuery, SyncUpResult,
    UploadShape,
};
use crate::validation::{decode_upload, SyncShape};
use crate::AppState;

/// Validate and store one collection of an upload. Failures are collected, never fatal.
async fn store_uploads<R: SyncShape>(
    state: &AppState,
    owner_id: i64,
    values: Vec<Value>,
    errors: &mut Vec<Value>,
) -> usize {
    let mut stored = 0;
    for value in values {
        let upload = match decode_upload::<R>(value) {
            Ok(upload) => upload,
            Err(e) => {
                errors.push(json!({
                    "collection": e.collection,
                    "uuid": e.uuid,
                    "issues": e.issues,
                }));
                continue;
            }
        };
        let uuid = upload.envelope().uuid;
        match state
            .repo
            .upsert_record(owner_id, R::COLLECTION, &upload)
            .await
        {
            Ok(()) => stored += 1,
            Err(e) => {
                tracing::warn!("Sync up failed for {} {}: {}", R::COLLECTION.noun(), uuid, e);
                errors.push(Value::String(format!(
                    "Database error on {} {}",
                    R::COLLECTION.noun(),
                    uuid
                )));
            }
        }
    }
    stored
}

/// POST /api/sync/up - Upsert the caller's changed records.
///
/// Restricted accounts may download but not upload.
pub async fn sync_up(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RawSyncUp>,
) -> ApiResult<SyncUpResult> {
    if auth.role == Role::Restricted {
        return Err(AppError::Forbidden("Account is restricted".to_string()));
    }

    let (games, chars, saves) = (body.games.len(), body.chars.len(), body.saves.len());
    let mut errors = Vec::new();

    let mut stored = store_uploads::<Game>(&state, auth.user_id, body.games, &mut errors).await;
    stored += store_uploads::<Character>(&state, auth.user_id, body.chars, &mut errors).await;
    stored += store_uploads::<Save>(&state, auth.user_id, body.saves, &mut errors).await;

    tracing::info!(
        "Sync uploaded {}g, {}c, {}s for user {}. Errors [{}]",
        games,
        chars,
        saves,
        auth.user_id,
        errors.len()
    );
    success(format!("Synced {} records", stored), SyncUpResult { errors })
}

/// GET /api/sync/down - The caller's records changed since the cutoff.
pub async fn sync_down(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<SyncDownQuery>,
) -> ApiResult<SyncDownData> {
    let cutoff_ms = query.cutoff_point.timestamp_millis();
    let mut data = SyncDownData::default();

    for (enabled, collection, target) in [
        (query.games, Game::COLLECTION, &mut data.games),
        (query.chars, Character::COLLECTION, &mut data.chars),
        (query.saves, Save::COLLECTION, &mut data.saves),
    ] {
        if enabled {
            *target = state
                .repo
                .records_since(auth.user_id, collection, cutoff_ms, query.exclude_archived)
                .await?;
        }
    }

    tracing::info!(
        "Sync downloaded {}g, {}c, {}s for user {}",
        data.games.len(),
        data.chars.len(),
        data.saves.len(),
        auth.user_id
    );
    success("Synced", data)
}
