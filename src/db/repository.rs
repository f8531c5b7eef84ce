//! Database repository for accounts, sessions and synced records.
//!
//! Uses prepared statements and transactions for data integrity.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::auth::{self, TokenKind};
use crate::errors::AppError;
use crate::models::{Collection, Role, SessionInfo, SessionTokens, UploadShape, UserInfo};

/// Account row including the password hash.
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub info: UserInfo,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub displayname: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

/// An issued token pair as stored, with the state of its session.
#[derive(Debug, Clone)]
pub struct TokenRow {
    pub id: i64,
    pub session_id: i64,
    pub user_id: i64,
    pub access_hash: String,
    pub refresh_hash: String,
    pub active: bool,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
    pub session_active: bool,
}

/// Database repository for all data operations.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ==================== USER OPERATIONS ====================

    pub async fn username_taken(&self, username: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn email_taken(&self, email: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Create a new account.
    pub async fn create_user(&self, user: &NewUser) -> Result<UserInfo, AppError> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            "INSERT INTO users (username, displayname, email, email_confirmed, password_hash, role, created_at) VALUES (?, ?, ?, 0, ?, ?, ?) RETURNING id",
        )
        .bind(&user.username)
        .bind(&user.displayname)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok(UserInfo {
            id: row.get("id"),
            username: user.username.clone(),
            displayname: user.displayname.clone(),
            email: user.email.clone(),
            email_confirmed: false,
            role: user.role,
        })
    }

    /// Find an account by username or email.
    pub async fn find_user_by_login(&self, login: &str) -> Result<Option<StoredUser>, AppError> {
        let row = sqlx::query(
            "SELECT id, username, displayname, email, email_confirmed, password_hash, role FROM users WHERE username = ? OR email = ? ORDER BY username = ? DESC LIMIT 1",
        )
        .bind(login)
        .bind(login)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredUser {
            info: user_from_row(&row),
            password_hash: row.get("password_hash"),
        }))
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<UserInfo>, AppError> {
        let row = sqlx::query(
            "SELECT id, username, displayname, email, email_confirmed, role FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(user_from_row))
    }

    // ==================== SESSION OPERATIONS ====================

    /// Start a new session line for a user.
    pub async fn create_session(&self, user_id: i64) -> Result<i64, AppError> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            "INSERT INTO sessions (user_id, active, created_at) VALUES (?, 1, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    /// Issue a fresh token pair within a session.
    pub async fn issue_tokens(
        &self,
        session_id: i64,
        user_id: i64,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<SessionTokens, AppError> {
        let now = Utc::now();
        let access_expires_at = now + to_delta(access_ttl)?;
        let refresh_expires_at = now + to_delta(refresh_ttl)?;
        let access_secret = auth::generate_secret();
        let refresh_secret = auth::generate_secret();

        let row = sqlx::query(
            r#"INSERT INTO session_tokens
                (session_id, user_id, access_hash, refresh_hash, active, access_expires_at, refresh_expires_at, created_at)
            VALUES (?, ?, ?, ?, 1, ?, ?, ?) RETURNING id"#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(auth::hash_secret(&access_secret))
        .bind(auth::hash_secret(&refresh_secret))
        .bind(access_expires_at.timestamp_millis())
        .bind(refresh_expires_at.timestamp_millis())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        let id: i64 = row.get("id");

        Ok(SessionTokens {
            session_id,
            session_token_id: id,
            access_token: auth::format_token(TokenKind::Access, id, &access_secret),
            refresh_token: auth::format_token(TokenKind::Refresh, id, &refresh_secret),
            access_expires_at,
            refresh_expires_at,
        })
    }

    pub async fn get_token(&self, id: i64) -> Result<Option<TokenRow>, AppError> {
        let row = sqlx::query(
            r#"SELECT t.id, t.session_id, t.user_id, t.access_hash, t.refresh_hash, t.active,
                t.access_expires_at, t.refresh_expires_at, s.active AS session_active
            FROM session_tokens t JOIN sessions s ON s.id = t.session_id
            WHERE t.id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(token_from_row))
    }

    /// Mark a refresh token spent. Returns false if it already was.
    pub async fn consume_refresh_token(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE session_tokens SET active = 0 WHERE id = ? AND active = 1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// End a session line; every token issued in it stops working.
    pub async fn deactivate_session(&self, session_id: i64) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE sessions SET active = 0 WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE session_tokens SET active = 0 WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Active session lines of a user, oldest first.
    pub async fn list_sessions(&self, user_id: i64) -> Result<Vec<SessionInfo>, AppError> {
        let rows = sqlx::query(
            r#"SELECT s.id, s.created_at,
                (SELECT COUNT(*) FROM session_tokens t WHERE t.session_id = s.id AND t.active = 1) AS active_tokens
            FROM sessions s
            WHERE s.user_id = ? AND s.active = 1
            ORDER BY s.id"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(session_from_row).collect())
    }

    /// End one of a user's session lines. Returns false if the user has no such active line.
    pub async fn revoke_session(&self, user_id: i64, session_id: i64) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE sessions SET active = 0 WHERE id = ? AND user_id = ? AND active = 1")
            .bind(session_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("UPDATE session_tokens SET active = 0 WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    // ==================== RECORD OPERATIONS ====================

    /// Insert or update a record by `(owner, uuid)`. An older `updatedAt` never overwrites a newer one.
    pub async fn upsert_record<U: UploadShape + Serialize>(
        &self,
        owner_id: i64,
        collection: Collection,
        upload: &U,
    ) -> Result<(), AppError> {
        let envelope = upload.envelope();
        let doc = serde_json::to_string(upload)?;
        let table = collection.table();

        sqlx::query(&format!(
            r#"INSERT INTO {table} (owner_id, uuid, archived, archived_at, created_at, updated_at, doc)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id, uuid) DO UPDATE SET
                archived = excluded.archived,
                archived_at = excluded.archived_at,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                doc = excluded.doc
            WHERE excluded.updated_at >= {table}.updated_at"#
        ))
        .bind(owner_id)
        .bind(envelope.uuid.to_string())
        .bind(envelope.archived as i32)
        .bind(envelope.archived_at.timestamp_millis())
        .bind(envelope.created_at.timestamp_millis())
        .bind(envelope.updated_at.timestamp_millis())
        .bind(&doc)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records of an owner with `updatedAt >= cutoff_ms`, each carrying its server `id`.
    ///
    /// Archived records are left out of a full (epoch) download when `exclude_archived` is set.
    pub async fn records_since(
        &self,
        owner_id: i64,
        collection: Collection,
        cutoff_ms: i64,
        exclude_archived: bool,
    ) -> Result<Vec<Value>, AppError> {
        let archive_filter = if cutoff_ms <= 0 && exclude_archived {
            " AND archived = 0"
        } else {
            ""
        };
        let rows = sqlx::query(&format!(
            "SELECT id, doc FROM {} WHERE owner_id = ? AND updated_at >= ?{} ORDER BY id",
            collection.table(),
            archive_filter
        ))
        .bind(owner_id)
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

// Helper functions for row conversion

fn to_delta(ttl: Duration) -> Result<chrono::Duration, AppError> {
    chrono::Duration::from_std(ttl)
        .map_err(|_| AppError::Internal("Token lifetime out of range".to_string()))
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> UserInfo {
    let email_confirmed: i32 = row.get("email_confirmed");
    let role: String = row.get("role");
    UserInfo {
        id: row.get("id"),
        username: row.get("username"),
        displayname: row.get("displayname"),
        email: row.get("email"),
        email_confirmed: email_confirmed != 0,
        role: Role::parse(&role).unwrap_or_default(),
    }
}

fn token_from_row(row: &sqlx::sqlite::SqliteRow) -> TokenRow {
    let active: i32 = row.get("active");
    let session_active: i32 = row.get("session_active");
    TokenRow {
        id: row.get("id"),
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        access_hash: row.get("access_hash"),
        refresh_hash: row.get("refresh_hash"),
        active: active != 0,
        access_expires_at: row.get("access_expires_at"),
        refresh_expires_at: row.get("refresh_expires_at"),
        session_active: session_active != 0,
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> SessionInfo {
    SessionInfo {
        id: row.get("id"),
        created_at: row.get("created_at"),
        active_tokens: row.get("active_tokens"),
        current: false,
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Value, AppError> {
    let id: i64 = row.get("id");
    let doc: String = row.get("doc");
    let mut value: Value = serde_json::from_str(&doc)?;
    if let Value::Object(map) = &mut value {
        map.insert("id".to_string(), Value::from(id));
    }
    Ok(value)
}
