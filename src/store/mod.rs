//! Device-local store for games, characters and saves.
//!
//! Each collection is a table keyed by uuid. The envelope fields live in
//! indexed columns; the full record is kept as JSON in `doc`. A small
//! key/value `meta` table carries the persisted session, the last sync
//! cutoff and the most-recently-used pointers. The record tables can be
//! exported to and imported from a single JSON document.

mod backup;
mod records;

pub use backup::*;
pub use records::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::errors::StoreError;
use crate::models::Collection;

/// Keys of the `meta` table.
pub mod keys {
    pub const SESSION: &str = "session";
    pub const LAST_COMMIT: &str = "lastCommit";
    pub const LAST_GAME: &str = "lastGame";
    pub const LAST_CHAR: &str = "lastChar";
    /// JSON export taken before the last repair.
    pub const REPAIR_BACKUP: &str = "repairBackup";
}

/// Handle to the device store.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the store at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        run_migrations(&pool).await?;

        Ok(Self::new(pool))
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== META ====================

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_meta(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM meta WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cutoff of the next incremental sync, in ms; 0 when never synced.
    pub async fn last_commit(&self) -> Result<i64, StoreError> {
        Ok(self
            .get_meta(keys::LAST_COMMIT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn set_last_commit(&self, at_ms: i64) -> Result<(), StoreError> {
        self.set_meta(keys::LAST_COMMIT, &at_ms.to_string()).await
    }

    pub async fn last_game(&self) -> Result<Option<String>, StoreError> {
        self.get_meta(keys::LAST_GAME).await
    }

    pub async fn set_last_game(&self, uuid: &str) -> Result<(), StoreError> {
        self.set_meta(keys::LAST_GAME, uuid).await
    }

    pub async fn last_char(&self) -> Result<Option<String>, StoreError> {
        self.get_meta(keys::LAST_CHAR).await
    }

    pub async fn set_last_char(&self, uuid: &str) -> Result<(), StoreError> {
        self.set_meta(keys::LAST_CHAR, uuid).await
    }
}

/// Run store migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    for collection in Collection::ALL {
        let table = collection.table();
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                remote_id INTEGER,
                archived INTEGER NOT NULL DEFAULT 0,
                archived_at INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                game_id TEXT,
                char_id TEXT,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_updated_at ON {table}(updated_at);
            CREATE INDEX IF NOT EXISTS idx_{table}_archived ON {table}(archived);
            CREATE INDEX IF NOT EXISTS idx_{table}_game_id ON {table}(game_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_char_id ON {table}(char_id);
            "#
        );
        sqlx::query(&ddl).execute(pool).await?;
    }

    Ok(())
}
