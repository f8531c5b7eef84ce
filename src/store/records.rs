//! Record operations on the device store.

use std::collections::HashSet;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};

use super::LocalStore;
use crate::errors::StoreError;
use crate::models::{canonical_uuid, now_ms, Character, Collection, Record, Save};

/// Outcome of writing a downloaded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The remote copy replaced (or created) the local record.
    Written,
    /// The local copy is newer; only the server identity was recorded.
    KeptLocal,
}

/// Rows removed by [`LocalStore::purge_archived_before`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub games: u64,
    pub chars: u64,
    pub saves: u64,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.games + self.chars + self.saves
    }
}

const COLUMNS: &str =
    "id, uuid, remote_id, archived, archived_at, created_at, updated_at, game_id, char_id, doc";

impl LocalStore {
    /// Write a record as-is, inserting or replacing by uuid. Assigns the local id.
    ///
    /// Uuids are stored in canonical form so a record keeps one row however
    /// its uuid was spelled.
    pub async fn put<R: Record>(&self, record: &mut R) -> Result<i64, StoreError> {
        record.meta_mut().canonicalize_uuid();
        let id = upsert(&self.pool, record).await?;
        record.meta_mut().id = id;
        Ok(id)
    }

    /// Commit a local edit: stamp `updatedAt`, write, and run the advisory checks.
    pub async fn commit<R: Record>(&self, record: &mut R) -> Result<i64, StoreError> {
        record.meta_mut().updated_at = now_ms();
        let id = self.put(record).await?;
        crate::validation::advise_on_commit(self, record).await;
        Ok(id)
    }

    /// Commit several edits of one collection in a single transaction.
    pub async fn bulk_commit<R: Record>(&self, records: &mut [R]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        for record in records.iter_mut() {
            record.meta_mut().canonicalize_uuid();
            record.meta_mut().updated_at = now;
            let id = upsert(&mut *tx, record).await?;
            record.meta_mut().id = id;
        }
        tx.commit().await?;

        tracing::debug!("Committed {} {}", records.len(), R::COLLECTION);
        Ok(())
    }

    /// Write a record received from the server.
    ///
    /// `updatedAt` is preserved so the record is not picked up by the next
    /// upload. A strictly newer local copy wins; in that case only the
    /// server identity is recorded.
    pub async fn put_synced<R: Record>(&self, mut record: R) -> Result<Applied, StoreError> {
        record.meta_mut().canonicalize_uuid();
        let table = R::COLLECTION.table();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT id, updated_at FROM {table} WHERE uuid = ?"
        ))
        .bind(&record.meta().uuid)
        .fetch_optional(&mut *tx)
        .await?;

        let applied = match existing {
            Some(row) if row.get::<i64, _>("updated_at") > record.meta().updated_at => {
                if let Some(remote_id) = record.meta().remote_id {
                    sqlx::query(&format!("UPDATE {table} SET remote_id = ? WHERE id = ?"))
                        .bind(remote_id)
                        .bind(row.get::<i64, _>("id"))
                        .execute(&mut *tx)
                        .await?;
                }
                Applied::KeptLocal
            }
            existing => {
                record.meta_mut().id = existing
                    .map(|row| row.get::<i64, _>("id"))
                    .unwrap_or(crate::models::UNSAVED_ID);
                upsert(&mut *tx, &record).await?;
                Applied::Written
            }
        };

        tx.commit().await?;
        Ok(applied)
    }

    pub async fn get<R: Record>(&self, id: i64) -> Result<Option<R>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = ?",
            R::COLLECTION.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row::<R>).transpose()
    }

    pub async fn find_by_uuid<R: Record>(&self, uuid: &str) -> Result<Option<R>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE uuid = ?",
            R::COLLECTION.table()
        ))
        .bind(canonical_uuid(uuid))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row::<R>).transpose()
    }

    /// All records of a collection, archived ones included.
    pub async fn list<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} ORDER BY id",
            R::COLLECTION.table()
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows))
    }

    /// Records with `updatedAt >= cutoff_ms`.
    pub async fn updated_since<R: Record>(&self, cutoff_ms: i64) -> Result<Vec<R>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE updated_at >= ? ORDER BY id",
            R::COLLECTION.table()
        ))
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows))
    }

    /// Non-archived characters of a game.
    pub async fn active_characters_of(&self, game_uuid: &str) -> Result<Vec<Character>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM chars WHERE game_id = ? AND archived = 0 ORDER BY id"
        ))
        .bind(game_uuid)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows))
    }

    /// Non-archived saves of a character.
    pub async fn active_saves_of(&self, char_uuid: &str) -> Result<Vec<Save>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM saves WHERE char_id = ? AND archived = 0 ORDER BY id"
        ))
        .bind(char_uuid)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows))
    }

    /// Uuids of the non-archived records of a collection.
    pub async fn active_uuids(&self, collection: Collection) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT uuid FROM {} WHERE archived = 0",
            collection.table()
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("uuid")).collect())
    }

    pub async fn count(&self, collection: Collection) -> Result<i64, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", collection.table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Whether a non-archived record with this uuid exists.
    pub async fn is_active(&self, collection: Collection, uuid: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE uuid = ? AND archived = 0",
            collection.table()
        ))
        .bind(canonical_uuid(uuid))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Physically remove a record, matching the uuid as spelled or in canonical form.
    /// Returns whether a row was deleted.
    pub async fn delete(&self, collection: Collection, uuid: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE uuid IN (?, ?)",
            collection.table()
        ))
        .bind(uuid)
        .bind(canonical_uuid(uuid))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every record archived strictly between the epoch and `cutoff_ms`.
    pub async fn purge_archived_before(&self, cutoff_ms: i64) -> Result<PurgeReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = [0u64; 3];
        for (slot, collection) in removed.iter_mut().zip(Collection::ALL) {
            let result = sqlx::query(&format!(
                "DELETE FROM {} WHERE archived_at > 0 AND archived_at < ?",
                collection.table()
            ))
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?;
            *slot = result.rows_affected();
        }
        tx.commit().await?;

        let report = PurgeReport {
            games: removed[0],
            chars: removed[1],
            saves: removed[2],
        };
        tracing::info!("Purged {} archived records", report.total());
        Ok(report)
    }

    /// Forget every server identity, e.g. before pointing the device at another account.
    pub async fn invalidate_remote_ids(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut cleared = 0;
        for collection in Collection::ALL {
            let result = sqlx::query(&format!(
                "UPDATE {} SET remote_id = NULL WHERE remote_id IS NOT NULL",
                collection.table()
            ))
            .execute(&mut *tx)
            .await?;
            cleared += result.rows_affected();
        }
        tx.commit().await?;

        tracing::info!("Cleared {} remote ids", cleared);
        Ok(cleared)
    }
}

/// Insert or replace a record by uuid, returning its local id.
pub(super) async fn upsert<'e, E, R>(executor: E, record: &R) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
    R: Record,
{
    let meta = record.meta();
    let doc = serde_json::to_string(record)?;
    let sql = format!(
        r#"INSERT INTO {} (uuid, remote_id, archived, archived_at, created_at, updated_at, game_id, char_id, doc)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(uuid) DO UPDATE SET
            remote_id = excluded.remote_id,
            archived = excluded.archived,
            archived_at = excluded.archived_at,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            game_id = excluded.game_id,
            char_id = excluded.char_id,
            doc = excluded.doc
        RETURNING id"#,
        R::COLLECTION.table()
    );

    let row = sqlx::query(&sql)
        .bind(&meta.uuid)
        .bind(meta.remote_id)
        .bind(meta.archived as i32)
        .bind(meta.archived_at)
        .bind(meta.created_at)
        .bind(meta.updated_at)
        .bind(record.game_ref())
        .bind(record.char_ref())
        .bind(&doc)
        .fetch_one(executor)
        .await?;

    Ok(row.get("id"))
}

// Helper functions for row conversion

/// Decode a row; the envelope columns override whatever the stored document says.
fn record_from_row<R: Record>(row: &SqliteRow) -> Result<R, StoreError> {
    let doc: String = row.get("doc");
    let mut record: R = serde_json::from_str(&doc)?;
    let archived: i32 = row.get("archived");

    let meta = record.meta_mut();
    meta.id = row.get("id");
    meta.uuid = row.get("uuid");
    meta.remote_id = row.get("remote_id");
    meta.archived = archived != 0;
    meta.archived_at = row.get("archived_at");
    meta.created_at = row.get("created_at");
    meta.updated_at = row.get("updated_at");
    Ok(record)
}

fn decode_rows<R: Record>(rows: &[SqliteRow]) -> Vec<R> {
    rows.iter()
        .filter_map(|row| match record_from_row(row) {
            Ok(record) => Some(record),
            Err(e) => {
                let uuid: String = row.get("uuid");
                tracing::warn!("Skipping undecodable {} {}: {}", R::COLLECTION.noun(), uuid, e);
                None
            }
        })
        .collect()
}
