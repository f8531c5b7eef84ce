//! JSON export and import of the record tables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::LocalStore;
use crate::errors::StoreError;
use crate::models::{now_ms, Character, Game, Record, Save};

/// Every record of the store, archived ones included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreExport {
    pub exported_at: i64,
    #[serde(default)]
    pub games: Vec<Game>,
    #[serde(default)]
    pub chars: Vec<Character>,
    #[serde(default)]
    pub saves: Vec<Save>,
}

impl StoreExport {
    pub fn len(&self) -> usize {
        self.games.len() + self.chars.len() + self.saves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalStore {
    pub async fn export(&self) -> Result<StoreExport, StoreError> {
        Ok(StoreExport {
            exported_at: now_ms(),
            games: self.list().await?,
            chars: self.list().await?,
            saves: self.list().await?,
        })
    }

    /// The whole store as a JSON document.
    pub async fn export_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&self.export().await?)?)
    }

    /// Write records from an export, replacing local copies by uuid.
    ///
    /// Timestamps are kept as exported. Returns the number of records written.
    pub async fn import(&self, export: StoreExport) -> Result<usize, StoreError> {
        let total = export.len();
        let mut tx = self.pool.begin().await?;
        for mut game in export.games {
            write_imported(&mut tx, &mut game).await?;
        }
        for mut ch in export.chars {
            write_imported(&mut tx, &mut ch).await?;
        }
        for mut save in export.saves {
            write_imported(&mut tx, &mut save).await?;
        }
        tx.commit().await?;

        tracing::info!("Imported {} records", total);
        Ok(total)
    }

    pub async fn import_json(&self, text: &str) -> Result<usize, StoreError> {
        let export: StoreExport = serde_json::from_str(text)?;
        self.import(export).await
    }

    pub async fn export_to(&self, path: &Path) -> Result<usize, StoreError> {
        let export = self.export().await?;
        let count = export.len();
        tokio::fs::write(path, serde_json::to_vec_pretty(&export)?).await?;
        Ok(count)
    }

    pub async fn import_from(&self, path: &Path) -> Result<usize, StoreError> {
        let text = tokio::fs::read_to_string(path).await?;
        self.import_json(&text).await
    }
}

async fn write_imported<R: Record>(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &mut R,
) -> Result<(), StoreError> {
    record.meta_mut().canonicalize_uuid();
    super::records::upsert(&mut **tx, record).await?;
    Ok(())
}
