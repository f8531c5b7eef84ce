//! Record validation.
//!
//! Conversions between local records and their wire shapes, the content
//! limits enforced by the server, and the consistency checks run at commit
//! time and in batch.

mod consistency;

pub use consistency::*;

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::ValidationError;
use crate::models::{
    ms_to_datetime, CharUpload, Character, Collection, Downloaded, Game, GamePath, GameUpload,
    Meta, Record, Save, SaveUpload, SyncDownData, SyncUpRequest, UploadEnvelope, UploadShape,
    UNSAVED_ID,
};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 256;
pub const MAX_URL_LEN: usize = 256;
pub const MAX_HASH_LEN: usize = 256;
pub const MAX_SAVE_BYTES: usize = 1_000_000;

/// A record kind that has an upload and a download shape.
pub trait SyncShape: Record {
    type Upload: Serialize + DeserializeOwned + UploadShape + Send;

    /// Convert to the upload shape, failing on structurally invalid fields.
    fn to_upload(&self) -> Result<Self::Upload, ValidationError>;

    /// Rebuild a local record from its wire shape. The local id is left unsaved.
    fn from_upload(upload: Self::Upload, remote_id: Option<i64>) -> Result<Self, ValidationError>;

    /// Content limits the server enforces on accepted records.
    fn limit_issues(upload: &Self::Upload) -> Vec<String>;

    fn push_upload(request: &mut SyncUpRequest, upload: Self::Upload);

    fn take_download(data: &mut SyncDownData) -> Vec<Value>;
}

/// Collects field issues for one record.
struct Issues {
    collection: Collection,
    uuid: String,
    list: Vec<String>,
}

impl Issues {
    fn new(collection: Collection, uuid: impl Into<String>) -> Self {
        Self {
            collection,
            uuid: uuid.into(),
            list: Vec::new(),
        }
    }

    fn push(&mut self, field: &str, problem: impl Display) {
        self.list.push(format!("{field}: {problem}"));
    }

    fn uuid(&mut self, field: &str, value: &str) -> Uuid {
        Uuid::parse_str(value).unwrap_or_else(|_| {
            self.push(field, "not a valid uuid");
            Uuid::nil()
        })
    }

    fn datetime(&mut self, field: &str, ms: i64) -> DateTime<Utc> {
        match ms_to_datetime(ms) {
            Some(at) if ms >= 0 => at,
            _ => {
                self.push(field, format!("invalid timestamp {ms}"));
                DateTime::UNIX_EPOCH
            }
        }
    }

    fn millis(&mut self, field: &str, at: DateTime<Utc>) -> i64 {
        let ms = at.timestamp_millis();
        if ms < 0 {
            self.push(field, "before the epoch");
        }
        ms
    }

    fn finish<T>(self, value: T) -> Result<T, ValidationError> {
        if self.list.is_empty() {
            Ok(value)
        } else {
            Err(ValidationError {
                collection: self.collection,
                uuid: self.uuid,
                issues: self.list,
            })
        }
    }
}

fn envelope_from_meta(meta: &Meta, issues: &mut Issues) -> UploadEnvelope {
    UploadEnvelope {
        uuid: issues.uuid("uuid", &meta.uuid),
        archived: meta.archived,
        archived_at: issues.datetime("archivedAt", meta.archived_at),
        updated_at: issues.datetime("updatedAt", meta.updated_at),
        created_at: issues.datetime("createdAt", meta.created_at),
    }
}

fn meta_from_envelope(
    envelope: &UploadEnvelope,
    remote_id: Option<i64>,
    issues: &mut Issues,
) -> Meta {
    Meta {
        id: UNSAVED_ID,
        uuid: envelope.uuid.to_string(),
        remote_id,
        archived: envelope.archived,
        archived_at: issues.millis("archivedAt", envelope.archived_at),
        created_at: issues.millis("createdAt", envelope.created_at),
        updated_at: issues.millis("updatedAt", envelope.updated_at),
    }
}

fn check_len(issues: &mut Vec<String>, field: &str, value: &str, max: usize) {
    if value.chars().count() > max {
        issues.push(format!("{field}: cannot be longer than {max} characters"));
    }
}

fn json_text<T: Serialize>(issues: &mut Issues, field: &str, value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        issues.push(field, e);
        "[]".to_string()
    })
}

impl SyncShape for Game {
    type Upload = GameUpload;

    fn to_upload(&self) -> Result<GameUpload, ValidationError> {
        let mut issues = Issues::new(Collection::Games, &self.meta.uuid);
        let envelope = envelope_from_meta(&self.meta, &mut issues);
        let paths = json_text(&mut issues, "paths", &self.paths);
        issues.finish(GameUpload {
            envelope,
            name: self.name.clone(),
            shortname: self.shortname.clone(),
            paths,
        })
    }

    fn from_upload(upload: GameUpload, remote_id: Option<i64>) -> Result<Self, ValidationError> {
        let mut issues = Issues::new(Collection::Games, upload.envelope.uuid.to_string());
        let meta = meta_from_envelope(&upload.envelope, remote_id, &mut issues);
        let paths: Vec<GamePath> = serde_json::from_str(&upload.paths).unwrap_or_else(|e| {
            issues.push("paths", e);
            Vec::new()
        });
        issues.finish(Game {
            meta,
            name: upload.name,
            shortname: upload.shortname,
            paths,
        })
    }

    fn limit_issues(upload: &GameUpload) -> Vec<String> {
        let mut issues = Vec::new();
        check_len(&mut issues, "name", &upload.name, MAX_NAME_LEN);
        check_len(&mut issues, "shortname", &upload.shortname, MAX_NAME_LEN);
        match serde_json::from_str::<Vec<GamePath>>(&upload.paths) {
            Ok(paths) => {
                for (i, path) in paths.iter().enumerate() {
                    if path.url.is_empty() {
                        issues.push(format!("paths[{i}].url: cannot be empty"));
                    }
                    check_len(&mut issues, &format!("paths[{i}].url"), &path.url, MAX_URL_LEN);
                    if let Some(label) = &path.label {
                        check_len(&mut issues, &format!("paths[{i}].label"), label, MAX_NAME_LEN);
                    }
                }
            }
            Err(e) => issues.push(format!("paths: {e}")),
        }
        issues
    }

    fn push_upload(request: &mut SyncUpRequest, upload: GameUpload) {
        request.games.push(upload);
    }

    fn take_download(data: &mut SyncDownData) -> Vec<Value> {
        std::mem::take(&mut data.games)
    }
}

impl SyncShape for Character {
    type Upload = CharUpload;

    fn to_upload(&self) -> Result<CharUpload, ValidationError> {
        let mut issues = Issues::new(Collection::Chars, &self.meta.uuid);
        let envelope = envelope_from_meta(&self.meta, &mut issues);
        let game_id = issues.uuid("gameId", &self.game_id);
        for (i, slot) in self.slots.iter().enumerate() {
            if !slot.is_empty() && Uuid::parse_str(slot).is_err() {
                issues.push(&format!("slots[{i}]"), "not a valid uuid");
            }
        }
        let slots = json_text(&mut issues, "slots", &self.slots);
        issues.finish(CharUpload {
            envelope,
            name: self.name.clone(),
            game_id,
            slots,
        })
    }

    fn from_upload(upload: CharUpload, remote_id: Option<i64>) -> Result<Self, ValidationError> {
        let mut issues = Issues::new(Collection::Chars, upload.envelope.uuid.to_string());
        let meta = meta_from_envelope(&upload.envelope, remote_id, &mut issues);
        let slots: Vec<String> = serde_json::from_str(&upload.slots).unwrap_or_else(|e| {
            issues.push("slots", e);
            Vec::new()
        });
        issues.finish(Character {
            meta,
            name: upload.name,
            game_id: upload.game_id.to_string(),
            slots,
        })
    }

    fn limit_issues(upload: &CharUpload) -> Vec<String> {
        let mut issues = Vec::new();
        check_len(&mut issues, "name", &upload.name, MAX_NAME_LEN);
        match serde_json::from_str::<Vec<String>>(&upload.slots) {
            Ok(slots) => {
                for (i, slot) in slots.iter().enumerate() {
                    if !slot.is_empty() && Uuid::parse_str(slot).is_err() {
                        issues.push(format!("slots[{i}]: not a valid uuid"));
                    }
                }
            }
            Err(e) => issues.push(format!("slots: {e}")),
        }
        issues
    }

    fn push_upload(request: &mut SyncUpRequest, upload: CharUpload) {
        request.chars.push(upload);
    }

    fn take_download(data: &mut SyncDownData) -> Vec<Value> {
        std::mem::take(&mut data.chars)
    }
}

impl SyncShape for Save {
    type Upload = SaveUpload;

    fn to_upload(&self) -> Result<SaveUpload, ValidationError> {
        let mut issues = Issues::new(Collection::Saves, &self.meta.uuid);
        let envelope = envelope_from_meta(&self.meta, &mut issues);
        let game_id = issues.uuid("gameId", &self.game_id);
        let char_id = issues.uuid("charId", &self.char_id);
        if self.size < 0 {
            issues.push("size", "cannot be negative");
        }
        issues.finish(SaveUpload {
            envelope,
            name: self.name.clone(),
            description: self.description.clone(),
            game_version: self.game_version.clone(),
            game_id,
            char_id,
            data: self.data.clone(),
            size: self.size,
            hash: self.hash.clone(),
        })
    }

    fn from_upload(upload: SaveUpload, remote_id: Option<i64>) -> Result<Self, ValidationError> {
        let mut issues = Issues::new(Collection::Saves, upload.envelope.uuid.to_string());
        let meta = meta_from_envelope(&upload.envelope, remote_id, &mut issues);
        if upload.size < 0 {
            issues.push("size", "cannot be negative");
        }
        issues.finish(Save {
            meta,
            name: upload.name,
            description: upload.description,
            data: upload.data,
            size: upload.size,
            hash: upload.hash,
            game_version: upload.game_version,
            game_id: upload.game_id.to_string(),
            char_id: upload.char_id.to_string(),
        })
    }

    fn limit_issues(upload: &SaveUpload) -> Vec<String> {
        let mut issues = Vec::new();
        check_len(&mut issues, "name", &upload.name, MAX_NAME_LEN);
        check_len(&mut issues, "description", &upload.description, MAX_DESCRIPTION_LEN);
        check_len(&mut issues, "hash", &upload.hash, MAX_HASH_LEN);
        if upload.data.len() > MAX_SAVE_BYTES {
            issues.push("data: a save cannot exceed 1mb".to_string());
        }
        issues
    }

    fn push_upload(request: &mut SyncUpRequest, upload: SaveUpload) {
        request.saves.push(upload);
    }

    fn take_download(data: &mut SyncDownData) -> Vec<Value> {
        std::mem::take(&mut data.saves)
    }
}

fn uuid_hint(value: &Value) -> String {
    value
        .get("uuid")
        .and_then(Value::as_str)
        .unwrap_or("?")
        .to_string()
}

/// Decode a record received from the server. The server `id` becomes the remote id.
pub fn decode_download<R: SyncShape>(value: Value) -> Result<R, ValidationError> {
    let uuid = uuid_hint(&value);
    let downloaded: Downloaded<R::Upload> =
        serde_json::from_value(value).map_err(|e| ValidationError {
            collection: R::COLLECTION,
            uuid,
            issues: vec![e.to_string()],
        })?;
    R::from_upload(downloaded.record, downloaded.id)
}

/// Decode and limit-check a record submitted for upload.
pub fn decode_upload<R: SyncShape>(value: Value) -> Result<R::Upload, ValidationError> {
    let uuid = uuid_hint(&value);
    let upload: R::Upload = serde_json::from_value(value).map_err(|e| ValidationError {
        collection: R::COLLECTION,
        uuid: uuid.clone(),
        issues: vec![e.to_string()],
    })?;
    let issues = R::limit_issues(&upload);
    if issues.is_empty() {
        Ok(upload)
    } else {
        Err(ValidationError {
            collection: R::COLLECTION,
            uuid,
            issues,
        })
    }
}
