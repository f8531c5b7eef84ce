//! Wire shapes exchanged with the sync server.
//!
//! Upload records carry boolean tombstones, RFC 3339 timestamps and
//! structured fields (paths, slots) serialized as JSON text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

fn empty_list() -> String {
    "[]".to_string()
}

fn enabled() -> bool {
    true
}

/// Fields common to every upload record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEnvelope {
    pub uuid: Uuid,
    #[serde(default)]
    pub archived: bool,
    #[serde(default = "epoch")]
    pub archived_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Access to the common envelope of an upload record.
pub trait UploadShape {
    fn envelope(&self) -> &UploadEnvelope;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUpload {
    #[serde(flatten)]
    pub envelope: UploadEnvelope,
    pub name: String,
    #[serde(default)]
    pub shortname: String,
    /// JSON array of `{url, label?}`.
    #[serde(default = "empty_list")]
    pub paths: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharUpload {
    #[serde(flatten)]
    pub envelope: UploadEnvelope,
    pub name: String,
    pub game_id: Uuid,
    /// JSON array of save uuids or empty strings.
    #[serde(default = "empty_list")]
    pub slots: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveUpload {
    #[serde(flatten)]
    pub envelope: UploadEnvelope,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub game_version: String,
    pub game_id: Uuid,
    pub char_id: Uuid,
    pub data: String,
    pub size: i64,
    pub hash: String,
}

impl UploadShape for GameUpload {
    fn envelope(&self) -> &UploadEnvelope {
        &self.envelope
    }
}

impl UploadShape for CharUpload {
    fn envelope(&self) -> &UploadEnvelope {
        &self.envelope
    }
}

impl UploadShape for SaveUpload {
    fn envelope(&self) -> &UploadEnvelope {
        &self.envelope
    }
}

/// A record as returned by the server: the upload shape plus server identity.
#[derive(Debug, Clone, Deserialize)]
pub struct Downloaded<T> {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(flatten)]
    pub record: T,
}

/// Body of `POST /api/sync/up` as built by the client.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncUpRequest {
    pub games: Vec<GameUpload>,
    pub chars: Vec<CharUpload>,
    pub saves: Vec<SaveUpload>,
}

impl SyncUpRequest {
    pub fn len(&self) -> usize {
        self.games.len() + self.chars.len() + self.saves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Body of `POST /api/sync/up` as received by the server; items are checked one by one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSyncUp {
    #[serde(default)]
    pub games: Vec<Value>,
    #[serde(default)]
    pub chars: Vec<Value>,
    #[serde(default)]
    pub saves: Vec<Value>,
}

/// `data` of a sync-up response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncUpResult {
    /// Per-record failures: structured validation errors or plain strings.
    #[serde(default)]
    pub errors: Vec<Value>,
}

/// Query of `GET /api/sync/down`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDownQuery {
    pub cutoff_point: DateTime<Utc>,
    #[serde(default = "enabled")]
    pub games: bool,
    #[serde(default = "enabled")]
    pub chars: bool,
    #[serde(default = "enabled")]
    pub saves: bool,
    /// Skip tombstones on a full (epoch cutoff) download.
    #[serde(default = "enabled")]
    pub exclude_archived: bool,
}

/// `data` of a sync-down response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncDownData {
    #[serde(default)]
    pub games: Vec<Value>,
    #[serde(default)]
    pub chars: Vec<Value>,
    #[serde(default)]
    pub saves: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Response envelope used by every server endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerResponse {
    pub status: Status,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ServerResponse {
    /// Human-readable form of `message`, which may be a string or a list of strings.
    pub fn message_text(&self) -> String {
        match &self.message {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("; "),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
