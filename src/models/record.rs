//! Common envelope shared by games, characters and saves.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Sentinel local id of a record that has never been inserted.
pub const UNSAVED_ID: i64 = -1;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert wall-clock milliseconds to a UTC timestamp.
/// Lowercase hyphenated form of a uuid; text that is not a uuid comes back unchanged.
pub fn canonical_uuid(raw: &str) -> String {
    match uuid::Uuid::parse_str(raw) {
        Ok(parsed) => parsed.hyphenated().to_string(),
        Err(_) => raw.to_string(),
    }
}

pub fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// The three synchronized collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Games,
    Chars,
    Saves,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Games, Collection::Chars, Collection::Saves];

    /// Table name, identical in the device store and on the server.
    pub fn table(&self) -> &'static str {
        match self {
            Collection::Games => "games",
            Collection::Chars => "chars",
            Collection::Saves => "saves",
        }
    }

    /// Singular noun used in log lines and error messages.
    pub fn noun(&self) -> &'static str {
        match self {
            Collection::Games => "game",
            Collection::Chars => "char",
            Collection::Saves => "save",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Identity, tombstone and timestamps carried by every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Local storage identity, meaningless once synced.
    pub id: i64,
    pub uuid: String,
    pub remote_id: Option<i64>,
    pub archived: bool,
    pub archived_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Meta {
    pub fn new() -> Self {
        let now = now_ms();
        Self {
            id: UNSAVED_ID,
            uuid: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            archived: false,
            archived_at: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_unsaved(&self) -> bool {
        self.id == UNSAVED_ID
    }

    pub fn canonicalize_uuid(&mut self) {
        self.uuid = canonical_uuid(&self.uuid);
    }

    pub fn archive(&mut self, at: i64) {
        self.archived = true;
        self.archived_at = at;
    }

    pub fn unarchive(&mut self) {
        self.archived = false;
        self.archived_at = 0;
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}

/// A record stored locally and synchronized by uuid.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn meta(&self) -> &Meta;

    fn meta_mut(&mut self) -> &mut Meta;

    /// Uuid of the owning game, if this kind of record has one.
    fn game_ref(&self) -> Option<&str> {
        None
    }

    /// Uuid of the owning character, if this kind of record has one.
    fn char_ref(&self) -> Option<&str> {
        None
    }

    /// Save uuids referenced from slots.
    fn slot_refs(&self) -> &[String] {
        &[]
    }
}
