//! Save model.

use serde::{Deserialize, Serialize};

use super::{Collection, Meta, Record};

/// A snapshot of game state captured for a character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Save {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Opaque payload produced by the game runtime.
    pub data: String,
    /// Payload size in bytes.
    pub size: i64,
    pub hash: String,
    #[serde(default)]
    pub game_version: String,
    pub game_id: String,
    pub char_id: String,
}

impl Save {
    /// Build a save around a payload, filling in its size and content hash.
    pub fn from_payload(
        game_id: impl Into<String>,
        char_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        let data = data.into();
        Self {
            meta: Meta::new(),
            name: String::new(),
            description: String::new(),
            size: data.len() as i64,
            hash: content_hash(&data),
            data,
            game_version: String::new(),
            game_id: game_id.into(),
            char_id: char_id.into(),
        }
    }
}

/// Hex digest of a save payload.
pub fn content_hash(data: &str) -> String {
    blake3::hash(data.as_bytes()).to_hex().to_string()
}

impl Record for Save {
    const COLLECTION: Collection = Collection::Saves;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn game_ref(&self) -> Option<&str> {
        Some(&self.game_id)
    }

    fn char_ref(&self) -> Option<&str> {
        Some(&self.char_id)
    }
}
