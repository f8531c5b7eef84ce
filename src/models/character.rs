//! Character model.

use serde::{Deserialize, Serialize};

use super::{Collection, Meta, Record};

/// A playthrough of a game, holding an ordered list of save slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
    /// Uuid of the owning game.
    pub game_id: String,
    /// Save uuids; an empty string marks an empty slot.
    #[serde(default)]
    pub slots: Vec<String>,
}

impl Character {
    pub fn new(game_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: Meta::new(),
            name: name.into(),
            game_id: game_id.into(),
            slots: Vec::new(),
        }
    }
}

impl Record for Character {
    const COLLECTION: Collection = Collection::Chars;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn game_ref(&self) -> Option<&str> {
        Some(&self.game_id)
    }

    fn slot_refs(&self) -> &[String] {
        &self.slots
    }
}
