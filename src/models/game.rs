//! Game model.

use serde::{Deserialize, Serialize};

use super::{Collection, Meta, Record};

/// A launch location for a game, with an optional label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamePath {
    pub url: String,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl GamePath {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: None,
        }
    }

    pub fn labeled(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: Some(label.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
    #[serde(default)]
    pub shortname: String,
    #[serde(default)]
    pub paths: Vec<GamePath>,
}

impl Game {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: Meta::new(),
            name: name.into(),
            shortname: String::new(),
            paths: Vec::new(),
        }
    }
}

impl Record for Game {
    const COLLECTION: Collection = Collection::Games;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}
