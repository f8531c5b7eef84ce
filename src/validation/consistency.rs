//! Referential consistency of the device store.
//!
//! A [`ConsistencySnapshot`] holds the uuids of every non-archived record.
//! Checks are advisory at commit time and exhaustive in
//! [`consistency_pass`]; [`repair`] is the explicit opt-in fix-up.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{content_hash, Character, Collection, Game, Record, Save, UNSAVED_ID};
use crate::store::{keys, LocalStore};

/// Uuids of the non-archived records, per collection.
#[derive(Debug, Clone, Default)]
pub struct ConsistencySnapshot {
    pub games: HashSet<String>,
    pub chars: HashSet<String>,
    pub saves: HashSet<String>,
}

/// What is wrong with a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum IssueKind {
    InvalidUuid,
    NegativeTimestamp { field: &'static str },
    MissingGame { uuid: String },
    MissingCharacter { uuid: String },
    DanglingSlot { index: usize, uuid: String },
    MalformedSlot { index: usize },
    EmptyPathUrl { index: usize },
    MissingHash,
}

impl IssueKind {
    /// Issues a record cannot be repaired from.
    pub fn is_dangling_parent(&self) -> bool {
        matches!(
            self,
            IssueKind::MissingGame { .. } | IssueKind::MissingCharacter { .. }
        )
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::InvalidUuid => write!(f, "invalid uuid"),
            IssueKind::NegativeTimestamp { field } => write!(f, "negative {field}"),
            IssueKind::MissingGame { uuid } => write!(f, "game {uuid} missing or archived"),
            IssueKind::MissingCharacter { uuid } => {
                write!(f, "character {uuid} missing or archived")
            }
            IssueKind::DanglingSlot { index, uuid } => {
                write!(f, "slot {index} points at missing save {uuid}")
            }
            IssueKind::MalformedSlot { index } => write!(f, "slot {index} is not a uuid"),
            IssueKind::EmptyPathUrl { index } => write!(f, "path {index} has no url"),
            IssueKind::MissingHash => write!(f, "missing content hash"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyIssue {
    pub collection: Collection,
    pub uuid: String,
    #[serde(flatten)]
    pub kind: IssueKind,
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.collection.noun(), self.uuid, self.kind)
    }
}

/// Record kinds with per-field checks and fix-ups.
pub trait Checkable: Record {
    fn field_issues(&self, snapshot: &ConsistencySnapshot) -> Vec<IssueKind>;

    /// Reset invalid fields to defaults. Returns whether anything changed.
    fn repair_fields(&mut self, snapshot: &ConsistencySnapshot) -> bool;
}

impl ConsistencySnapshot {
    pub async fn capture(store: &LocalStore) -> Result<Self, StoreError> {
        Ok(Self {
            games: store.active_uuids(Collection::Games).await?,
            chars: store.active_uuids(Collection::Chars).await?,
            saves: store.active_uuids(Collection::Saves).await?,
        })
    }

    /// Snapshot holding only the referenced uuids of `record` that resolve.
    pub async fn capture_refs<R: Record>(store: &LocalStore, record: &R) -> Result<Self, StoreError> {
        let mut snapshot = Self::default();
        if let Some(game) = record.game_ref() {
            if store.is_active(Collection::Games, game).await? {
                snapshot.games.insert(game.to_string());
            }
        }
        if let Some(ch) = record.char_ref() {
            if store.is_active(Collection::Chars, ch).await? {
                snapshot.chars.insert(ch.to_string());
            }
        }
        for slot in record.slot_refs().iter().filter(|s| !s.is_empty()) {
            if store.is_active(Collection::Saves, slot).await? {
                snapshot.saves.insert(slot.clone());
            }
        }
        Ok(snapshot)
    }

    pub fn contains(&self, collection: Collection, uuid: &str) -> bool {
        match collection {
            Collection::Games => self.games.contains(uuid),
            Collection::Chars => self.chars.contains(uuid),
            Collection::Saves => self.saves.contains(uuid),
        }
    }

    /// Parent references that do not resolve to a non-archived record.
    pub fn reference_issues<R: Record>(&self, record: &R) -> Vec<IssueKind> {
        let mut issues = Vec::new();
        if let Some(game) = record.game_ref() {
            if !self.games.contains(game) {
                issues.push(IssueKind::MissingGame {
                    uuid: game.to_string(),
                });
            }
        }
        if let Some(ch) = record.char_ref() {
            if !self.chars.contains(ch) {
                issues.push(IssueKind::MissingCharacter {
                    uuid: ch.to_string(),
                });
            }
        }
        issues
    }

    /// Every issue of a record. Archived records are not checked.
    pub fn check<R: Checkable>(&self, record: &R) -> Vec<ConsistencyIssue> {
        let meta = record.meta();
        if meta.archived {
            return Vec::new();
        }

        let mut kinds = envelope_issues(record);
        kinds.extend(self.reference_issues(record));
        kinds.extend(record.field_issues(self));

        kinds
            .into_iter()
            .map(|kind| ConsistencyIssue {
                collection: R::COLLECTION,
                uuid: meta.uuid.clone(),
                kind,
            })
            .collect()
    }

    pub fn check_game(&self, game: &Game) -> Vec<ConsistencyIssue> {
        self.check(game)
    }

    pub fn check_character(&self, ch: &Character) -> Vec<ConsistencyIssue> {
        self.check(ch)
    }

    pub fn check_save(&self, save: &Save) -> Vec<ConsistencyIssue> {
        self.check(save)
    }
}

fn envelope_issues<R: Record>(record: &R) -> Vec<IssueKind> {
    let meta = record.meta();
    let mut issues = Vec::new();
    if Uuid::parse_str(&meta.uuid).is_err() {
        issues.push(IssueKind::InvalidUuid);
    }
    for (field, value) in [
        ("archivedAt", meta.archived_at),
        ("createdAt", meta.created_at),
        ("updatedAt", meta.updated_at),
    ] {
        if value < 0 {
            issues.push(IssueKind::NegativeTimestamp { field });
        }
    }
    issues
}

/// Returns whether the envelope changed and whether the uuid was replaced.
fn repair_envelope<R: Record>(record: &mut R) -> (bool, bool) {
    let meta = record.meta_mut();
    let mut changed = false;
    let mut new_uuid = false;
    match Uuid::parse_str(&meta.uuid) {
        Err(_) => {
            meta.uuid = Uuid::new_v4().to_string();
            changed = true;
            new_uuid = true;
        }
        Ok(parsed) if parsed.hyphenated().to_string() != meta.uuid => {
            meta.uuid = parsed.hyphenated().to_string();
            changed = true;
            new_uuid = true;
        }
        Ok(_) => {}
    }
    for value in [
        &mut meta.archived_at,
        &mut meta.created_at,
        &mut meta.updated_at,
    ] {
        if *value < 0 {
            *value = 0;
            changed = true;
        }
    }
    (changed, new_uuid)
}

impl Checkable for Game {
    fn field_issues(&self, _snapshot: &ConsistencySnapshot) -> Vec<IssueKind> {
        self.paths
            .iter()
            .enumerate()
            .filter(|(_, p)| p.url.trim().is_empty())
            .map(|(index, _)| IssueKind::EmptyPathUrl { index })
            .collect()
    }

    fn repair_fields(&mut self, _snapshot: &ConsistencySnapshot) -> bool {
        let before = self.paths.len();
        self.paths.retain(|p| !p.url.trim().is_empty());
        self.paths.len() != before
    }
}

impl Checkable for Character {
    fn field_issues(&self, snapshot: &ConsistencySnapshot) -> Vec<IssueKind> {
        let mut issues = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_empty() {
                continue;
            }
            if Uuid::parse_str(slot).is_err() {
                issues.push(IssueKind::MalformedSlot { index });
            } else if !snapshot.saves.contains(slot) {
                issues.push(IssueKind::DanglingSlot {
                    index,
                    uuid: slot.clone(),
                });
            }
        }
        issues
    }

    fn repair_fields(&mut self, snapshot: &ConsistencySnapshot) -> bool {
        let mut changed = false;
        for slot in self.slots.iter_mut() {
            if slot.is_empty() {
                continue;
            }
            if Uuid::parse_str(slot).is_err() || !snapshot.saves.contains(slot.as_str()) {
                slot.clear();
                changed = true;
            }
        }
        changed
    }
}

impl Checkable for Save {
    fn field_issues(&self, _snapshot: &ConsistencySnapshot) -> Vec<IssueKind> {
        if self.hash.is_empty() {
            vec![IssueKind::MissingHash]
        } else {
            Vec::new()
        }
    }

    fn repair_fields(&mut self, _snapshot: &ConsistencySnapshot) -> bool {
        if !self.hash.is_empty() {
            return false;
        }
        self.hash = content_hash(&self.data);
        self.size = self.data.len() as i64;
        true
    }
}

/// Log reference problems of a record that was just committed.
///
/// Only the uuids the record refers to are looked up.
pub async fn advise_on_commit<R: Record>(store: &LocalStore, record: &R) {
    if record.meta().archived || (record.game_ref().is_none() && record.slot_refs().is_empty()) {
        return;
    }

    let snapshot = match ConsistencySnapshot::capture_refs(store, record).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::debug!("Skipping commit check: {}", e);
            return;
        }
    };

    for issue in snapshot.reference_issues(record) {
        tracing::warn!(
            "Committed {} {} with inconsistent reference: {}",
            R::COLLECTION.noun(),
            record.meta().uuid,
            issue
        );
    }
    for slot in record.slot_refs() {
        if !slot.is_empty() && !snapshot.saves.contains(slot) {
            tracing::warn!(
                "Committed {} {} with dangling slot {}",
                R::COLLECTION.noun(),
                record.meta().uuid,
                slot
            );
        }
    }
}

/// Result of a batch consistency check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub checked: usize,
    pub issues: Vec<ConsistencyIssue>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check every record of the store against a fresh snapshot.
pub async fn consistency_pass(store: &LocalStore) -> Result<ConsistencyReport, StoreError> {
    let snapshot = ConsistencySnapshot::capture(store).await?;
    let mut report = ConsistencyReport::default();

    check_all::<Game>(store, &snapshot, &mut report).await?;
    check_all::<Character>(store, &snapshot, &mut report).await?;
    check_all::<Save>(store, &snapshot, &mut report).await?;

    if !report.is_clean() {
        tracing::warn!(
            "Consistency pass found {} issues in {} records",
            report.issues.len(),
            report.checked
        );
    }
    Ok(report)
}

async fn check_all<R: Checkable>(
    store: &LocalStore,
    snapshot: &ConsistencySnapshot,
    report: &mut ConsistencyReport,
) -> Result<(), StoreError> {
    let records: Vec<R> = store.list().await?;
    report.checked += records.len();
    for record in &records {
        report.issues.extend(snapshot.check(record));
    }
    Ok(())
}

/// Counts of a [`repair`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub fixed: usize,
    pub deleted: usize,
}

/// Fix what can be fixed and delete active records whose parents are gone.
///
/// A JSON export of the store is kept under [`keys::REPAIR_BACKUP`] before
/// anything changes. Collections are processed parents first, with a fresh
/// snapshot each time, so a deleted character also takes its saves;
/// characters get a last pass to clear slots of deleted saves. Fixed records
/// keep their `updatedAt`, so a repair alone does not trigger an upload.
pub async fn repair(store: &LocalStore) -> Result<RepairReport, StoreError> {
    let backup = store.export_json().await?;
    store.set_meta(keys::REPAIR_BACKUP, &backup).await?;
    tracing::debug!("Stored pre-repair backup ({} bytes)", backup.len());

    let mut report = RepairReport::default();

    repair_all::<Game>(store, &mut report).await?;
    repair_all::<Character>(store, &mut report).await?;
    repair_all::<Save>(store, &mut report).await?;
    repair_all::<Character>(store, &mut report).await?;

    tracing::info!(
        "Repair fixed {} records and deleted {}",
        report.fixed,
        report.deleted
    );
    Ok(report)
}

async fn repair_all<R: Checkable>(
    store: &LocalStore,
    report: &mut RepairReport,
) -> Result<(), StoreError> {
    let snapshot = ConsistencySnapshot::capture(store).await?;
    let records: Vec<R> = store.list().await?;

    for mut record in records {
        let old_uuid = record.meta().uuid.clone();
        let (envelope_changed, new_uuid) = repair_envelope(&mut record);
        let fields_changed = !record.meta().archived && record.repair_fields(&snapshot);

        if !record.meta().archived
            && snapshot
                .reference_issues(&record)
                .iter()
                .any(IssueKind::is_dangling_parent)
        {
            store.delete(R::COLLECTION, &old_uuid).await?;
            tracing::info!("Deleted {} {} with missing parent", R::COLLECTION.noun(), old_uuid);
            report.deleted += 1;
            continue;
        }

        if envelope_changed || fields_changed {
            if new_uuid {
                store.delete(R::COLLECTION, &old_uuid).await?;
                record.meta_mut().id = UNSAVED_ID;
            }
            store.put(&mut record).await?;
            report.fixed += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GamePath;
    use tempfile::TempDir;

    async fn open_store() -> (LocalStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&dir.path().join("device.sqlite"))
            .await
            .unwrap();
        (store, dir)
    }

    #[test]
    fn test_archived_records_are_not_checked() {
        let snapshot = ConsistencySnapshot::default();
        let mut ch = Character::new(Uuid::new_v4().to_string(), "ghost");
        assert_eq!(snapshot.check_character(&ch).len(), 1);
        ch.meta.archive(10);
        assert!(snapshot.check_character(&ch).is_empty());
    }

    #[test]
    fn test_slot_issues() {
        let mut snapshot = ConsistencySnapshot::default();
        let game = Uuid::new_v4().to_string();
        let live = Uuid::new_v4().to_string();
        let gone = Uuid::new_v4().to_string();
        snapshot.games.insert(game.clone());
        snapshot.saves.insert(live.clone());

        let mut ch = Character::new(game, "Alex");
        ch.slots = vec![live, String::new(), gone.clone(), "junk".into()];
        let kinds: Vec<IssueKind> = snapshot.check(&ch).into_iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IssueKind::DanglingSlot { index: 2, uuid: gone },
                IssueKind::MalformedSlot { index: 3 },
            ]
        );

        assert!(ch.repair_fields(&snapshot));
        assert_eq!(ch.slots[2], "");
        assert_eq!(ch.slots[3], "");
        assert!(snapshot.check(&ch).is_empty());
    }

    #[tokio::test]
    async fn test_consistency_pass_reports_orphans() {
        let (store, _dir) = open_store().await;
        let mut game = Game::new("Eternum");
        store.commit(&mut game).await.unwrap();
        let mut ch = Character::new(&game.meta.uuid, "Alex");
        store.commit(&mut ch).await.unwrap();
        let mut orphan = Save::from_payload(&game.meta.uuid, Uuid::new_v4().to_string(), "x");
        store.commit(&mut orphan).await.unwrap();

        let report = consistency_pass(&store).await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].uuid, orphan.meta.uuid);
        assert!(matches!(
            report.issues[0].kind,
            IssueKind::MissingCharacter { .. }
        ));
    }

    #[tokio::test]
    async fn test_repair_fixes_fields_and_deletes_orphans() {
        let (store, _dir) = open_store().await;
        let mut game = Game::new("Eternum");
        game.paths = vec![GamePath::new(""), GamePath::new("https://example.com")];
        store.commit(&mut game).await.unwrap();

        let mut ch = Character::new(&game.meta.uuid, "Alex");
        let mut save = Save::from_payload(&game.meta.uuid, &ch.meta.uuid, "state");
        save.hash.clear();
        ch.slots = vec![save.meta.uuid.clone(), Uuid::new_v4().to_string()];
        store.commit(&mut ch).await.unwrap();
        store.commit(&mut save).await.unwrap();

        let mut orphan_char = Character::new(Uuid::new_v4().to_string(), "Lost");
        store.commit(&mut orphan_char).await.unwrap();
        let mut orphan_save =
            Save::from_payload(&game.meta.uuid, &orphan_char.meta.uuid, "lost state");
        store.commit(&mut orphan_save).await.unwrap();

        let mut bad_uuid = Game::new("Renamed");
        bad_uuid.meta.uuid = "not-a-uuid".to_string();
        store.commit(&mut bad_uuid).await.unwrap();

        let report = repair(&store).await.unwrap();
        assert_eq!(report.deleted, 2);
        // game paths, bad uuid game, character slot, save hash
        assert_eq!(report.fixed, 4);

        assert!(consistency_pass(&store).await.unwrap().is_clean());
        assert!(store
            .find_by_uuid::<Game>("not-a-uuid")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.count(Collection::Games).await.unwrap(), 2);

        let fixed: Save = store.find_by_uuid(&save.meta.uuid).await.unwrap().unwrap();
        assert_eq!(fixed.hash, content_hash("state"));
        let fixed: Character = store.find_by_uuid(&ch.meta.uuid).await.unwrap().unwrap();
        assert_eq!(fixed.slots, vec![save.meta.uuid.clone(), String::new()]);
        let fixed: Game = store.find_by_uuid(&game.meta.uuid).await.unwrap().unwrap();
        assert_eq!(fixed.paths.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_check_looks_up_only_references() {
        let (store, _dir) = open_store().await;
        let mut game = Game::new("Eternum");
        store.commit(&mut game).await.unwrap();
        let mut unrelated = Game::new("Other");
        store.commit(&mut unrelated).await.unwrap();
        let mut ch = Character::new(&game.meta.uuid, "Alex");
        let mut save = Save::from_payload(&game.meta.uuid, &ch.meta.uuid, "state");
        store.commit(&mut save).await.unwrap();
        let gone = Uuid::new_v4().to_string();
        ch.slots = vec![save.meta.uuid.clone(), gone.clone(), String::new()];

        let snapshot = ConsistencySnapshot::capture_refs(&store, &ch).await.unwrap();
        assert_eq!(snapshot.games.len(), 1);
        assert!(snapshot.games.contains(&game.meta.uuid));
        assert!(snapshot.saves.contains(&save.meta.uuid));
        assert!(!snapshot.saves.contains(&gone));
        assert!(snapshot.reference_issues(&ch).is_empty());

        game.meta.archive(5);
        store.put(&mut game).await.unwrap();
        let snapshot = ConsistencySnapshot::capture_refs(&store, &ch).await.unwrap();
        assert!(matches!(
            snapshot.reference_issues(&ch).as_slice(),
            [IssueKind::MissingGame { .. }]
        ));
    }

    #[tokio::test]
    async fn test_repair_keeps_updated_at_and_stores_backup() {
        let (store, _dir) = open_store().await;
        let mut game = Game::new("Eternum");
        game.paths = vec![GamePath::new(""), GamePath::new("https://example.com")];
        store.commit(&mut game).await.unwrap();
        let mut shouting = Game::new("Shouting");
        store.commit(&mut shouting).await.unwrap();
        let upper = shouting.meta.uuid.to_uppercase();
        sqlx::query("UPDATE games SET uuid = ? WHERE id = ?")
            .bind(&upper)
            .bind(shouting.meta.id)
            .execute(store.pool())
            .await
            .unwrap();

        let report = repair(&store).await.unwrap();
        assert_eq!(report.fixed, 2);

        let fixed: Game = store.find_by_uuid(&game.meta.uuid).await.unwrap().unwrap();
        assert_eq!(fixed.paths.len(), 1);
        assert_eq!(fixed.meta.updated_at, game.meta.updated_at);
        let renamed: Game = store.find_by_uuid(&shouting.meta.uuid).await.unwrap().unwrap();
        assert_eq!(renamed.meta.uuid, shouting.meta.uuid);
        assert_eq!(store.count(Collection::Games).await.unwrap(), 2);
        let pending: Vec<Game> = store.updated_since(game.meta.updated_at + 1).await.unwrap();
        assert!(pending.iter().all(|g| g.meta.uuid != game.meta.uuid));

        let backup = store.get_meta(keys::REPAIR_BACKUP).await.unwrap().unwrap();
        let (other, _other_dir) = open_store().await;
        other.import_json(&backup).await.unwrap();
        let restored: Game = other.find_by_uuid(&game.meta.uuid).await.unwrap().unwrap();
        assert_eq!(restored.paths.len(), 2);
    }
}
