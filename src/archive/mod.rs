//! Cascading soft delete with an undo window.
//!
//! Archiving a game archives its active characters and their active saves;
//! archiving a character archives its active saves. The root is committed
//! at once and the dependents after a grace period, unless the operation
//! is undone first.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::{ArchiveError, StoreError};
use crate::models::{now_ms, Character, Game, Record, Save};
use crate::store::LocalStore;

/// Default delay before dependents of an archived record are committed.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(2750);

/// Dependents archived along with a root record.
#[derive(Debug, Clone, Default)]
pub struct Cascade {
    pub chars: Vec<Character>,
    pub saves: Vec<Save>,
}

impl Cascade {
    pub fn len(&self) -> usize {
        self.chars.len() + self.saves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unarchive(&mut self) {
        for ch in &mut self.chars {
            ch.meta.unarchive();
        }
        for save in &mut self.saves {
            save.meta.unarchive();
        }
    }
}

enum Deferred {
    Committed(Cascade),
    Cancelled,
}

pub struct ArchiveCascade {
    store: LocalStore,
    grace: Duration,
}

impl ArchiveCascade {
    pub fn new(store: LocalStore, grace: Duration) -> Self {
        Self { store, grace }
    }

    /// Mark a game archived and collect its dependents, archived in memory.
    pub async fn archive_game(&self, game: &mut Game) -> Result<Cascade, StoreError> {
        let at = now_ms();
        game.meta.archive(at);

        let mut cascade = Cascade::default();
        for mut ch in self.store.active_characters_of(&game.meta.uuid).await? {
            ch.meta.archive(at);
            cascade.saves.extend(self.archive_saves_of(&ch, at).await?);
            cascade.chars.push(ch);
        }
        Ok(cascade)
    }

    /// Mark a character archived and collect its saves, archived in memory.
    pub async fn archive_character(&self, ch: &mut Character) -> Result<Cascade, StoreError> {
        let at = now_ms();
        ch.meta.archive(at);
        Ok(Cascade {
            chars: Vec::new(),
            saves: self.archive_saves_of(ch, at).await?,
        })
    }

    pub fn archive_save(&self, save: &mut Save) {
        save.meta.archive(now_ms());
    }

    async fn archive_saves_of(&self, ch: &Character, at: i64) -> Result<Vec<Save>, StoreError> {
        let mut saves = self.store.active_saves_of(&ch.meta.uuid).await?;
        for save in &mut saves {
            save.meta.archive(at);
        }
        Ok(saves)
    }

    pub fn unarchive_game(&self, game: &mut Game) {
        game.meta.unarchive();
    }

    pub fn unarchive_character(&self, ch: &mut Character) {
        ch.meta.unarchive();
    }

    pub fn unarchive_save(&self, save: &mut Save) {
        save.meta.unarchive();
    }

    /// Archive a game now and its dependents after the grace period.
    pub async fn commit_game_archive(&self, mut game: Game) -> Result<PendingCascade<Game>, ArchiveError> {
        let cascade = self.archive_game(&mut game).await?;
        self.store.commit(&mut game).await?;
        tracing::info!(
            "Archived game {} with {} characters and {} saves pending",
            game.meta.uuid,
            cascade.chars.len(),
            cascade.saves.len()
        );
        Ok(self.defer(game, cascade))
    }

    /// Archive a character now and its saves after the grace period.
    pub async fn commit_character_archive(
        &self,
        mut ch: Character,
    ) -> Result<PendingCascade<Character>, ArchiveError> {
        let cascade = self.archive_character(&mut ch).await?;
        self.store.commit(&mut ch).await?;
        tracing::info!(
            "Archived character {} with {} saves pending",
            ch.meta.uuid,
            cascade.saves.len()
        );
        Ok(self.defer(ch, cascade))
    }

    pub async fn commit_save_archive(&self, mut save: Save) -> Result<Save, ArchiveError> {
        self.archive_save(&mut save);
        self.store.commit(&mut save).await?;
        Ok(save)
    }

    fn defer<R: Record>(&self, root: R, cascade: Cascade) -> PendingCascade<R> {
        let (cancel, cancelled) = oneshot::channel::<()>();
        let store = self.store.clone();
        let grace = self.grace;
        let pending = cascade.clone();

        let task = tokio::spawn(run_deferred(store, grace, cancelled, pending));

        PendingCascade {
            store: self.store.clone(),
            root,
            cascade,
            cancel,
            task,
        }
    }
}

async fn run_deferred(
    store: LocalStore,
    grace: Duration,
    cancelled: oneshot::Receiver<()>,
    mut pending: Cascade,
) -> Result<Deferred, StoreError> {
    tokio::select! {
        biased;
        // A dropped sender is not a cancellation; the commit still happens.
        Ok(()) = cancelled => Ok(Deferred::Cancelled),
        _ = tokio::time::sleep(grace) => {
            store.bulk_commit(&mut pending.chars).await?;
            store.bulk_commit(&mut pending.saves).await?;
            tracing::debug!("Committed cascade of {} records", pending.len());
            Ok(Deferred::Committed(pending))
        }
    }
}

/// An archive whose dependents are not committed yet.
///
/// Dropping it leaves the deferred commit running.
pub struct PendingCascade<R: Record> {
    store: LocalStore,
    root: R,
    cascade: Cascade,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<Result<Deferred, StoreError>>,
}

impl<R: Record> PendingCascade<R> {
    /// The archived root as committed.
    pub fn root(&self) -> &R {
        &self.root
    }

    /// Dependents affected, computed at archive time.
    pub fn cascade(&self) -> &Cascade {
        &self.cascade
    }

    /// Cancel the deferred commit and restore the root.
    ///
    /// Fails with [`ArchiveError::WindowElapsed`] once the dependents were committed.
    pub async fn undo(self) -> Result<(R, Cascade), ArchiveError> {
        let PendingCascade {
            store,
            mut root,
            mut cascade,
            cancel,
            task,
        } = self;

        if cancel.send(()).is_err() {
            return Err(ArchiveError::WindowElapsed);
        }
        match task.await {
            Ok(Ok(Deferred::Cancelled)) => {}
            Ok(Ok(Deferred::Committed(_))) => return Err(ArchiveError::WindowElapsed),
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => return Err(ArchiveError::Task(e.to_string())),
        }

        root.meta_mut().unarchive();
        cascade.unarchive();
        store.commit(&mut root).await?;
        tracing::info!("Undid archive of {} {}", R::COLLECTION.noun(), root.meta().uuid);
        Ok((root, cascade))
    }

    /// Wait for the deferred commit and return the committed dependents.
    pub async fn settle(self) -> Result<Cascade, ArchiveError> {
        let _cancel = self.cancel;
        match self.task.await {
            Ok(Ok(Deferred::Committed(cascade))) => Ok(cascade),
            Ok(Ok(Deferred::Cancelled)) => Err(ArchiveError::Task("cascade was cancelled".to_string())),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(ArchiveError::Task(e.to_string())),
        }
    }
}
