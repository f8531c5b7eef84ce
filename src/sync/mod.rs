//! Sync engine: reconciles the device store with the server.
//!
//! An upload half sends local records changed since a cutoff, a download
//! half pulls remote records changed since the same cutoff and writes them
//! with already-synced semantics. Neither half fails: problems become a
//! [`SyncCount::NotRun`] or an entry in the report's error lists.

use std::fmt;
use std::sync::Arc;

use chrono::DateTime;
use serde_json::Value;

use crate::errors::ValidationError;
use crate::models::{
    ms_to_datetime, now_ms, Character, Game, Save, SyncDownData, SyncDownQuery, SyncUpRequest,
};
use crate::session::{SessionManager, SessionState};
use crate::store::{Applied, LocalStore};
use crate::validation::{decode_download, SyncShape};

/// Outcome of one sync half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCount {
    Ran(usize),
    NotRun(String),
}

impl SyncCount {
    /// Numeric form with `-1` for a half that did not run.
    pub fn as_i64(&self) -> i64 {
        match self {
            SyncCount::Ran(n) => *n as i64,
            SyncCount::NotRun(_) => -1,
        }
    }

    pub fn ran(&self) -> Option<usize> {
        match self {
            SyncCount::Ran(n) => Some(*n),
            SyncCount::NotRun(_) => None,
        }
    }
}

impl fmt::Display for SyncCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncCount::Ran(n) => write!(f, "{n}"),
            SyncCount::NotRun(reason) => write!(f, "not run ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    /// Records the server accepted.
    pub count: SyncCount,
    /// Local records that did not fit the upload shape.
    pub dropped: Vec<ValidationError>,
    /// Per-record failures reported by the server.
    pub server_errors: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    /// Remote records accepted, including those where a newer local copy won.
    pub count: SyncCount,
    pub invalid: Vec<ValidationError>,
    pub kept_local: usize,
    /// Valid records the store could not write, as `<noun> <uuid>: <error>`.
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub cutoff_ms: i64,
    pub started_at_ms: i64,
    pub uploaded: UploadReport,
    pub downloaded: DownloadReport,
    /// Downloaded count net of the records this device just uploaded.
    pub net_downloaded: SyncCount,
}

/// A sync result together with the session state it left behind.
#[derive(Debug)]
pub struct SyncRun<T> {
    pub state: SessionState,
    pub report: T,
}

/// Which remote collections to fetch.
#[derive(Debug, Clone, Copy)]
pub struct DownloadFilter {
    pub games: bool,
    pub chars: bool,
    pub saves: bool,
    /// Skip tombstones on a full download.
    pub exclude_archived: bool,
}

impl Default for DownloadFilter {
    fn default() -> Self {
        Self {
            games: true,
            chars: true,
            saves: true,
            exclude_archived: true,
        }
    }
}

pub struct SyncEngine {
    store: LocalStore,
    session: Arc<SessionManager>,
}

impl SyncEngine {
    pub fn new(store: LocalStore, session: Arc<SessionManager>) -> Self {
        Self { store, session }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Upload local records with `updatedAt >= cutoff_ms`.
    pub async fn sync_up(&self, state: SessionState, cutoff_ms: i64) -> SyncRun<UploadReport> {
        let mut report = UploadReport {
            count: SyncCount::Ran(0),
            dropped: Vec::new(),
            server_errors: Vec::new(),
        };

        if let Some(reason) = state.offline_reason(true) {
            report.count = SyncCount::NotRun(reason);
            return SyncRun { state, report };
        }

        let mut request = SyncUpRequest::default();
        let gathered = async {
            self.gather::<Game>(cutoff_ms, &mut request, &mut report).await?;
            self.gather::<Character>(cutoff_ms, &mut request, &mut report).await?;
            self.gather::<Save>(cutoff_ms, &mut request, &mut report).await
        }
        .await;
        if let Err(e) = gathered {
            tracing::error!("Failed to gather records for upload: {}", e);
            report.count = SyncCount::NotRun(e.to_string());
            return SyncRun { state, report };
        }

        if request.is_empty() {
            return SyncRun { state, report };
        }

        let (state, access) = match self.session.ensure_fresh_access_token(state).await.into_parts() {
            (state, Ok(access)) => (state, access),
            (state, Err(e)) => {
                report.count = SyncCount::NotRun(e.to_string());
                return SyncRun { state, report };
            }
        };

        let total = request.len();
        match self.session.channel().sync_up(&access, &request).await {
            Ok(result) => {
                if !result.errors.is_empty() {
                    tracing::warn!("Failed to sync up {} items", result.errors.len());
                }
                report.count = SyncCount::Ran(total.saturating_sub(result.errors.len()));
                report.server_errors = result.errors;
                tracing::info!(
                    "Sync up: {} games, {} chars, {} saves sent; {} accepted",
                    request.games.len(),
                    request.chars.len(),
                    request.saves.len(),
                    report.count
                );
                SyncRun { state, report }
            }
            Err(e) => {
                tracing::warn!("Sync up failed: {}", e);
                report.count = SyncCount::NotRun(e.to_string());
                let state = self.session.observe_channel_failure(state, &e);
                SyncRun { state, report }
            }
        }
    }

    async fn gather<R: SyncShape>(
        &self,
        cutoff_ms: i64,
        request: &mut SyncUpRequest,
        report: &mut UploadReport,
    ) -> Result<(), crate::errors::StoreError> {
        let records: Vec<R> = self.store.updated_since(cutoff_ms).await?;
        for record in &records {
            match record.to_upload() {
                Ok(upload) => R::push_upload(request, upload),
                Err(e) => {
                    tracing::warn!("Not uploading {}", e);
                    report.dropped.push(e);
                }
            }
        }
        Ok(())
    }

    /// Download remote records with `updatedAt >= cutoff_ms`.
    pub async fn sync_down(
        &self,
        state: SessionState,
        cutoff_ms: i64,
        filter: DownloadFilter,
    ) -> SyncRun<DownloadReport> {
        let mut report = DownloadReport {
            count: SyncCount::Ran(0),
            invalid: Vec::new(),
            kept_local: 0,
            failed: Vec::new(),
        };

        if let Some(reason) = state.offline_reason(true) {
            report.count = SyncCount::NotRun(reason);
            return SyncRun { state, report };
        }

        let (state, access) = match self.session.ensure_fresh_access_token(state).await.into_parts() {
            (state, Ok(access)) => (state, access),
            (state, Err(e)) => {
                report.count = SyncCount::NotRun(e.to_string());
                return SyncRun { state, report };
            }
        };

        let query = SyncDownQuery {
            cutoff_point: ms_to_datetime(cutoff_ms).unwrap_or(DateTime::UNIX_EPOCH),
            games: filter.games,
            chars: filter.chars,
            saves: filter.saves,
            exclude_archived: filter.exclude_archived,
        };

        let mut data = match self.session.channel().sync_down(&access, &query).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Sync down failed: {}", e);
                report.count = SyncCount::NotRun(e.to_string());
                let state = self.session.observe_channel_failure(state, &e);
                return SyncRun { state, report };
            }
        };

        let mut count = 0;
        count += self.apply::<Game>(&mut data, &mut report).await;
        count += self.apply::<Character>(&mut data, &mut report).await;
        count += self.apply::<Save>(&mut data, &mut report).await;
        report.count = SyncCount::Ran(count);

        tracing::info!(
            "Sync down: {} accepted, {} invalid, {} kept local, {} failed",
            count,
            report.invalid.len(),
            report.kept_local,
            report.failed.len()
        );
        SyncRun { state, report }
    }

    async fn apply<R: SyncShape>(&self, data: &mut SyncDownData, report: &mut DownloadReport) -> usize {
        let mut count = 0;
        for value in R::take_download(data) {
            let record = match decode_download::<R>(value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!("Invalid {} synced: {}", R::COLLECTION.noun(), e);
                    report.invalid.push(e);
                    continue;
                }
            };
            let uuid = record.meta().uuid.clone();
            match self.store.put_synced(record).await {
                Ok(Applied::Written) => count += 1,
                Ok(Applied::KeptLocal) => {
                    count += 1;
                    report.kept_local += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to store synced {} {}: {}", R::COLLECTION.noun(), uuid, e);
                    report
                        .failed
                        .push(format!("{} {}: {}", R::COLLECTION.noun(), uuid, e));
                }
            }
        }
        count
    }

    /// Upload then download with the same cutoff.
    ///
    /// Once both halves ran, the start time of this sync becomes the cutoff
    /// of the next incremental sync.
    pub async fn sync(&self, state: SessionState, cutoff_ms: i64) -> SyncRun<SyncReport> {
        let started_at_ms = now_ms();

        let up = self.sync_up(state, cutoff_ms).await;
        let down = self
            .sync_down(up.state, cutoff_ms, DownloadFilter::default())
            .await;

        let net_downloaded = match (&down.report.count, &up.report.count) {
            (SyncCount::NotRun(reason), _) => SyncCount::NotRun(reason.clone()),
            (SyncCount::Ran(downloaded), _) if cutoff_ms == 0 => SyncCount::Ran(*downloaded),
            (SyncCount::Ran(downloaded), uploaded) => {
                SyncCount::Ran(downloaded.saturating_sub(uploaded.ran().unwrap_or(0)))
            }
        };

        if up.report.count.ran().is_some() && down.report.count.ran().is_some() {
            if let Err(e) = self.store.set_last_commit(started_at_ms).await {
                tracing::warn!("Failed to record sync cutoff: {}", e);
            }
        }

        SyncRun {
            state: down.state,
            report: SyncReport {
                cutoff_ms,
                started_at_ms,
                uploaded: up.report,
                downloaded: down.report,
                net_downloaded,
            },
        }
    }

    /// Incremental sync from the cutoff recorded by the last complete sync.
    pub async fn sync_since_last_commit(&self, state: SessionState) -> SyncRun<SyncReport> {
        let cutoff_ms = match self.store.last_commit().await {
            Ok(cutoff) => cutoff,
            Err(e) => {
                tracing::warn!("Failed to read sync cutoff, running a full sync: {}", e);
                0
            }
        };
        self.sync(state, cutoff_ms).await
    }
}
