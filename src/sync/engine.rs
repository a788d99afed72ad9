use super::debounce::{ProgressDebouncer, ProgressSink};
use super::keys;
use crate::config::SyncConfig;
use crate::error::{MangoError, Result};
use crate::models::{
    BookmarkEntry, ChapterSummary, Credential, HistoryEntry, LibraryExport, LibrarySnapshot,
    MangaSummary, ProgressRecord, ReadingSession,
};
use crate::stats::{Achievement, DailyStats, ReadingStatistics, StatisticsSnapshot};
use crate::traits::{load_json, save_json, ContentService, StateStore};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const SAVED_LOCALLY: &str = "Đã lưu cục bộ, sẽ đồng bộ khi có mạng";
const REMOVED_LOCALLY: &str = "Đã xóa cục bộ, sẽ đồng bộ khi có mạng";
const ADD_BOOKMARK_FAILED: &str = "Không thể thêm vào yêu thích";
const REMOVE_BOOKMARK_FAILED: &str = "Không thể xóa khỏi yêu thích";
const FETCH_BOOKMARKS_FAILED: &str = "Không thể tải danh sách yêu thích";
const FETCH_HISTORY_FAILED: &str = "Không thể tải lịch sử đọc";
const HISTORY_FAILED: &str = "Không thể lưu lịch sử đọc";
const PROGRESS_FAILED: &str = "Không thể cập nhật tiến độ đọc";

const RECENTLY_READ_LIMIT: usize = 10;
const CONTINUE_READING_LIMIT: usize = 5;
const FAVORITE_GENRES_LIMIT: usize = 5;

/// Message for the toast slot. Soft notices mean the change is kept locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SavedLocally(&'static str),
    Failed(&'static str),
}

impl Notice {
    pub fn message(&self) -> &'static str {
        match self {
            Notice::SavedLocally(message) | Notice::Failed(message) => message,
        }
    }

    pub fn is_soft(&self) -> bool {
        matches!(self, Notice::SavedLocally(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The Content Service accepted the change.
    Synced,
    /// No answer from the Content Service; kept locally and queued.
    SavedLocally,
    /// No credential, nothing to replicate.
    LocalOnly,
    /// Replication is deferred (debounced progress writes).
    Scheduled,
    /// Nothing to do.
    Unchanged,
}

/// A local change that still has to reach the server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PendingChange {
    #[serde(rename_all = "camelCase")]
    AddBookmark { manga_id: String },
    #[serde(rename_all = "camelCase")]
    RemoveBookmark { manga_id: String },
    #[serde(rename_all = "camelCase")]
    History { manga_id: String, chapter_id: String },
    Progress { key: String },
    Statistics,
}

/// Backup document; every section is optional on import.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryBackup {
    pub bookmarks: Option<Vec<BookmarkEntry>>,
    pub reading_history: Option<Vec<HistoryEntry>>,
    pub reading_progress: Option<BTreeMap<String, ProgressRecord>>,
}

#[derive(Default)]
struct LibraryState {
    bookmarks: Vec<BookmarkEntry>,
    history: Vec<HistoryEntry>,
    progress: BTreeMap<String, ProgressRecord>,
    pending: BTreeSet<PendingChange>,
    /// Progress values before the first unconfirmed write of a key, for rollback.
    unconfirmed: HashMap<String, Option<ProgressRecord>>,
}

impl LibraryState {
    fn snapshot(&self) -> LibrarySnapshot {
        LibrarySnapshot {
            bookmarks: self.bookmarks.clone(),
            reading_history: self.history.clone(),
            reading_progress: self.progress.clone(),
        }
    }

    fn mark_pending(&mut self, change: PendingChange) {
        let opposite = match &change {
            PendingChange::AddBookmark { manga_id } => Some(PendingChange::RemoveBookmark {
                manga_id: manga_id.clone(),
            }),
            PendingChange::RemoveBookmark { manga_id } => Some(PendingChange::AddBookmark {
                manga_id: manga_id.clone(),
            }),
            _ => None,
        };
        if let Some(opposite) = opposite {
            self.pending.remove(&opposite);
        }
        self.pending.insert(change);
    }
}

struct Remote {
    service: Arc<dyn ContentService>,
    credential: Credential,
}

struct Inner {
    store: Arc<dyn StateStore>,
    service: Arc<dyn ContentService>,
    remote: Option<Remote>,
    library: Mutex<LibraryState>,
    stats: Mutex<StatisticsSnapshot>,
    notice: Mutex<Option<Notice>>,
    history_limit: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn set_notice(&self, notice: Notice) {
        debug!("[SYNC] Notice: {}", notice.message());
        *lock(&self.notice) = Some(notice);
    }

    /// Writes one key; an unavailable store only costs durability.
    async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = save_json(self.store.as_ref(), key, value).await {
            warn!("[SYNC] Could not persist {}, keeping it in memory: {}", key, e);
        }
    }

    async fn load<T: serde::de::DeserializeOwned + Default>(&self, key: &str) -> T {
        match load_json(self.store.as_ref(), key).await {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => {
                warn!("[SYNC] Could not load {}, starting empty: {}", key, e);
                T::default()
            }
        }
    }

    async fn persist_library(&self) {
        let (snapshot, pending) = {
            let library = lock(&self.library);
            (library.snapshot(), library.pending.clone())
        };
        self.save(keys::BOOKMARKS, &snapshot.bookmarks).await;
        self.save(keys::READING_HISTORY, &snapshot.reading_history).await;
        self.save(keys::READING_PROGRESS, &snapshot.reading_progress).await;
        self.save(keys::PENDING_SYNC, &pending).await;
    }

    async fn persist_stats(&self) {
        let snapshot = lock(&self.stats).clone();
        self.save(keys::READING_STATS, &snapshot.stats).await;
        self.save(keys::DAILY_STATS, &snapshot.daily_stats).await;
    }

    async fn queue(&self, change: PendingChange) {
        lock(&self.library).mark_pending(change);
        let pending = lock(&self.library).pending.clone();
        self.save(keys::PENDING_SYNC, &pending).await;
    }
}

#[async_trait::async_trait]
impl ProgressSink for Inner {
    async fn flush(&self, records: Vec<ProgressRecord>) {
        let Some(remote) = &self.remote else {
            return;
        };

        for record in records {
            let key = record.key();
            let result = remote
                .service
                .update_progress(
                    &remote.credential,
                    &record.manga_id,
                    &record.chapter_id,
                    record.progress,
                )
                .await;

            match result {
                Ok(()) => {
                    let mut library = lock(&self.library);
                    library.unconfirmed.remove(&key);
                    library.pending.remove(&PendingChange::Progress { key: key.clone() });
                }
                Err(e) if e.is_network() => {
                    warn!("[SYNC] Progress {} kept locally: {}", key, e);
                    lock(&self.library).unconfirmed.remove(&key);
                    self.queue(PendingChange::Progress { key }).await;
                }
                Err(e) => {
                    warn!("[SYNC] Progress {} rejected: {}", key, e);
                    {
                        let mut library = lock(&self.library);
                        let previous = library.unconfirmed.remove(&key).flatten();
                        let untouched = library
                            .progress
                            .get(&key)
                            .is_some_and(|current| current.updated_at == record.updated_at);
                        if untouched {
                            match previous {
                                Some(previous) => library.progress.insert(key.clone(), previous),
                                None => library.progress.remove(&key),
                            };
                        }
                    }
                    self.set_notice(Notice::Failed(PROGRESS_FAILED));
                    self.persist_library().await;
                }
            }
        }
    }
}

/// Owner of bookmarks, reading history, progress and statistics.
pub struct SyncEngine {
    inner: Arc<Inner>,
    debouncer: Option<ProgressDebouncer>,
}

impl SyncEngine {
    /// Loads the local state. Without a credential every operation stays local.
    pub async fn load(
        store: Arc<dyn StateStore>,
        service: Arc<dyn ContentService>,
        credential: Option<Credential>,
        config: &SyncConfig,
    ) -> Self {
        let remote = credential.map(|credential| Remote {
            service: service.clone(),
            credential,
        });

        let inner = Arc::new(Inner {
            store,
            service,
            remote,
            library: Mutex::new(LibraryState::default()),
            stats: Mutex::new(StatisticsSnapshot::default()),
            notice: Mutex::new(None),
            history_limit: config.history_limit.max(1),
        });

        let library = LibraryState {
            bookmarks: inner.load(keys::BOOKMARKS).await,
            history: inner.load(keys::READING_HISTORY).await,
            progress: inner.load(keys::READING_PROGRESS).await,
            pending: inner.load(keys::PENDING_SYNC).await,
            unconfirmed: HashMap::new(),
        };
        let stats = StatisticsSnapshot {
            stats: inner.load::<ReadingStatistics>(keys::READING_STATS).await,
            daily_stats: inner.load::<Vec<DailyStats>>(keys::DAILY_STATS).await,
        };

        info!(
            "[SYNC] Loaded {} bookmarks, {} history entries, {} pending changes",
            library.bookmarks.len(),
            library.history.len(),
            library.pending.len()
        );
        *lock(&inner.library) = library;
        *lock(&inner.stats) = stats;

        let debouncer = inner.remote.as_ref().map(|_| {
            ProgressDebouncer::spawn(
                Duration::from_millis(config.progress_debounce_ms),
                inner.clone() as Arc<dyn ProgressSink>,
            )
        });

        Self { inner, debouncer }
    }

    pub fn is_local_only(&self) -> bool {
        self.inner.remote.is_none()
    }

    pub fn last_notice(&self) -> Option<Notice> {
        lock(&self.inner.notice).clone()
    }

    pub fn clear_notice(&self) {
        *lock(&self.inner.notice) = None;
    }

    pub fn pending(&self) -> Vec<PendingChange> {
        lock(&self.inner.library).pending.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.library).pending.len()
    }

    // Bookmarks

    pub fn bookmarks(&self) -> Vec<BookmarkEntry> {
        lock(&self.inner.library).bookmarks.clone()
    }

    pub fn is_bookmarked(&self, manga_id: &str) -> bool {
        lock(&self.inner.library)
            .bookmarks
            .iter()
            .any(|b| b.manga_id == manga_id)
    }

    pub fn bookmark_count(&self) -> usize {
        lock(&self.inner.library).bookmarks.len()
    }

    pub async fn add_bookmark(&self, manga: &MangaSummary) -> Result<SyncOutcome> {
        {
            let mut library = lock(&self.inner.library);
            if library.bookmarks.iter().any(|b| b.manga_id == manga.id) {
                return Ok(SyncOutcome::Unchanged);
            }
            library.bookmarks.insert(0, BookmarkEntry::new(manga));
        }
        self.inner.persist_library().await;
        info!("[SYNC] Bookmarked {}", manga.id);

        let Some(remote) = &self.inner.remote else {
            return Ok(SyncOutcome::LocalOnly);
        };

        match remote.service.add_bookmark(&remote.credential, &manga.id).await {
            Ok(()) => Ok(SyncOutcome::Synced),
            Err(e) if e.is_network() => {
                warn!("[SYNC] Bookmark {} saved locally: {}", manga.id, e);
                self.inner
                    .queue(PendingChange::AddBookmark {
                        manga_id: manga.id.clone(),
                    })
                    .await;
                self.inner.set_notice(Notice::SavedLocally(SAVED_LOCALLY));
                Ok(SyncOutcome::SavedLocally)
            }
            Err(e) => {
                warn!("[SYNC] Bookmark {} rejected, rolling back: {}", manga.id, e);
                lock(&self.inner.library)
                    .bookmarks
                    .retain(|b| b.manga_id != manga.id);
                self.inner.persist_library().await;
                self.inner.set_notice(Notice::Failed(ADD_BOOKMARK_FAILED));
                Err(e)
            }
        }
    }

    pub async fn remove_bookmark(&self, manga_id: &str) -> Result<SyncOutcome> {
        let original = {
            let mut library = lock(&self.inner.library);
            if !library.bookmarks.iter().any(|b| b.manga_id == manga_id) {
                return Ok(SyncOutcome::Unchanged);
            }
            let original = library.bookmarks.clone();
            library.bookmarks.retain(|b| b.manga_id != manga_id);
            original
        };
        self.inner.persist_library().await;
        info!("[SYNC] Removed bookmark {}", manga_id);

        let Some(remote) = &self.inner.remote else {
            return Ok(SyncOutcome::LocalOnly);
        };

        match remote.service.remove_bookmark(&remote.credential, manga_id).await {
            Ok(()) => Ok(SyncOutcome::Synced),
            Err(e) if e.is_network() => {
                warn!("[SYNC] Bookmark removal {} saved locally: {}", manga_id, e);
                self.inner
                    .queue(PendingChange::RemoveBookmark {
                        manga_id: manga_id.to_string(),
                    })
                    .await;
                self.inner.set_notice(Notice::SavedLocally(REMOVED_LOCALLY));
                Ok(SyncOutcome::SavedLocally)
            }
            Err(e) => {
                warn!("[SYNC] Bookmark removal {} rejected, rolling back: {}", manga_id, e);
                lock(&self.inner.library).bookmarks = original;
                self.inner.persist_library().await;
                self.inner.set_notice(Notice::Failed(REMOVE_BOOKMARK_FAILED));
                Err(e)
            }
        }
    }

    /// Most frequent genres across bookmarked manga.
    pub fn favorite_genres(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for bookmark in &lock(&self.inner.library).bookmarks {
            for genre in &bookmark.manga.genres {
                *counts.entry(genre.clone()).or_default() += 1;
            }
        }

        let mut genres: Vec<(String, usize)> = counts.into_iter().collect();
        genres.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        genres.truncate(FAVORITE_GENRES_LIMIT);
        genres
    }

    /// Replaces local bookmarks with the server's list. Falls back to the local list on failure.
    pub async fn fetch_bookmarks(&self) -> Vec<BookmarkEntry> {
        let Some(remote) = &self.inner.remote else {
            return self.bookmarks();
        };

        match remote.service.fetch_bookmarks(&remote.credential).await {
            Ok(bookmarks) => {
                lock(&self.inner.library).bookmarks = bookmarks.clone();
                self.inner.persist_library().await;
                bookmarks
            }
            Err(e) => {
                warn!("[SYNC] Using local bookmarks: {}", e);
                self.inner.set_notice(Notice::Failed(FETCH_BOOKMARKS_FAILED));
                self.bookmarks()
            }
        }
    }

    // History

    pub fn reading_history(&self) -> Vec<HistoryEntry> {
        lock(&self.inner.library).history.clone()
    }

    pub fn history_count(&self) -> usize {
        lock(&self.inner.library).history.len()
    }

    /// Records a chapter visit, most recent first, bounded to the configured limit.
    pub async fn add_to_history(
        &self,
        manga: &MangaSummary,
        chapter: &ChapterSummary,
        total_pages: u32,
    ) -> Result<SyncOutcome> {
        let entry = HistoryEntry::new(manga, chapter, total_pages);
        let original = {
            let mut library = lock(&self.inner.library);
            let original = library.history.clone();
            library
                .history
                .retain(|h| !h.matches(&manga.id, &chapter.chapter_id));
            library.history.insert(0, entry.clone());
            library.history.truncate(self.inner.history_limit);
            original
        };
        self.inner.persist_library().await;

        let Some(remote) = &self.inner.remote else {
            return Ok(SyncOutcome::LocalOnly);
        };

        match remote.service.add_history(&remote.credential, &entry).await {
            Ok(()) => Ok(SyncOutcome::Synced),
            Err(e) if e.is_network() => {
                debug!("[SYNC] History entry kept locally: {}", e);
                self.inner
                    .queue(PendingChange::History {
                        manga_id: entry.manga_id,
                        chapter_id: entry.chapter_id,
                    })
                    .await;
                Ok(SyncOutcome::SavedLocally)
            }
            Err(e) => {
                warn!("[SYNC] History entry rejected, rolling back: {}", e);
                lock(&self.inner.library).history = original;
                self.inner.persist_library().await;
                self.inner.set_notice(Notice::Failed(HISTORY_FAILED));
                Err(e)
            }
        }
    }

    pub fn recently_read(&self) -> Vec<HistoryEntry> {
        let mut history = self.reading_history();
        history.sort_by(|a, b| b.last_read_at.cmp(&a.last_read_at));
        history.truncate(RECENTLY_READ_LIMIT);
        history
    }

    /// Started but unfinished chapters, most recent first.
    pub fn continue_reading(&self) -> Vec<HistoryEntry> {
        let mut history: Vec<HistoryEntry> = self
            .reading_history()
            .into_iter()
            .filter(|h| h.reading_progress < 100)
            .collect();
        history.sort_by(|a, b| b.last_read_at.cmp(&a.last_read_at));
        history.truncate(CONTINUE_READING_LIMIT);
        history
    }

    pub async fn fetch_reading_history(&self) -> Vec<HistoryEntry> {
        let Some(remote) = &self.inner.remote else {
            return self.reading_history();
        };

        match remote.service.fetch_reading_history(&remote.credential).await {
            Ok(mut history) => {
                history.truncate(self.inner.history_limit);
                lock(&self.inner.library).history = history.clone();
                self.inner.persist_library().await;
                history
            }
            Err(e) => {
                warn!("[SYNC] Using local reading history: {}", e);
                self.inner.set_notice(Notice::Failed(FETCH_HISTORY_FAILED));
                self.reading_history()
            }
        }
    }

    // Progress

    pub fn reading_progress(&self) -> BTreeMap<String, ProgressRecord> {
        lock(&self.inner.library).progress.clone()
    }

    /// Applies progress locally at once; the remote write is debounced.
    pub async fn update_progress(
        &self,
        manga_id: &str,
        chapter_id: &str,
        progress: u8,
    ) -> SyncOutcome {
        let now = Utc::now();
        let record = ProgressRecord {
            manga_id: manga_id.to_string(),
            chapter_id: chapter_id.to_string(),
            progress: progress.min(100),
            updated_at: now,
        };

        {
            let mut library = lock(&self.inner.library);
            let key = record.key();
            let previous = library.progress.insert(key.clone(), record.clone());
            library.unconfirmed.entry(key).or_insert(previous);

            if let Some(entry) = library
                .history
                .iter_mut()
                .find(|h| h.matches(manga_id, chapter_id))
            {
                entry.reading_progress = record.progress;
                entry.last_read_at = now;
            }
            if let Some(bookmark) = library.bookmarks.iter_mut().find(|b| b.manga_id == manga_id) {
                bookmark.last_read_at = Some(now);
                bookmark.current_chapter = Some(chapter_id.to_string());
                bookmark.reading_progress = record.progress;
            }
        }
        self.inner.persist_library().await;

        match &self.debouncer {
            Some(debouncer) => {
                debouncer.push(record);
                SyncOutcome::Scheduled
            }
            None => {
                lock(&self.inner.library).unconfirmed.clear();
                SyncOutcome::LocalOnly
            }
        }
    }

    pub fn get_progress(&self, manga_id: &str, chapter_id: &str) -> u8 {
        lock(&self.inner.library)
            .progress
            .get(&ProgressRecord::key_for(manga_id, chapter_id))
            .map_or(0, |record| record.progress)
    }

    pub async fn mark_as_read(&self, manga_id: &str, chapter_id: &str) -> SyncOutcome {
        self.update_progress(manga_id, chapter_id, 100).await
    }

    // Reconciliation and backups

    /// Uploads the full local library, then adopts the server's bookmarks and history.
    /// Local changes made while the upload was running are replayed on top of the
    /// server lists, and only the pending changes that were uploaded are cleared.
    pub async fn sync_with_server(&self) -> Result<SyncOutcome> {
        let Some(remote) = &self.inner.remote else {
            return Ok(SyncOutcome::LocalOnly);
        };

        let (snapshot, uploaded) = {
            let library = lock(&self.inner.library);
            (library.snapshot(), library.pending.clone())
        };
        info!(
            "[SYNC] Reconciling {} bookmarks and {} history entries",
            snapshot.bookmarks.len(),
            snapshot.reading_history.len()
        );
        remote
            .service
            .sync_library(&remote.credential, &snapshot)
            .await?;

        let (bookmarks, history) = tokio::try_join!(
            remote.service.fetch_bookmarks(&remote.credential),
            remote.service.fetch_reading_history(&remote.credential)
        )?;

        {
            let mut library = lock(&self.inner.library);
            library.bookmarks = rebase_bookmarks(bookmarks, &snapshot.bookmarks, &library.bookmarks);
            library.history = rebase_history(history, &snapshot.reading_history, &library.history);
            library.history.truncate(self.inner.history_limit);
            library
                .pending
                .retain(|change| *change == PendingChange::Statistics || !uploaded.contains(change));
            if !library.pending.is_empty() {
                debug!("[SYNC] {} changes made during reconciliation stay pending", library.pending.len());
            }
        }
        self.inner.persist_library().await;
        info!("[SYNC] Reconciliation complete");
        Ok(SyncOutcome::Synced)
    }

    pub fn export_data(&self) -> LibraryExport {
        LibraryExport {
            snapshot: lock(&self.inner.library).snapshot(),
            exported_at: Utc::now(),
        }
    }

    pub async fn import_data(&self, backup: LibraryBackup) {
        {
            let mut library = lock(&self.inner.library);
            if let Some(bookmarks) = backup.bookmarks {
                library.bookmarks = bookmarks;
            }
            if let Some(mut history) = backup.reading_history {
                history.truncate(self.inner.history_limit);
                library.history = history;
            }
            if let Some(progress) = backup.reading_progress {
                library.progress = progress;
            }
        }
        self.inner.persist_library().await;
    }

    pub async fn import_json(&self, json: &str) -> Result<()> {
        let backup: LibraryBackup = serde_json::from_str(json)?;
        self.import_data(backup).await;
        Ok(())
    }

    pub async fn clear_all_data(&self) {
        {
            let mut library = lock(&self.inner.library);
            library.bookmarks.clear();
            library.history.clear();
            library.progress.clear();
            library.pending.clear();
            library.unconfirmed.clear();
        }
        self.inner.persist_library().await;
        info!("[SYNC] Cleared local library");
    }

    // Statistics

    pub fn statistics(&self) -> StatisticsSnapshot {
        lock(&self.inner.stats).clone()
    }

    /// Folds a finished session into the statistics and persists them. Returns newly unlocked achievements.
    pub async fn record_session(
        &self,
        session: &ReadingSession,
        now: DateTime<Local>,
    ) -> Vec<&'static Achievement> {
        let unlocked = lock(&self.inner.stats).fold_session(session, now);
        self.inner.persist_stats().await;
        for achievement in &unlocked {
            info!("[SYNC] Achievement unlocked: {}", achievement.name);
        }
        unlocked
    }

    /// Anonymous view count, sent in the background even without a credential.
    pub fn record_view(&self, chapter_id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let service = self.inner.service.clone();
        let chapter_id = chapter_id.to_string();
        runtime.spawn(async move {
            if let Err(e) = service.record_view(&chapter_id).await {
                debug!("[SYNC] View of {} not counted: {}", chapter_id, e);
            }
        });
    }

    /// Reports the session in the background; failures are only logged.
    pub fn submit_session(&self, session: ReadingSession) {
        if self.inner.remote.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("[SYNC] No runtime, session {} not reported", session.session_id);
            return;
        };

        let inner = self.inner.clone();
        runtime.spawn(async move {
            if let Some(remote) = &inner.remote {
                if let Err(e) = remote.service.submit_session(&remote.credential, &session).await {
                    debug!("[SYNC] Session report dropped: {}", e);
                }
            }
        });
    }

    /// Merges server statistics into the local ones and uploads the result.
    pub async fn sync_statistics(&self) -> Result<StatisticsSnapshot> {
        let Some(remote) = &self.inner.remote else {
            return Ok(self.statistics());
        };

        let remote_stats = match remote.service.fetch_statistics(&remote.credential).await {
            Ok(stats) => stats,
            Err(e) if e.is_network() => {
                warn!("[SYNC] Statistics kept locally: {}", e);
                self.inner.queue(PendingChange::Statistics).await;
                return Ok(self.statistics());
            }
            Err(e) => return Err(e),
        };

        let merged = {
            let mut stats = lock(&self.inner.stats);
            stats.merge(&remote_stats);
            stats.clone()
        };
        self.inner.persist_stats().await;

        match remote
            .service
            .upload_statistics(&remote.credential, &merged)
            .await
        {
            Ok(()) => {
                lock(&self.inner.library)
                    .pending
                    .remove(&PendingChange::Statistics);
                let pending = lock(&self.inner.library).pending.clone();
                self.inner.save(keys::PENDING_SYNC, &pending).await;
            }
            Err(e) if e.is_network() => {
                warn!("[SYNC] Statistics upload deferred: {}", e);
                self.inner.queue(PendingChange::Statistics).await;
            }
            Err(e) => return Err(e),
        }

        Ok(merged)
    }

    pub async fn set_goals(&self, weekly_minutes: u32, monthly_minutes: u32) {
        {
            let mut stats = lock(&self.inner.stats);
            stats.stats.weekly_goal = weekly_minutes;
            stats.stats.monthly_goal = monthly_minutes;
        }
        self.inner.persist_stats().await;
    }

    /// Flushes debounced progress writes.
    pub async fn shutdown(self) {
        if let Some(debouncer) = self.debouncer {
            debouncer.shutdown().await;
        }
    }
}

/// Server bookmarks with the additions and removals made locally since `before` applied on top.
fn rebase_bookmarks(
    server: Vec<BookmarkEntry>,
    before: &[BookmarkEntry],
    now: &[BookmarkEntry],
) -> Vec<BookmarkEntry> {
    let had = |list: &[BookmarkEntry], id: &str| list.iter().any(|b| b.manga_id == id);

    let mut merged: Vec<BookmarkEntry> = now
        .iter()
        .filter(|b| !had(before, &b.manga_id) && !had(&server, &b.manga_id))
        .cloned()
        .collect();
    merged.extend(
        server
            .into_iter()
            .filter(|b| !had(before, &b.manga_id) || had(now, &b.manga_id)),
    );
    merged
}

/// Server history with the entries written locally since `before` moved to the front.
fn rebase_history(
    server: Vec<HistoryEntry>,
    before: &[HistoryEntry],
    now: &[HistoryEntry],
) -> Vec<HistoryEntry> {
    let written: Vec<HistoryEntry> = now
        .iter()
        .filter(|entry| !before.contains(entry))
        .cloned()
        .collect();

    let mut merged = written.clone();
    merged.extend(server.into_iter().filter(|entry| {
        !written
            .iter()
            .any(|w| w.matches(&entry.manga_id, &entry.chapter_id))
    }));
    merged
}

impl From<&MangoError> for Notice {
    fn from(error: &MangoError) -> Self {
        if error.is_soft() {
            Notice::SavedLocally(SAVED_LOCALLY)
        } else {
            Notice::Failed(error.user_message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{chapter, manga, FakeContentService, MemoryStore, RemoteMode, UnavailableStore};
    use chrono::TimeZone;

    async fn engine(
        mode: RemoteMode,
    ) -> (SyncEngine, Arc<FakeContentService>, Arc<MemoryStore>) {
        let fake = Arc::new(FakeContentService::new());
        fake.set_mode(mode);
        let store = Arc::new(MemoryStore::default());
        let engine = SyncEngine::load(
            store.clone(),
            fake.clone(),
            Some(Credential::new("token")),
            &SyncConfig::default(),
        )
        .await;
        (engine, fake, store)
    }

    #[tokio::test]
    async fn test_add_bookmark_synced() {
        let (engine, fake, store) = engine(RemoteMode::Online).await;

        let outcome = engine.add_bookmark(&manga("m1")).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Synced);
        assert!(engine.is_bookmarked("m1"));
        assert_eq!(fake.calls_to("add_bookmark"), 1);
        assert!(store.raw(keys::BOOKMARKS).unwrap().contains("\"mangaId\":\"m1\""));

        // Second add is a no-op.
        let outcome = engine.add_bookmark(&manga("m1")).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert_eq!(engine.bookmark_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_bookmark_rolls_back() {
        let (engine, _, store) = engine(RemoteMode::Rejecting).await;

        let err = engine.add_bookmark(&manga("m1")).await.unwrap_err();
        assert!(matches!(err, MangoError::RemoteRejection(_)));
        assert!(!engine.is_bookmarked("m1"));
        assert!(engine.bookmarks().iter().all(|b| b.manga_id != "m1"));
        assert_eq!(store.raw(keys::BOOKMARKS).as_deref(), Some("[]"));

        let notice = engine.last_notice().unwrap();
        assert!(!notice.is_soft());
        assert_eq!(notice.message(), "Không thể thêm vào yêu thích");
    }

    #[tokio::test]
    async fn test_network_failure_keeps_bookmark_and_queues_it() {
        let (engine, _, store) = engine(RemoteMode::Offline).await;

        let outcome = engine.add_bookmark(&manga("m1")).await.unwrap();
        assert_eq!(outcome, SyncOutcome::SavedLocally);
        assert!(engine.is_bookmarked("m1"));
        assert_eq!(
            engine.pending(),
            vec![PendingChange::AddBookmark {
                manga_id: "m1".into()
            }]
        );
        assert!(store.raw(keys::PENDING_SYNC).unwrap().contains("addBookmark"));

        let notice = engine.last_notice().unwrap();
        assert!(notice.is_soft());
        assert_eq!(notice.message(), "Đã lưu cục bộ, sẽ đồng bộ khi có mạng");
    }

    #[tokio::test]
    async fn test_remove_bookmark_rollback_restores_order() {
        let (engine, fake, _) = engine(RemoteMode::Online).await;
        engine.add_bookmark(&manga("m1")).await.unwrap();
        engine.add_bookmark(&manga("m2")).await.unwrap();

        fake.set_mode(RemoteMode::Rejecting);
        assert!(engine.remove_bookmark("m1").await.is_err());
        let ids: Vec<String> = engine.bookmarks().into_iter().map(|b| b.manga_id).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
        assert_eq!(engine.last_notice().unwrap().message(), "Không thể xóa khỏi yêu thích");

        fake.set_mode(RemoteMode::Offline);
        assert_eq!(
            engine.remove_bookmark("m1").await.unwrap(),
            SyncOutcome::SavedLocally
        );
        assert!(!engine.is_bookmarked("m1"));
        assert_eq!(engine.last_notice().unwrap().message(), "Đã xóa cục bộ, sẽ đồng bộ khi có mạng");
    }

    #[tokio::test]
    async fn test_history_is_bounded_to_most_recent() {
        let (engine, _, _) = engine(RemoteMode::Online).await;
        for i in 0..150 {
            engine
                .add_to_history(&manga(&format!("m{}", i)), &chapter(&format!("c{}", i), 1.0), 20)
                .await
                .unwrap();
        }

        let history = engine.reading_history();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].manga_id, "m149");
        assert_eq!(history[99].manga_id, "m50");
    }

    #[tokio::test]
    async fn test_rereading_moves_entry_to_front() {
        let (engine, _, _) = engine(RemoteMode::Online).await;
        engine.add_to_history(&manga("m1"), &chapter("c1", 1.0), 20).await.unwrap();
        engine.add_to_history(&manga("m2"), &chapter("c2", 1.0), 20).await.unwrap();
        engine.add_to_history(&manga("m1"), &chapter("c1", 1.0), 20).await.unwrap();

        let history = engine.reading_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].chapter_id, "c1");
        assert_eq!(engine.recently_read().len(), 2);
    }

    #[tokio::test]
    async fn test_progress_updates_history_and_bookmark() {
        let (engine, _, _) = engine(RemoteMode::Online).await;
        engine.add_bookmark(&manga("m1")).await.unwrap();
        engine.add_to_history(&manga("m1"), &chapter("c1", 1.0), 20).await.unwrap();

        assert_eq!(engine.update_progress("m1", "c1", 45).await, SyncOutcome::Scheduled);
        assert_eq!(engine.get_progress("m1", "c1"), 45);
        assert_eq!(engine.get_progress("m1", "missing"), 0);
        assert_eq!(engine.reading_history()[0].reading_progress, 45);

        let bookmark = &engine.bookmarks()[0];
        assert_eq!(bookmark.reading_progress, 45);
        assert_eq!(bookmark.current_chapter.as_deref(), Some("c1"));
        assert_eq!(engine.continue_reading().len(), 1);

        engine.mark_as_read("m1", "c1").await;
        assert_eq!(engine.get_progress("m1", "c1"), 100);
        assert!(engine.continue_reading().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_progress_updates_produce_one_remote_write() {
        let (engine, fake, _) = engine(RemoteMode::Online).await;

        for progress in 1..=10u8 {
            engine.update_progress("m1", "c1", progress * 10).await;
            tokio::time::sleep(Duration::from_millis(90)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let writes = fake.progress_writes.lock().unwrap().clone();
        assert_eq!(writes, vec![("m1".to_string(), "c1".to_string(), 100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_progress_rolls_back() {
        let (engine, fake, _) = engine(RemoteMode::Online).await;
        engine.update_progress("m1", "c1", 30).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        fake.set_mode(RemoteMode::Rejecting);
        engine.update_progress("m1", "c1", 60).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(engine.get_progress("m1", "c1"), 30);
        assert_eq!(engine.last_notice().unwrap().message(), "Không thể cập nhật tiến độ đọc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_progress_is_kept_and_queued() {
        let (engine, _, _) = engine(RemoteMode::Offline).await;
        engine.update_progress("m1", "c1", 80).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(engine.get_progress("m1", "c1"), 80);
        assert_eq!(
            engine.pending(),
            vec![PendingChange::Progress {
                key: "m1-c1".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_without_credential_everything_stays_local() {
        let fake = Arc::new(FakeContentService::new());
        let engine = SyncEngine::load(
            Arc::new(MemoryStore::default()),
            fake.clone(),
            None,
            &SyncConfig::default(),
        )
        .await;

        assert!(engine.is_local_only());
        assert_eq!(engine.add_bookmark(&manga("m1")).await.unwrap(), SyncOutcome::LocalOnly);
        assert_eq!(engine.update_progress("m1", "c1", 10).await, SyncOutcome::LocalOnly);
        assert_eq!(engine.sync_with_server().await.unwrap(), SyncOutcome::LocalOnly);
        assert_eq!(fake.calls_to("add_bookmark"), 0);
        assert!(engine.last_notice().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_keeps_state_in_memory() {
        let engine = SyncEngine::load(
            Arc::new(UnavailableStore),
            Arc::new(FakeContentService::new()),
            None,
            &SyncConfig::default(),
        )
        .await;

        engine.add_bookmark(&manga("m1")).await.unwrap();
        assert!(engine.is_bookmarked("m1"));
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let store = Arc::new(MemoryStore::default());
        let fake = Arc::new(FakeContentService::new());
        {
            let engine = SyncEngine::load(store.clone(), fake.clone(), None, &SyncConfig::default()).await;
            engine.add_bookmark(&manga("m1")).await.unwrap();
            engine.add_to_history(&manga("m1"), &chapter("c1", 1.0), 12).await.unwrap();
            engine.update_progress("m1", "c1", 25).await;
        }

        let engine = SyncEngine::load(store, fake, None, &SyncConfig::default()).await;
        assert!(engine.is_bookmarked("m1"));
        assert_eq!(engine.history_count(), 1);
        assert_eq!(engine.get_progress("m1", "c1"), 25);
    }

    #[tokio::test]
    async fn test_sync_with_server_uploads_then_adopts_server_state() {
        let (engine, fake, _) = engine(RemoteMode::Offline).await;
        engine.add_bookmark(&manga("m1")).await.unwrap();
        assert_eq!(engine.pending_count(), 1);

        fake.set_mode(RemoteMode::Online);
        let mut server_bookmarks = vec![BookmarkEntry::new(&manga("m1"))];
        server_bookmarks.push(BookmarkEntry::new(&manga("m9")));
        *fake.remote_bookmarks.lock().unwrap() = server_bookmarks;

        assert_eq!(engine.sync_with_server().await.unwrap(), SyncOutcome::Synced);
        let uploaded = fake.uploaded.lock().unwrap().clone().unwrap();
        assert_eq!(uploaded.bookmarks.len(), 1);
        assert!(engine.is_bookmarked("m9"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_changes_made_during_reconciliation_survive() {
        let (engine, fake, _) = engine(RemoteMode::Online).await;
        engine.add_bookmark(&manga("m2")).await.unwrap();
        *fake.remote_bookmarks.lock().unwrap() = vec![
            BookmarkEntry::new(&manga("m2")),
            BookmarkEntry::new(&manga("m9")),
        ];
        fake.set_call_delay("sync_library", Duration::from_millis(100));
        fake.fail_call("add_bookmark");

        let (synced, added, removed) = tokio::join!(engine.sync_with_server(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.add_bookmark(&manga("m1")).await
        }, async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            engine.remove_bookmark("m2").await
        });

        assert_eq!(synced.unwrap(), SyncOutcome::Synced);
        assert_eq!(added.unwrap(), SyncOutcome::SavedLocally);
        assert_eq!(removed.unwrap(), SyncOutcome::Synced);

        assert!(engine.is_bookmarked("m1"));
        assert!(engine.is_bookmarked("m9"));
        assert!(!engine.is_bookmarked("m2"));
        assert_eq!(
            engine.pending(),
            vec![PendingChange::AddBookmark {
                manga_id: "m1".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_history_written_during_reconciliation_is_kept() {
        let (engine, fake, _) = engine(RemoteMode::Online).await;
        let mut server_entry = HistoryEntry::new(&manga("m9"), &chapter("c9", 9.0), 10);
        server_entry.last_read_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        *fake.remote_history.lock().unwrap() = vec![server_entry];
        fake.set_call_delay("sync_library", Duration::from_millis(100));
        fake.fail_call("add_history");

        let (synced, recorded) = tokio::join!(engine.sync_with_server(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.add_to_history(&manga("m1"), &chapter("c1", 1.0), 20).await
        });
        synced.unwrap();
        assert_eq!(recorded.unwrap(), SyncOutcome::SavedLocally);

        let history = engine.reading_history();
        assert_eq!(history.len(), 2);
        assert!(history[0].matches("m1", "c1"));
        assert!(history[1].matches("m9", "c9"));
        assert_eq!(engine.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_bookmarks_falls_back_to_local() {
        let (engine, fake, _) = engine(RemoteMode::Online).await;
        engine.add_bookmark(&manga("m1")).await.unwrap();

        fake.set_mode(RemoteMode::Offline);
        let bookmarks = engine.fetch_bookmarks().await;
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(engine.last_notice().unwrap().message(), "Không thể tải danh sách yêu thích");
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let (engine, _, _) = engine(RemoteMode::Online).await;
        engine.add_bookmark(&manga("m1")).await.unwrap();
        engine.update_progress("m1", "c1", 50).await;
        let json = serde_json::to_string(&engine.export_data()).unwrap();
        assert!(json.contains("exportedAt"));

        engine.clear_all_data().await;
        assert_eq!(engine.bookmark_count(), 0);

        engine.import_json(&json).await.unwrap();
        assert!(engine.is_bookmarked("m1"));
        assert_eq!(engine.get_progress("m1", "c1"), 50);

        // Sections missing from a backup are left alone.
        engine.import_json(r#"{"bookmarks": []}"#).await.unwrap();
        assert_eq!(engine.bookmark_count(), 0);
        assert_eq!(engine.get_progress("m1", "c1"), 50);
    }

    #[tokio::test]
    async fn test_favorite_genres_ranked_by_count() {
        let (engine, _, _) = engine(RemoteMode::Online).await;
        let mut romance = manga("m2");
        romance.genres = vec!["Romance".into(), "Action".into()];
        engine.add_bookmark(&manga("m1")).await.unwrap();
        engine.add_bookmark(&romance).await.unwrap();

        let genres = engine.favorite_genres();
        assert_eq!(genres[0], ("Action".to_string(), 2));
        assert_eq!(genres[1], ("Romance".to_string(), 1));
    }

    #[tokio::test]
    async fn test_sync_statistics_takes_maximum() {
        let (engine, fake, store) = engine(RemoteMode::Online).await;
        let mut session = ReadingSession::start("m1", "c1");
        session.pages_read = 10;
        session.time_spent = 5.0;
        let now = Local.with_ymd_and_hms(2026, 3, 4, 15, 0, 0).unwrap();
        let unlocked = engine.record_session(&session, now).await;
        assert!(unlocked.iter().any(|a| a.id == "first_chapter"));
        assert!(store.raw(keys::READING_STATS).is_some());

        {
            let mut remote = fake.remote_stats.lock().unwrap();
            remote.stats.total_reading_time = 120.0;
            remote.stats.achievements.insert("reviewer".into());
        }

        let merged = engine.sync_statistics().await.unwrap();
        assert_eq!(merged.stats.total_reading_time, 120.0);
        assert_eq!(merged.stats.total_chapters_read, 1);
        assert!(merged.stats.achievements.contains("reviewer"));
        assert!(merged.stats.achievements.contains("first_chapter"));
        assert_eq!(fake.calls_to("upload_statistics"), 1);
    }

    #[tokio::test]
    async fn test_offline_statistics_sync_is_queued() {
        let (engine, _, _) = engine(RemoteMode::Offline).await;
        engine.sync_statistics().await.unwrap();
        assert_eq!(engine.pending(), vec![PendingChange::Statistics]);
    }

    #[tokio::test]
    async fn test_submit_session_is_fire_and_forget() {
        let (engine, fake, _) = engine(RemoteMode::Offline).await;
        engine.submit_session(ReadingSession::start("m1", "c1"));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(fake.calls_to("submit_session"), 1);
        assert!(engine.last_notice().is_none());
    }

    #[tokio::test]
    async fn test_record_view_works_without_credential() {
        let fake = Arc::new(FakeContentService::new());
        let engine =
            SyncEngine::load(Arc::new(MemoryStore::default()), fake.clone(), None, &SyncConfig::default())
                .await;
        engine.record_view("c1");
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(fake.calls_to("record_view"), 1);
    }

    #[test]
    fn test_notice_from_error() {
        assert!(Notice::from(&MangoError::network("offline")).is_soft());
        let hard = Notice::from(&MangoError::rejected("no"));
        assert_eq!(hard.message(), "Thao tác thất bại");
    }
}
