//! Fakes shared by the unit tests.

use crate::error::{MangoError, Result};
use crate::models::{
    BookmarkEntry, ChapterDetails, ChapterNavigation, ChapterPayload, ChapterRecord,
    ChapterSummary, Credential, HistoryEntry, LibrarySnapshot, MangaSummary, PageAsset, PageBytes,
    ReadingSession,
};
use crate::stats::StatisticsSnapshot;
use crate::traits::{ChapterStore, ContentService, StateStore};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    Online,
    Offline,
    Rejecting,
}

/// In-memory Content Service with switchable connectivity and call recording.
pub struct FakeContentService {
    chapters: Mutex<HashMap<String, ChapterDetails>>,
    failing_pages: Mutex<HashSet<String>>,
    page_delay: Mutex<Option<Duration>>,
    mode: Mutex<RemoteMode>,
    failing_calls: Mutex<HashSet<String>>,
    call_delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
    page_fetches: AtomicUsize,
    pub progress_writes: Mutex<Vec<(String, String, u8)>>,
    pub remote_bookmarks: Mutex<Vec<BookmarkEntry>>,
    pub remote_history: Mutex<Vec<HistoryEntry>>,
    pub remote_stats: Mutex<StatisticsSnapshot>,
    pub uploaded: Mutex<Option<LibrarySnapshot>>,
}

impl FakeContentService {
    pub fn new() -> Self {
        Self {
            chapters: Mutex::new(HashMap::new()),
            failing_pages: Mutex::new(HashSet::new()),
            page_delay: Mutex::new(None),
            mode: Mutex::new(RemoteMode::Online),
            failing_calls: Mutex::new(HashSet::new()),
            call_delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            page_fetches: AtomicUsize::new(0),
            progress_writes: Mutex::new(Vec::new()),
            remote_bookmarks: Mutex::new(Vec::new()),
            remote_history: Mutex::new(Vec::new()),
            remote_stats: Mutex::new(StatisticsSnapshot::default()),
            uploaded: Mutex::new(None),
        }
    }

    pub fn with_chapter(self, manga_id: &str, chapter_id: &str, pages: usize) -> Self {
        let images = (0..pages).map(|i| page_url(chapter_id, i)).collect();
        self.chapters.lock().unwrap().insert(
            chapter_id.to_string(),
            ChapterDetails {
                chapter: ChapterPayload {
                    chapter_id: chapter_id.to_string(),
                    manga_id: manga_id.to_string(),
                    chapter_number: 1.0,
                    title: format!("Chương {}", chapter_id),
                    images,
                },
                navigation: ChapterNavigation::default(),
            },
        );
        self
    }

    /// Answers requests for `requested` with the payload registered for `served`.
    pub fn serve_as(&self, requested: &str, served: &str) {
        let mut chapters = self.chapters.lock().unwrap();
        if let Some(details) = chapters.get(served).cloned() {
            chapters.insert(requested.to_string(), details);
        }
    }

    pub fn fail_page(&self, url: &str) {
        self.failing_pages.lock().unwrap().insert(url.to_string());
    }

    pub fn set_page_delay(&self, delay: Duration) {
        *self.page_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_mode(&self, mode: RemoteMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Makes one remote call fail with a network error regardless of the mode.
    pub fn fail_call(&self, name: &str) {
        self.failing_calls.lock().unwrap().insert(name.to_string());
    }

    pub fn set_call_delay(&self, name: &str, delay: Duration) {
        self.call_delays.lock().unwrap().insert(name.to_string(), delay);
    }

    async fn pause(&self, name: &str) {
        let delay = self.call_delays.lock().unwrap().get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    fn record(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(name.to_string());
        if self.failing_calls.lock().unwrap().contains(name) {
            return Err(MangoError::network(format!("{} failed", name)));
        }
        match *self.mode.lock().unwrap() {
            RemoteMode::Online => Ok(()),
            RemoteMode::Offline => Err(MangoError::network("connection refused")),
            RemoteMode::Rejecting => Err(MangoError::rejected("rejected by server")),
        }
    }
}

pub fn page_url(chapter_id: &str, index: usize) -> String {
    format!("https://cdn.test/{}/{}.png", chapter_id, index)
}

#[async_trait::async_trait]
impl ContentService for FakeContentService {
    async fn fetch_chapter(&self, chapter_id: &str) -> Result<ChapterDetails> {
        self.record("fetch_chapter")?;
        self.chapters
            .lock()
            .unwrap()
            .get(chapter_id)
            .cloned()
            .ok_or_else(|| MangoError::rejected("Chapter not found"))
    }

    async fn fetch_page(&self, url: &str) -> Result<PageBytes> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.page_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.mode.lock().unwrap() == RemoteMode::Offline
            || self.failing_pages.lock().unwrap().contains(url)
        {
            return Err(MangoError::network(format!("failed to fetch {}", url)));
        }
        Ok(PageBytes {
            bytes: PNG_BYTES.to_vec(),
            content_type: Some("image/png".to_string()),
        })
    }

    async fn record_view(&self, _chapter_id: &str) -> Result<()> {
        self.record("record_view")
    }

    async fn fetch_bookmarks(&self, _credential: &Credential) -> Result<Vec<BookmarkEntry>> {
        self.record("fetch_bookmarks")?;
        Ok(self.remote_bookmarks.lock().unwrap().clone())
    }

    async fn add_bookmark(&self, _credential: &Credential, _manga_id: &str) -> Result<()> {
        self.record("add_bookmark")
    }

    async fn remove_bookmark(&self, _credential: &Credential, _manga_id: &str) -> Result<()> {
        self.record("remove_bookmark")
    }

    async fn fetch_reading_history(&self, _credential: &Credential) -> Result<Vec<HistoryEntry>> {
        self.record("fetch_reading_history")?;
        Ok(self.remote_history.lock().unwrap().clone())
    }

    async fn add_history(&self, _credential: &Credential, _entry: &HistoryEntry) -> Result<()> {
        self.record("add_history")
    }

    async fn update_progress(
        &self,
        _credential: &Credential,
        manga_id: &str,
        chapter_id: &str,
        progress: u8,
    ) -> Result<()> {
        self.record("update_progress")?;
        self.progress_writes.lock().unwrap().push((
            manga_id.to_string(),
            chapter_id.to_string(),
            progress,
        ));
        Ok(())
    }

    async fn sync_library(&self, _credential: &Credential, snapshot: &LibrarySnapshot) -> Result<()> {
        self.pause("sync_library").await;
        self.record("sync_library")?;
        *self.uploaded.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    async fn fetch_statistics(&self, _credential: &Credential) -> Result<StatisticsSnapshot> {
        self.record("fetch_statistics")?;
        Ok(self.remote_stats.lock().unwrap().clone())
    }

    async fn upload_statistics(
        &self,
        _credential: &Credential,
        _snapshot: &StatisticsSnapshot,
    ) -> Result<()> {
        self.record("upload_statistics")
    }

    async fn submit_session(&self, _credential: &Credential, _session: &ReadingSession) -> Result<()> {
        self.record("submit_session")
    }
}

/// Key-value state held in a map.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn load_state(&self, key: &str) -> Result<Option<String>> {
        Ok(self.raw(key))
    }

    async fn save_state(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_state(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Store that behaves like disabled browser storage.
pub struct UnavailableStore;

#[async_trait::async_trait]
impl ChapterStore for UnavailableStore {
    async fn put(&self, _record: &ChapterRecord) -> Result<()> {
        Err(MangoError::store_unavailable("storage disabled"))
    }

    async fn get(&self, _chapter_id: &str) -> Result<Option<ChapterRecord>> {
        Err(MangoError::store_unavailable("storage disabled"))
    }

    async fn delete(&self, _chapter_id: &str) -> Result<bool> {
        Err(MangoError::store_unavailable("storage disabled"))
    }

    async fn list_all(&self) -> Result<Vec<ChapterRecord>> {
        Err(MangoError::store_unavailable("storage disabled"))
    }

    async fn list_by_manga(&self, _manga_id: &str) -> Result<Vec<ChapterRecord>> {
        Err(MangoError::store_unavailable("storage disabled"))
    }

    async fn clear(&self) -> Result<()> {
        Err(MangoError::store_unavailable("storage disabled"))
    }

    async fn used_bytes(&self) -> Result<u64> {
        Err(MangoError::store_unavailable("storage disabled"))
    }
}

#[async_trait::async_trait]
impl StateStore for UnavailableStore {
    async fn load_state(&self, _key: &str) -> Result<Option<String>> {
        Err(MangoError::store_unavailable("storage disabled"))
    }

    async fn save_state(&self, _key: &str, _value: &str) -> Result<()> {
        Err(MangoError::store_unavailable("storage disabled"))
    }

    async fn remove_state(&self, _key: &str) -> Result<()> {
        Err(MangoError::store_unavailable("storage disabled"))
    }
}

pub fn manga(id: &str) -> MangaSummary {
    MangaSummary {
        id: id.to_string(),
        title: format!("Truyện {}", id),
        slug: format!("truyen-{}", id),
        genres: vec!["Action".to_string()],
        ..Default::default()
    }
}

pub fn chapter(id: &str, number: f64) -> ChapterSummary {
    ChapterSummary {
        chapter_id: id.to_string(),
        chapter_number: number,
        title: format!("Chương {}", number),
    }
}

pub fn chapter_record(manga_id: &str, chapter_id: &str, pages: usize) -> ChapterRecord {
    let pages: Vec<PageAsset> = (0..pages)
        .map(|i| PageAsset {
            page_index: i as u32,
            source_url: page_url(chapter_id, i),
            encoded_data: "data:image/png;base64,iVBORw0KGgo=".to_string(),
            size_bytes: 1024,
        })
        .collect();
    let total_size_bytes = pages.iter().map(|p| p.size_bytes).sum();

    ChapterRecord {
        chapter_id: chapter_id.to_string(),
        manga_id: manga_id.to_string(),
        manga_title: format!("Truyện {}", manga_id),
        manga_slug: format!("truyen-{}", manga_id),
        chapter_number: 1.0,
        title: format!("Chương {}", chapter_id),
        pages,
        downloaded_at: Utc::now(),
        total_size_bytes,
    }
}
