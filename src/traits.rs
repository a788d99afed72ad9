use crate::error::Result;
use crate::models::{
    BookmarkEntry, ChapterDetails, ChapterRecord, Credential, HistoryEntry, LibrarySnapshot,
    PageBytes, ReadingSession,
};
use crate::stats::StatisticsSnapshot;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Remote catalog and per-user endpoints.
///
/// Mutations return `MangoError::RemoteRejection` when the server answers with
/// `success: false` and a network error when no answer arrives. Callers rely on
/// that split to decide between rollback and "saved locally".
#[async_trait::async_trait]
pub trait ContentService: Send + Sync {
    async fn fetch_chapter(&self, chapter_id: &str) -> Result<ChapterDetails>;

    async fn fetch_page(&self, url: &str) -> Result<PageBytes>;

    /// Best-effort view counter.
    async fn record_view(&self, chapter_id: &str) -> Result<()>;

    async fn fetch_bookmarks(&self, credential: &Credential) -> Result<Vec<BookmarkEntry>>;

    async fn add_bookmark(&self, credential: &Credential, manga_id: &str) -> Result<()>;

    async fn remove_bookmark(&self, credential: &Credential, manga_id: &str) -> Result<()>;

    async fn fetch_reading_history(&self, credential: &Credential) -> Result<Vec<HistoryEntry>>;

    async fn add_history(&self, credential: &Credential, entry: &HistoryEntry) -> Result<()>;

    async fn update_progress(
        &self,
        credential: &Credential,
        manga_id: &str,
        chapter_id: &str,
        progress: u8,
    ) -> Result<()>;

    async fn sync_library(&self, credential: &Credential, snapshot: &LibrarySnapshot)
        -> Result<()>;

    async fn fetch_statistics(&self, credential: &Credential) -> Result<StatisticsSnapshot>;

    async fn upload_statistics(
        &self,
        credential: &Credential,
        snapshot: &StatisticsSnapshot,
    ) -> Result<()>;

    async fn submit_session(&self, credential: &Credential, session: &ReadingSession) -> Result<()>;
}

/// Durable chapter blob store. Every call is atomic for its chapter.
#[async_trait::async_trait]
pub trait ChapterStore: Send + Sync {
    async fn put(&self, record: &ChapterRecord) -> Result<()>;

    async fn get(&self, chapter_id: &str) -> Result<Option<ChapterRecord>>;

    async fn delete(&self, chapter_id: &str) -> Result<bool>;

    async fn list_all(&self) -> Result<Vec<ChapterRecord>>;

    async fn list_by_manga(&self, manga_id: &str) -> Result<Vec<ChapterRecord>>;

    async fn clear(&self) -> Result<()>;

    /// Bytes of page data currently held.
    async fn used_bytes(&self) -> Result<u64>;
}

/// Key-value store for serialized local state (settings, bookmarks, history, ...).
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self, key: &str) -> Result<Option<String>>;

    async fn save_state(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_state(&self, key: &str) -> Result<()>;
}

pub async fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.load_state(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.save_state(key, &raw).await
}
