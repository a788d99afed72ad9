use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a manga taken when a bookmark, history entry or download is created.
/// Never refreshed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MangaSummary {
    pub id: String,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterSummary {
    pub chapter_id: String,
    pub chapter_number: f64,
    #[serde(default)]
    pub title: String,
}

/// One stored page image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageAsset {
    pub page_index: u32,
    pub source_url: String,
    /// `data:<mime>;base64,<payload>`
    pub encoded_data: String,
    pub size_bytes: u64,
}

/// A chapter available offline. Either every page is present or the record does not exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRecord {
    pub chapter_id: String,
    pub manga_id: String,
    pub manga_title: String,
    pub manga_slug: String,
    pub chapter_number: f64,
    pub title: String,
    pub pages: Vec<PageAsset>,
    pub downloaded_at: DateTime<Utc>,
    pub total_size_bytes: u64,
}

impl ChapterRecord {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Pages are dense and ordered from index 0.
    pub fn is_contiguous(&self) -> bool {
        self.pages
            .iter()
            .enumerate()
            .all(|(index, page)| page.page_index as usize == index)
    }

    pub fn summary(&self) -> OfflineChapter {
        OfflineChapter {
            chapter_id: self.chapter_id.clone(),
            manga_id: self.manga_id.clone(),
            manga_title: self.manga_title.clone(),
            chapter_number: self.chapter_number,
            chapter_title: self.title.clone(),
            page_count: self.pages.len(),
            downloaded_at: self.downloaded_at,
            size_bytes: self.total_size_bytes,
        }
    }
}

/// Lightweight entry of the in-memory offline index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OfflineChapter {
    pub chapter_id: String,
    pub manga_id: String,
    pub manga_title: String,
    pub chapter_number: f64,
    pub chapter_title: String,
    pub page_count: usize,
    pub downloaded_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkEntry {
    pub manga_id: String,
    pub manga: MangaSummary,
    pub added_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub current_chapter: Option<String>,
    pub reading_progress: u8,
}

impl BookmarkEntry {
    pub fn new(manga: &MangaSummary) -> Self {
        Self {
            manga_id: manga.id.clone(),
            manga: manga.clone(),
            added_at: Utc::now(),
            last_read_at: None,
            current_chapter: None,
            reading_progress: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub manga_id: String,
    pub chapter_id: String,
    pub manga: MangaSummary,
    pub chapter: ChapterSummary,
    pub last_read_at: DateTime<Utc>,
    pub reading_progress: u8,
    pub total_pages: u32,
}

impl HistoryEntry {
    pub fn new(manga: &MangaSummary, chapter: &ChapterSummary, total_pages: u32) -> Self {
        Self {
            manga_id: manga.id.clone(),
            chapter_id: chapter.chapter_id.clone(),
            manga: manga.clone(),
            chapter: chapter.clone(),
            last_read_at: Utc::now(),
            reading_progress: 0,
            total_pages,
        }
    }

    pub fn matches(&self, manga_id: &str, chapter_id: &str) -> bool {
        self.manga_id == manga_id && self.chapter_id == chapter_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub manga_id: String,
    pub chapter_id: String,
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// `mangaId-chapterId`, the key of the progress map.
    pub fn key_for(manga_id: &str, chapter_id: &str) -> String {
        format!("{}-{}", manga_id, chapter_id)
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.manga_id, &self.chapter_id)
    }
}

/// Chapter metadata returned by the Content Service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterPayload {
    pub chapter_id: String,
    pub manga_id: String,
    pub chapter_number: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChapterNavigation {
    pub next: Option<ChapterSummary>,
    pub previous: Option<ChapterSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterDetails {
    pub chapter: ChapterPayload,
    #[serde(default)]
    pub navigation: ChapterNavigation,
}

/// `{success, data, error?}` wrapper used by every Content Service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Full local snapshot uploaded during reconciliation and used for backups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LibrarySnapshot {
    pub bookmarks: Vec<BookmarkEntry>,
    pub reading_history: Vec<HistoryEntry>,
    pub reading_progress: std::collections::BTreeMap<String, ProgressRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LibraryExport {
    #[serde(flatten)]
    pub snapshot: LibrarySnapshot,
    pub exported_at: DateTime<Utc>,
}

/// Ephemeral record of one continuous reading interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSession {
    pub session_id: uuid::Uuid,
    pub start_time: DateTime<Utc>,
    pub manga_id: String,
    pub chapter_id: String,
    pub pages_read: u32,
    /// Minutes.
    pub time_spent: f64,
}

impl ReadingSession {
    pub fn start(manga_id: impl Into<String>, chapter_id: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4(),
            start_time: Utc::now(),
            manga_id: manga_id.into(),
            chapter_id: chapter_id.into(),
            pages_read: 0,
            time_spent: 0.0,
        }
    }
}

/// Opaque bearer credential issued by the Auth Service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential(***)")
    }
}

/// Raw page image as fetched from the network.
#[derive(Debug, Clone, PartialEq)]
pub struct PageBytes {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}
