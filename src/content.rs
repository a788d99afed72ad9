use crate::config::ContentConfig;
use crate::error::Result;
use crate::models::{
    BookmarkEntry, ChapterDetails, Credential, HistoryEntry, LibrarySnapshot, PageBytes,
    ReadingSession,
};
use crate::stats::StatisticsSnapshot;
use crate::traits::ContentService;
use crate::utils::HttpClient;
use reqwest::Method;
use serde_json::json;
use tracing::debug;
use url::Url;

/// Content Service over HTTP+JSON.
pub struct HttpContentService {
    http_client: HttpClient,
    base_url: Url,
}

impl HttpContentService {
    pub fn new(config: &ContentConfig) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(config)?,
            base_url: Url::parse(&config.base_url)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<String> {
        Ok(self.base_url.join(path)?.to_string())
    }

    /// Page URLs may be relative to the service.
    fn resolve(&self, url: &str) -> Result<String> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute.to_string()),
            Err(url::ParseError::RelativeUrlWithoutBase) => self.endpoint(url),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl ContentService for HttpContentService {
    async fn fetch_chapter(&self, chapter_id: &str) -> Result<ChapterDetails> {
        let url = self.endpoint(&format!("/api/chapters/{}", chapter_id))?;
        debug!("[CONTENT] GET {}", url);
        self.http_client.get_json(&url, None).await
    }

    async fn fetch_page(&self, url: &str) -> Result<PageBytes> {
        let url = self.resolve(url)?;
        self.http_client.get_bytes(&url).await
    }

    async fn record_view(&self, chapter_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("/api/chapters/{}/view", chapter_id))?;
        self.http_client
            .send_json::<()>(Method::POST, &url, None, None)
            .await
    }

    async fn fetch_bookmarks(&self, credential: &Credential) -> Result<Vec<BookmarkEntry>> {
        let url = self.endpoint("/api/user/bookmarks")?;
        self.http_client.get_json(&url, Some(credential)).await
    }

    async fn add_bookmark(&self, credential: &Credential, manga_id: &str) -> Result<()> {
        let url = self.endpoint("/api/user/bookmarks")?;
        let body = json!({ "mangaId": manga_id });
        self.http_client
            .send_json(Method::POST, &url, Some(credential), Some(&body))
            .await
    }

    async fn remove_bookmark(&self, credential: &Credential, manga_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("/api/user/bookmarks/{}", manga_id))?;
        self.http_client
            .send_json::<()>(Method::DELETE, &url, Some(credential), None)
            .await
    }

    async fn fetch_reading_history(&self, credential: &Credential) -> Result<Vec<HistoryEntry>> {
        let url = self.endpoint("/api/user/reading-history")?;
        self.http_client.get_json(&url, Some(credential)).await
    }

    async fn add_history(&self, credential: &Credential, entry: &HistoryEntry) -> Result<()> {
        let url = self.endpoint("/api/user/reading-history")?;
        self.http_client
            .send_json(Method::POST, &url, Some(credential), Some(entry))
            .await
    }

    async fn update_progress(
        &self,
        credential: &Credential,
        manga_id: &str,
        chapter_id: &str,
        progress: u8,
    ) -> Result<()> {
        let url = self.endpoint("/api/user/reading-progress")?;
        let body = json!({
            "mangaId": manga_id,
            "chapterId": chapter_id,
            "progress": progress,
        });
        self.http_client
            .send_json(Method::POST, &url, Some(credential), Some(&body))
            .await
    }

    async fn sync_library(
        &self,
        credential: &Credential,
        snapshot: &LibrarySnapshot,
    ) -> Result<()> {
        let url = self.endpoint("/api/user/sync-bookmarks")?;
        self.http_client
            .send_json(Method::POST, &url, Some(credential), Some(snapshot))
            .await
    }

    async fn fetch_statistics(&self, credential: &Credential) -> Result<StatisticsSnapshot> {
        let url = self.endpoint("/api/user/reading-stats")?;
        self.http_client.get_json(&url, Some(credential)).await
    }

    async fn upload_statistics(
        &self,
        credential: &Credential,
        snapshot: &StatisticsSnapshot,
    ) -> Result<()> {
        let url = self.endpoint("/api/user/reading-stats")?;
        self.http_client
            .send_json(Method::POST, &url, Some(credential), Some(snapshot))
            .await
    }

    async fn submit_session(&self, credential: &Credential, session: &ReadingSession) -> Result<()> {
        let url = self.endpoint("/api/user/reading-session")?;
        self.http_client
            .send_json(Method::POST, &url, Some(credential), Some(session))
            .await
    }
}
