use crate::config::{Config, DownloadConfig};
use crate::error::{MangoError, Result};
use crate::models::{ChapterRecord, MangaSummary, OfflineChapter, PageAsset, PageBytes};
use crate::quota::QuotaMonitor;
use crate::traits::{ChapterStore, ContentService};
use crate::utils::encode_data_url;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadControl {
    Running,
    Cancelled,
}

type Registry = Arc<Mutex<HashMap<String, watch::Sender<DownloadControl>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the chapter from the in-flight set on every exit path.
struct InFlightGuard {
    registry: Registry,
    chapter_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.chapter_id);
    }
}

pub struct DownloadManager {
    store: Arc<dyn ChapterStore>,
    content: Arc<dyn ContentService>,
    quota: QuotaMonitor,
    config: DownloadConfig,
    chapter_estimate_bytes: u64,
    in_flight: Registry,
    progress: watch::Sender<BTreeMap<String, f64>>,
    offline: RwLock<Vec<OfflineChapter>>,
    slots: Semaphore,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

/// Everything one page fetch needs, owned so the per-page futures are `Send + 'static`.
#[derive(Clone)]
struct PageFetch {
    content: Arc<dyn ContentService>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    retry_delay: Duration,
    max_attempts: u32,
    timeout: Duration,
}

impl DownloadManager {
    pub fn new(
        store: Arc<dyn ChapterStore>,
        content: Arc<dyn ContentService>,
        config: &Config,
    ) -> Self {
        let limiter = Quota::with_period(Duration::from_millis(config.download.rate_limit_ms))
            .map(|quota| Arc::new(RateLimiter::direct(quota)));
        let (progress, _) = watch::channel(BTreeMap::new());

        Self {
            quota: QuotaMonitor::new(store.clone(), &config.storage),
            store,
            content,
            config: config.download.clone(),
            chapter_estimate_bytes: config.storage.chapter_size_estimate_mb.saturating_mul(MB),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            progress,
            offline: RwLock::new(Vec::new()),
            slots: Semaphore::new(config.download.max_concurrent_downloads.max(1)),
            limiter,
        }
    }

    pub fn quota(&self) -> &QuotaMonitor {
        &self.quota
    }

    /// Downloads every page of a chapter and stores it. Nothing is stored unless all pages arrived.
    pub async fn download_chapter(
        &self,
        chapter_id: &str,
        manga: &MangaSummary,
    ) -> Result<ChapterRecord> {
        let (control_tx, control_rx) = watch::channel(DownloadControl::Running);
        {
            let mut registry = lock(&self.in_flight);
            if registry.contains_key(chapter_id) {
                debug!("[DOWNLOAD] Chapter {} already downloading", chapter_id);
                return Err(MangoError::AlreadyInProgress(chapter_id.to_string()));
            }
            registry.insert(chapter_id.to_string(), control_tx);
        }
        let _guard = InFlightGuard {
            registry: self.in_flight.clone(),
            chapter_id: chapter_id.to_string(),
        };

        let estimate = self.quota.check_quota().await;
        if estimate.is_unknown() {
            warn!("[DOWNLOAD] Storage quota unknown, assuming enough space for {}", chapter_id);
        } else if !estimate.admits(self.chapter_estimate_bytes) {
            warn!(
                "[DOWNLOAD] Not enough space for {}: {} bytes available",
                chapter_id,
                estimate.available()
            );
            return Err(MangoError::InsufficientStorage {
                available_bytes: estimate.available(),
                required_bytes: self.chapter_estimate_bytes,
            });
        }

        info!("[DOWNLOAD] Downloading chapter {} of {}", chapter_id, manga.title);
        self.set_progress(chapter_id, 0.0);

        let work = async {
            let _permit = self
                .slots
                .acquire()
                .await
                .map_err(|_| MangoError::Cancelled(chapter_id.to_string()))?;
            self.fetch_and_store(chapter_id, manga).await
        };

        let result = tokio::select! {
            result = work => result,
            _ = wait_cancelled(control_rx) => {
                info!("[DOWNLOAD] Chapter {} cancelled", chapter_id);
                Err(MangoError::Cancelled(chapter_id.to_string()))
            }
        };

        match &result {
            Ok(record) => {
                self.set_progress(chapter_id, 100.0);
                self.index_insert(record.summary());
                info!(
                    "[DOWNLOAD] Chapter {} stored: {} pages, {} bytes",
                    chapter_id,
                    record.page_count(),
                    record.total_size_bytes
                );
            }
            Err(e) => {
                self.clear_progress(chapter_id);
                error!("[DOWNLOAD] Chapter {} failed: {}", chapter_id, e);
            }
        }

        result
    }

    async fn fetch_and_store(&self, chapter_id: &str, manga: &MangaSummary) -> Result<ChapterRecord> {
        let details = self.content.fetch_chapter(chapter_id).await?;
        let payload = details.chapter;
        if !payload.chapter_id.is_empty() && payload.chapter_id != chapter_id {
            return Err(MangoError::invalid_data(format!(
                "Requested chapter {} but server returned {}",
                chapter_id, payload.chapter_id
            )));
        }
        self.set_progress(chapter_id, 20.0);

        let expected = payload.images.len();
        if expected == 0 {
            return Err(MangoError::invalid_data(format!("Chapter {} has no pages", chapter_id)));
        }
        debug!("[DOWNLOAD] Chapter {} has {} pages", chapter_id, expected);

        let fetches: Vec<_> = payload
            .images
            .into_iter()
            .enumerate()
            .map(|(index, url)| {
                let fetch = self.page_fetch();
                async move {
                    let result = fetch.run(&url).await;
                    (index, url, result)
                }
            })
            .collect();
        let mut results = stream::iter(fetches).buffered(self.config.page_concurrency.max(1));

        let mut pages = Vec::with_capacity(expected);
        let mut missing = 0;
        let mut done = 0;
        while let Some((index, url, result)) = results.next().await {
            done += 1;
            self.set_progress(chapter_id, 20.0 + done as f64 / expected as f64 * 70.0);
            match result {
                Ok(page) => pages.push(PageAsset {
                    page_index: index as u32,
                    source_url: url,
                    encoded_data: encode_data_url(&page),
                    size_bytes: page.bytes.len() as u64,
                }),
                Err(e) => {
                    warn!("[DOWNLOAD] Page {} of {} failed: {}", index, chapter_id, e);
                    missing += 1;
                }
            }
        }

        if missing > 0 {
            return Err(MangoError::PartialDownload {
                chapter_id: chapter_id.to_string(),
                missing,
                expected,
            });
        }

        let record = ChapterRecord {
            chapter_id: chapter_id.to_string(),
            manga_id: payload.manga_id,
            manga_title: manga.title.clone(),
            manga_slug: manga.slug.clone(),
            chapter_number: payload.chapter_number,
            title: payload.title,
            total_size_bytes: pages.iter().map(|p| p.size_bytes).sum(),
            pages,
            downloaded_at: Utc::now(),
        };

        self.store.put(&record).await?;
        Ok(record)
    }

    fn page_fetch(&self) -> PageFetch {
        PageFetch {
            content: self.content.clone(),
            limiter: self.limiter.clone(),
            retry_delay: Duration::from_millis(self.config.retry_delay_ms.max(1)),
            max_attempts: self.config.retry_attempts.max(1),
            timeout: Duration::from_secs(self.config.page_timeout_secs.max(1)),
        }
    }

    /// Signals an in-flight download to stop. Returns false if the chapter is not downloading.
    pub fn cancel(&self, chapter_id: &str) -> bool {
        match lock(&self.in_flight).get(chapter_id) {
            Some(control) => {
                control.send_replace(DownloadControl::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.in_flight).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_downloading(&self, chapter_id: &str) -> bool {
        lock(&self.in_flight).contains_key(chapter_id)
    }

    pub fn progress(&self, chapter_id: &str) -> Option<f64> {
        self.progress.borrow().get(chapter_id).copied()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, f64>> {
        self.progress.subscribe()
    }

    fn set_progress(&self, chapter_id: &str, value: f64) {
        self.progress.send_modify(|progress| {
            progress.insert(chapter_id.to_string(), value.min(100.0));
        });
    }

    fn clear_progress(&self, chapter_id: &str) {
        self.progress.send_modify(|progress| {
            progress.remove(chapter_id);
        });
    }

    fn index_insert(&self, chapter: OfflineChapter) {
        let mut index = self.offline.write().unwrap_or_else(PoisonError::into_inner);
        index.retain(|c| c.chapter_id != chapter.chapter_id);
        index.push(chapter);
    }

    /// Rebuilds the offline index from the store. An unavailable store leaves the index empty.
    pub async fn load_offline_chapters(&self) -> Vec<OfflineChapter> {
        let chapters = match self.store.list_all().await {
            Ok(records) => records.iter().map(ChapterRecord::summary).collect(),
            Err(e) => {
                warn!("[DOWNLOAD] Offline index unavailable, continuing online only: {}", e);
                Vec::new()
            }
        };

        *self.offline.write().unwrap_or_else(PoisonError::into_inner) = chapters.clone();
        info!("[DOWNLOAD] Loaded {} offline chapters", chapters.len());
        chapters
    }

    pub async fn get_offline_chapter(&self, chapter_id: &str) -> Option<ChapterRecord> {
        match self.store.get(chapter_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("[DOWNLOAD] Could not read offline chapter {}: {}", chapter_id, e);
                None
            }
        }
    }

    pub async fn delete_chapter(&self, chapter_id: &str) -> Result<bool> {
        let deleted = self.store.delete(chapter_id).await?;
        self.offline
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| c.chapter_id != chapter_id);
        self.clear_progress(chapter_id);
        info!("[DOWNLOAD] Deleted offline chapter {}", chapter_id);
        Ok(deleted)
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear().await?;
        self.offline.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.progress.send_modify(|progress| progress.clear());
        Ok(())
    }

    pub fn offline_chapters(&self) -> Vec<OfflineChapter> {
        self.offline.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_chapter_offline(&self, chapter_id: &str) -> bool {
        self.offline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|c| c.chapter_id == chapter_id)
    }

    pub fn offline_chapters_by_manga(&self, manga_id: &str) -> Vec<OfflineChapter> {
        let mut chapters: Vec<OfflineChapter> = self
            .offline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.manga_id == manga_id)
            .cloned()
            .collect();
        chapters.sort_by(|a, b| a.chapter_number.total_cmp(&b.chapter_number));
        chapters
    }

    pub fn total_offline_size(&self) -> u64 {
        self.offline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.size_bytes)
            .sum()
    }

    pub fn total_offline_chapters(&self) -> usize {
        self.offline.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl PageFetch {
    /// One page with timeout and bounded exponential retry on transport failures.
    async fn run(self, url: &str) -> Result<PageBytes> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_delay)
            .with_max_elapsed_time(None)
            .build();
        let attempts = Arc::new(AtomicU32::new(0));

        backoff::future::retry(policy, || {
            let fetch = self.clone();
            let url = url.to_string();
            let attempts = attempts.clone();
            async move {
                if let Some(limiter) = &fetch.limiter {
                    limiter.until_ready().await;
                }

                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let page = fetch.content.fetch_page(&url);
                let result = match tokio::time::timeout(fetch.timeout, page).await {
                    Ok(result) => result,
                    Err(_) => Err(MangoError::network(format!("Timed out fetching {}", url))),
                };

                result.map_err(|e| {
                    if e.is_network() && attempt < fetch.max_attempts {
                        debug!("[DOWNLOAD] Retrying {} after attempt {}: {}", url, attempt, e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

async fn wait_cancelled(mut control: watch::Receiver<DownloadControl>) {
    if control
        .wait_for(|state| *state == DownloadControl::Cancelled)
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}
