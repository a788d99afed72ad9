use crate::config::ReaderConfig;
use crate::error::{MangoError, Result};
use crate::models::{ChapterRecord, PageBytes};
use crate::traits::ContentService;
use crate::utils::decode_data_url;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::debug;

/// Where the pages of the chapter being read come from.
#[derive(Debug, Clone)]
pub enum PageSource {
    Online(Vec<String>),
    Offline(Arc<ChapterRecord>),
}

impl PageSource {
    pub fn page_count(&self) -> usize {
        match self {
            PageSource::Online(urls) => urls.len(),
            PageSource::Offline(record) => record.page_count(),
        }
    }
}

/// Connection hints as reported by the client platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConditions {
    pub effective_type: Option<String>,
    /// Mbps.
    pub downlink: Option<f64>,
    pub save_data: bool,
}

impl NetworkConditions {
    pub fn is_constrained(&self) -> bool {
        let slow_type = matches!(
            self.effective_type.as_deref(),
            Some("slow-2g") | Some("2g") | Some("3g")
        );
        let slow_link = self.downlink.is_some_and(|mbps| mbps < 1.5);
        self.save_data || slow_type || slow_link
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreloadPolicy {
    pub base: u32,
    pub constrained: u32,
    pub weekend: u32,
}

impl PreloadPolicy {
    pub fn from_config(config: &ReaderConfig) -> Self {
        Self {
            base: config.preload_pages,
            constrained: config.slow_network_preload_pages,
            weekend: config.weekend_preload_pages,
        }
    }

    pub fn with_base(mut self, base: u32) -> Self {
        self.base = base;
        self
    }

    /// Advisory window size: slow links shrink it, weekends grow it.
    pub fn window(&self, network: &NetworkConditions, today: NaiveDate) -> u32 {
        if network.is_constrained() {
            return self.constrained.min(self.base).max(1);
        }
        match today.weekday() {
            Weekday::Sat | Weekday::Sun => self.base.max(self.weekend),
            _ => self.base,
        }
    }
}

#[derive(Default)]
struct PreloadState {
    preloaded: BTreeSet<u32>,
    in_flight: HashSet<u32>,
    cache: BTreeMap<u32, PageBytes>,
}

fn lock(state: &Mutex<PreloadState>) -> MutexGuard<'_, PreloadState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetches upcoming pages in the background. Pages are numbered from 1.
#[derive(Clone)]
pub struct PreloadScheduler {
    content: Arc<dyn ContentService>,
    source: Arc<PageSource>,
    state: Arc<Mutex<PreloadState>>,
}

impl PreloadScheduler {
    pub fn new(content: Arc<dyn ContentService>, source: PageSource) -> Self {
        Self {
            content,
            source: Arc::new(source),
            state: Arc::new(Mutex::new(PreloadState::default())),
        }
    }

    pub fn source(&self) -> &PageSource {
        &self.source
    }

    /// Spawns a fetch for every page in `(current, current + window]` that is not loaded yet.
    /// Returns immediately; failures are logged and the page stays eligible for the next call.
    pub fn schedule_preload(&self, current: u32, total: u32, window: u32) -> Vec<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("[PRELOAD] No runtime, skipping preload");
            return Vec::new();
        };

        let last = current.saturating_add(window).min(total);
        let mut handles = Vec::new();

        for page in current.saturating_add(1)..=last {
            {
                let mut state = lock(&self.state);
                if state.preloaded.contains(&page) || !state.in_flight.insert(page) {
                    continue;
                }
            }

            let scheduler = self.clone();
            handles.push(runtime.spawn(async move {
                let result = scheduler.fetch(page).await;
                let mut state = lock(&scheduler.state);
                state.in_flight.remove(&page);
                match result {
                    Ok(bytes) => {
                        state.preloaded.insert(page);
                        state.cache.insert(page, bytes);
                    }
                    Err(e) => debug!("[PRELOAD] Page {} not preloaded: {}", page, e),
                }
            }));
        }

        if !handles.is_empty() {
            debug!("[PRELOAD] Scheduled {} pages after page {}", handles.len(), current);
        }
        handles
    }

    async fn fetch(&self, page: u32) -> Result<PageBytes> {
        let index = page
            .checked_sub(1)
            .map(|i| i as usize)
            .ok_or_else(|| MangoError::invalid_data("Page numbers start at 1"))?;

        match self.source.as_ref() {
            PageSource::Online(urls) => {
                let url = urls
                    .get(index)
                    .ok_or_else(|| MangoError::invalid_data(format!("No page {}", page)))?;
                self.content.fetch_page(url).await
            }
            PageSource::Offline(record) => {
                let asset = record
                    .pages
                    .get(index)
                    .ok_or_else(|| MangoError::invalid_data(format!("No page {}", page)))?;
                let content_type = asset
                    .encoded_data
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split(';').next())
                    .map(str::to_string);
                Ok(PageBytes {
                    bytes: decode_data_url(&asset.encoded_data)?,
                    content_type,
                })
            }
        }
    }

    /// Drops cached pages more than one page behind the reader.
    pub fn release_behind(&self, current: u32) {
        let keep_from = current.saturating_sub(1);
        let mut state = lock(&self.state);
        state.cache.retain(|page, _| *page >= keep_from);
        state.preloaded.retain(|page| *page >= keep_from);
    }

    pub fn is_preloaded(&self, page: u32) -> bool {
        lock(&self.state).preloaded.contains(&page)
    }

    pub fn preloaded_pages(&self) -> Vec<u32> {
        lock(&self.state).preloaded.iter().copied().collect()
    }

    pub fn cached_page(&self, page: u32) -> Option<PageBytes> {
        lock(&self.state).cache.get(&page).cloned()
    }

    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.preloaded.clear();
        state.cache.clear();
    }
}
