use crate::config::ReaderConfig;
use crate::gesture::{
    key_action, GestureAction, GestureOptions, GestureTracker, KeyAction, ReadingDirection,
    TouchPoint,
};
use crate::models::{ChapterSummary, MangaSummary, ReadingSession};
use crate::preload::{NetworkConditions, PreloadPolicy, PreloadScheduler};
use crate::stats::Achievement;
use crate::sync::{keys, SyncEngine};
use crate::traits::{load_json, save_json, StateStore};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingMode {
    #[default]
    Vertical,
    Horizontal,
    Webtoon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFit {
    #[default]
    Width,
    Height,
    Original,
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageTransition {
    #[default]
    Slide,
    Fade,
    None,
}

/// Reader preferences, persisted under `mango-reader-settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaderSettings {
    pub reading_mode: ReadingMode,
    pub image_fit: ImageFit,
    pub background_color: String,
    pub brightness: u16,
    pub contrast: u16,
    pub auto_scroll: bool,
    pub auto_scroll_speed: u8,
    pub page_transition: PageTransition,
    pub double_tap_zoom: bool,
    pub gesture_navigation: bool,
    pub fullscreen: bool,
    #[serde(rename = "hideUI")]
    pub hide_ui: bool,
    pub reading_direction: ReadingDirection,
    pub preload_pages: u32,
    pub offline_mode: bool,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            reading_mode: ReadingMode::default(),
            image_fit: ImageFit::default(),
            background_color: "#000000".to_string(),
            brightness: 100,
            contrast: 100,
            auto_scroll: false,
            auto_scroll_speed: 3,
            page_transition: PageTransition::default(),
            double_tap_zoom: true,
            gesture_navigation: true,
            fullscreen: false,
            hide_ui: false,
            reading_direction: ReadingDirection::default(),
            preload_pages: 3,
            offline_mode: false,
        }
    }
}

impl ReaderSettings {
    pub async fn load(store: &dyn StateStore) -> Self {
        match load_json(store, keys::READER_SETTINGS).await {
            Ok(settings) => settings.unwrap_or_default(),
            Err(e) => {
                warn!("[READER] Using default settings: {}", e);
                Self::default()
            }
        }
    }

    pub async fn save(&self, store: &dyn StateStore) {
        if let Err(e) = save_json(store, keys::READER_SETTINGS, self).await {
            warn!("[READER] Settings not persisted: {}", e);
        }
    }

    fn gesture_options(&self) -> GestureOptions {
        GestureOptions {
            direction: self.reading_direction,
            gesture_navigation: self.gesture_navigation,
            double_tap_zoom: self.double_tap_zoom,
        }
    }
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session: ReadingSession,
    pub unlocked: Vec<&'static Achievement>,
}

struct ChapterContext {
    manga: MangaSummary,
    chapter: ChapterSummary,
}

/// Drives page navigation for one reader. Owns all per-reader state.
pub struct ReadingSessionController {
    sync: Arc<SyncEngine>,
    store: Arc<dyn StateStore>,
    settings: ReaderSettings,
    policy: PreloadPolicy,
    network: NetworkConditions,
    preloader: Option<PreloadScheduler>,
    gestures: GestureTracker,
    context: Option<ChapterContext>,
    session: Option<ReadingSession>,
    current_page: u32,
    total_pages: u32,
    started_at: Option<Instant>,
    visited: BTreeSet<u32>,
    last_reported: Option<u8>,
    zoomed: bool,
}

impl ReadingSessionController {
    pub async fn new(sync: Arc<SyncEngine>, store: Arc<dyn StateStore>, config: &ReaderConfig) -> Self {
        let settings = ReaderSettings::load(store.as_ref()).await;
        Self {
            sync,
            store,
            settings,
            policy: PreloadPolicy::from_config(config),
            network: NetworkConditions::default(),
            preloader: None,
            gestures: GestureTracker::default(),
            context: None,
            session: None,
            current_page: 1,
            total_pages: 0,
            started_at: None,
            visited: BTreeSet::new(),
            last_reported: None,
            zoomed: false,
        }
    }

    pub fn settings(&self) -> &ReaderSettings {
        &self.settings
    }

    pub async fn update_settings(&mut self, update: impl FnOnce(&mut ReaderSettings)) {
        update(&mut self.settings);
        self.settings.save(self.store.as_ref()).await;
    }

    pub fn set_network_conditions(&mut self, network: NetworkConditions) {
        self.network = network;
    }

    /// Opens a chapter: records it in history, starts the session and the timer.
    pub async fn start_session(
        &mut self,
        manga: &MangaSummary,
        chapter: &ChapterSummary,
        total_pages: u32,
        preloader: Option<PreloadScheduler>,
    ) {
        if let Err(e) = self.sync.add_to_history(manga, chapter, total_pages).await {
            debug!("[READER] History entry not kept: {}", e);
        }

        self.sync.record_view(&chapter.chapter_id);

        self.context = Some(ChapterContext {
            manga: manga.clone(),
            chapter: chapter.clone(),
        });
        self.session = Some(ReadingSession::start(&manga.id, &chapter.chapter_id));
        self.preloader = preloader;
        self.initialize_reading(total_pages);
        info!(
            "[READER] Reading {} chapter {} ({} pages)",
            manga.title, chapter.chapter_number, total_pages
        );
    }

    /// Resets position to page 1, restarts the timer and preloads ahead.
    pub fn initialize_reading(&mut self, total_pages: u32) {
        self.total_pages = total_pages;
        self.current_page = 1;
        self.started_at = Some(Instant::now());
        self.visited = BTreeSet::from([1]);
        self.last_reported = None;
        self.zoomed = false;
        if let Some(preloader) = &self.preloader {
            preloader.reset();
        }
        self.preload();
    }

    pub fn preload_window(&self) -> u32 {
        self.policy
            .with_base(self.settings.preload_pages)
            .window(&self.network, Local::now().date_naive())
    }

    fn preload(&self) {
        if let Some(preloader) = &self.preloader {
            preloader.schedule_preload(self.current_page, self.total_pages, self.preload_window());
        }
    }

    pub async fn next_page(&mut self) -> bool {
        if self.current_page >= self.total_pages {
            return false;
        }
        self.current_page += 1;
        self.page_changed(true).await;
        true
    }

    pub async fn previous_page(&mut self) -> bool {
        if self.current_page <= 1 {
            return false;
        }
        self.current_page -= 1;
        self.page_changed(false).await;
        true
    }

    /// Out-of-range pages leave the position unchanged.
    pub async fn go_to_page(&mut self, page: u32) -> bool {
        if page < 1 || page > self.total_pages {
            return false;
        }
        self.current_page = page;
        self.page_changed(true).await;
        true
    }

    async fn page_changed(&mut self, forward: bool) {
        self.visited.insert(self.current_page);
        if forward {
            self.preload();
        }
        if let Some(preloader) = &self.preloader {
            preloader.release_behind(self.current_page);
        }

        let progress = self.progress_percentage().round() as u8;
        if self.last_reported == Some(progress) {
            return;
        }
        self.last_reported = Some(progress);
        if let Some(context) = &self.context {
            self.sync
                .update_progress(&context.manga.id, &context.chapter.chapter_id, progress)
                .await;
        }
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn is_first_page(&self) -> bool {
        self.current_page <= 1
    }

    pub fn is_last_page(&self) -> bool {
        self.current_page >= self.total_pages
    }

    pub fn is_zoomed(&self) -> bool {
        self.zoomed
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        f64::from(self.current_page) / f64::from(self.total_pages) * 100.0
    }

    pub fn reading_minutes(&self) -> f64 {
        self.started_at
            .map_or(0.0, |started| started.elapsed().as_secs_f64() / 60.0)
    }

    pub fn pages_per_minute(&self) -> f64 {
        let minutes = self.reading_minutes();
        if minutes <= 0.0 {
            return 0.0;
        }
        f64::from(self.current_page) / minutes
    }

    pub fn touch_start(&mut self, point: TouchPoint) {
        self.gestures.touch_start(point);
    }

    pub fn touch_move(&mut self, point: TouchPoint) {
        self.gestures.touch_move(point, self.settings.gesture_options());
    }

    pub async fn touch_end(&mut self, point: TouchPoint) -> GestureAction {
        let action = self.gestures.touch_end(point, self.settings.gesture_options());
        match action {
            GestureAction::NextPage => {
                self.next_page().await;
            }
            GestureAction::PreviousPage => {
                self.previous_page().await;
            }
            GestureAction::ToggleZoom => self.zoomed = !self.zoomed,
            GestureAction::None => {}
        }
        action
    }

    pub async fn handle_key(&mut self, key: &str) -> Option<KeyAction> {
        let action = key_action(key, self.settings.reading_direction)?;
        match action {
            KeyAction::NextPage => {
                self.next_page().await;
            }
            KeyAction::PreviousPage => {
                self.previous_page().await;
            }
            KeyAction::ToggleUi => {
                self.update_settings(|s| s.hide_ui = !s.hide_ui).await;
            }
            KeyAction::ToggleFullscreen => {
                self.update_settings(|s| s.fullscreen = !s.fullscreen).await;
            }
            KeyAction::ExitFullscreen if self.settings.fullscreen => {
                self.update_settings(|s| s.fullscreen = false).await;
            }
            KeyAction::ExitFullscreen | KeyAction::ScrollUp | KeyAction::ScrollDown => {}
        }
        Some(action)
    }

    /// Folds the session into the statistics and reports it remotely in the background.
    pub async fn end_session(&mut self, now: DateTime<Local>) -> Option<SessionSummary> {
        let mut session = self.session.take()?;
        session.time_spent = self.reading_minutes();
        session.pages_read = self.visited.len() as u32;
        self.started_at = None;

        let unlocked = self.sync.record_session(&session, now).await;
        self.sync.submit_session(session.clone());
        info!(
            "[READER] Session ended: {} pages in {:.1} minutes",
            session.pages_read, session.time_spent
        );

        Some(SessionSummary { session, unlocked })
    }
}
