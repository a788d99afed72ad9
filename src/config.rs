use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub content: ContentConfig,
    pub storage: StorageConfig,
    pub download: DownloadConfig,
    pub sync: SyncConfig,
    pub reader: ReaderConfig,
}

/// Remote Content Service endpoint and the bearer credential issued by the Auth Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    /// Capacity granted to the offline cache. 0 means unknown.
    pub max_size_mb: u64,
    /// Upper bound assumed for a chapter before its real size is known.
    pub chapter_size_estimate_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_concurrent_downloads: usize,
    pub page_concurrency: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub page_timeout_secs: u64,
    pub rate_limit_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub progress_debounce_ms: u64,
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub preload_pages: u32,
    pub slow_network_preload_pages: u32,
    pub weekend_preload_pages: u32,
}

impl Config {
    /// Defaults, then the TOML file if it exists, then `MANGO__SECTION__KEY` variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        let path = path.as_ref();
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("MANGO").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn has_credential(&self) -> bool {
        self.content
            .auth_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            auth_token: None,
            timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:data/mango-offline.db".to_string(),
            max_size_mb: 2048,
            chapter_size_estimate_mb: 50,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            page_concurrency: 4,
            retry_attempts: 3,
            retry_delay_ms: 500,
            page_timeout_secs: 30,
            rate_limit_ms: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            progress_debounce_ms: 2000,
            history_limit: 100,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            preload_pages: 3,
            slow_network_preload_pages: 1,
            weekend_preload_pages: 5,
        }
    }
}
