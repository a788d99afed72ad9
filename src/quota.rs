use crate::config::StorageConfig;
use crate::traits::ChapterStore;
use crate::utils::bytes_to_mb;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

const MB: u64 = 1024 * 1024;

/// Storage usage as reported by the quota probe. `0/0` means the platform could not tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaEstimate {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl QuotaEstimate {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.used_bytes == 0 && self.limit_bytes == 0
    }

    pub fn available(&self) -> u64 {
        self.limit_bytes.saturating_sub(self.used_bytes)
    }

    pub fn used_mb(&self) -> u64 {
        bytes_to_mb(self.used_bytes)
    }

    pub fn limit_mb(&self) -> u64 {
        bytes_to_mb(self.limit_bytes)
    }

    pub fn percentage(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.limit_bytes as f64 * 100.0).min(100.0)
    }

    /// Whether `required` bytes fit. Unknown estimates always admit.
    pub fn admits(&self, required: u64) -> bool {
        self.is_unknown() || self.available() >= required
    }
}

pub struct QuotaMonitor {
    store: Arc<dyn ChapterStore>,
    limit_bytes: u64,
}

impl QuotaMonitor {
    pub fn new(store: Arc<dyn ChapterStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            limit_bytes: config.max_size_mb.saturating_mul(MB),
        }
    }

    /// Polled before each download admission; never fails.
    pub async fn check_quota(&self) -> QuotaEstimate {
        if self.limit_bytes == 0 {
            warn!("[QUOTA] No storage limit configured, quota unknown");
            return QuotaEstimate::unknown();
        }

        match self.store.used_bytes().await {
            Ok(used_bytes) => {
                let estimate = QuotaEstimate {
                    used_bytes,
                    limit_bytes: self.limit_bytes,
                };
                debug!(
                    "[QUOTA] {} MB of {} MB used ({:.1}%)",
                    estimate.used_mb(),
                    estimate.limit_mb(),
                    estimate.percentage()
                );
                estimate
            }
            Err(e) => {
                warn!("[QUOTA] Usage probe failed, quota unknown: {}", e);
                QuotaEstimate::unknown()
            }
        }
    }
}
