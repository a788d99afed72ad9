//! Local-first library state: bookmarks, history, progress and statistics.
//!
//! Every mutation is applied and persisted locally first, then replicated to
//! the Content Service. Rejections roll the local change back; transport
//! failures keep it and queue the change for the next reconciliation.

pub mod debounce;
pub mod engine;

pub use debounce::{ProgressDebouncer, ProgressSink};
pub use engine::{LibraryBackup, Notice, PendingChange, SyncEngine, SyncOutcome};

/// Fixed keys of the serialized local state.
pub mod keys {
    pub const READER_SETTINGS: &str = "mango-reader-settings";
    pub const BOOKMARKS: &str = "mango-bookmarks";
    pub const READING_HISTORY: &str = "mango-reading-history";
    pub const READING_PROGRESS: &str = "mango-reading-progress";
    pub const READING_STATS: &str = "mango-reading-stats";
    pub const DAILY_STATS: &str = "mango-daily-stats";
    pub const PENDING_SYNC: &str = "mango-pending-sync";
}
