//! Offline chapter cache and local-first reading state for the Mango manga reader.

pub mod config;
pub mod content;
pub mod database;
pub mod downloader;
pub mod error;
pub mod gesture;
pub mod models;
pub mod preload;
pub mod quota;
pub mod reader;
pub mod stats;
pub mod sync;
pub mod traits;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use database::Database;
pub use downloader::DownloadManager;
pub use error::{MangoError, Result};
pub use reader::ReadingSessionController;
pub use sync::SyncEngine;
