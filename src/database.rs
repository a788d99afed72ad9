use crate::error::{MangoError, Result};
use crate::models::{ChapterRecord, PageAsset};
use crate::traits::{ChapterStore, StateStore};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i64 = 1;

/// Local SQLite database holding offline chapters and serialized reader state.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct ChapterRow {
    chapter_id: String,
    manga_id: String,
    manga_title: String,
    manga_slug: String,
    chapter_number: f64,
    title: String,
    page_count: i64,
    total_size_bytes: i64,
    downloaded_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PageRow {
    page_index: i64,
    source_url: String,
    encoded_data: String,
    size_bytes: i64,
}

impl From<PageRow> for PageAsset {
    fn from(row: PageRow) -> Self {
        PageAsset {
            page_index: row.page_index as u32,
            source_url: row.source_url,
            encoded_data: row.encoded_data,
            size_bytes: row.size_bytes.max(0) as u64,
        }
    }
}

fn store_error(e: sqlx::Error) -> MangoError {
    MangoError::store_unavailable(e.to_string())
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("[STORE] Opening local database: {}", database_url);

        if let Some(path) = database_url.strip_prefix("sqlite:") {
            let path = std::path::Path::new(path.trim_start_matches("//"));
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !database_url.contains(":memory:") {
                    debug!("[STORE] Creating directory: {:?}", parent);
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(store_error)?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Single-connection in-memory database; the connection is never recycled so data survives.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(store_error)?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn schema_version(&self) -> Result<i64> {
        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn init(&self) -> Result<()> {
        let version = self.schema_version().await?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        info!("[STORE] Upgrading schema from version {} to {}", version, SCHEMA_VERSION);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS offline_chapters (
                chapter_id TEXT PRIMARY KEY,
                manga_id TEXT NOT NULL,
                manga_title TEXT NOT NULL,
                manga_slug TEXT NOT NULL,
                chapter_number REAL NOT NULL,
                title TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                total_size_bytes INTEGER NOT NULL DEFAULT 0,
                downloaded_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS offline_pages (
                chapter_id TEXT NOT NULL,
                page_index INTEGER NOT NULL,
                source_url TEXT NOT NULL,
                encoded_data TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chapter_id, page_index)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_offline_chapters_manga_id ON offline_chapters (manga_id)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_offline_chapters_downloaded_at ON offline_chapters (downloaded_at)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("[STORE] Local database schema ready");
        Ok(())
    }

    /// Runs a chapter query and loads the pages of every row inside one read
    /// transaction, so concurrent writers are never observed half way.
    async fn read_chapters(&self, sql: &str, bind: Option<&str>) -> Result<Vec<ChapterRecord>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let mut query = sqlx::query_as::<_, ChapterRow>(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&mut *tx).await.map_err(store_error)?;
        let records = hydrate(&mut *tx, rows).await?;

        tx.commit().await.map_err(store_error)?;
        Ok(records)
    }
}

async fn load_pages(conn: &mut SqliteConnection, chapter_id: &str) -> Result<Vec<PageAsset>> {
    let rows = sqlx::query_as::<_, PageRow>(
        "SELECT page_index, source_url, encoded_data, size_bytes FROM offline_pages WHERE chapter_id = ? ORDER BY page_index",
    )
    .bind(chapter_id)
    .fetch_all(conn)
    .await
    .map_err(store_error)?;

    Ok(rows.into_iter().map(PageAsset::from).collect())
}

/// Rows whose page set does not match the stored page count are treated as absent.
async fn hydrate(conn: &mut SqliteConnection, rows: Vec<ChapterRow>) -> Result<Vec<ChapterRecord>> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let pages = load_pages(conn, &row.chapter_id).await?;
        if pages.len() as i64 != row.page_count {
            warn!(
                "[STORE] Chapter {} has {} of {} pages, skipping",
                row.chapter_id,
                pages.len(),
                row.page_count
            );
            continue;
        }
        records.push(ChapterRecord {
                chapter_id: row.chapter_id,
                manga_id: row.manga_id,
                manga_title: row.manga_title,
                manga_slug: row.manga_slug,
                chapter_number: row.chapter_number,
                title: row.title,
                pages,
                downloaded_at: row.downloaded_at,
            total_size_bytes: row.total_size_bytes.max(0) as u64,
        });
    }
    Ok(records)
}

const CHAPTER_COLUMNS: &str =
    "chapter_id, manga_id, manga_title, manga_slug, chapter_number, title, page_count, total_size_bytes, downloaded_at";

#[async_trait::async_trait]
impl ChapterStore for Database {
    async fn put(&self, record: &ChapterRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        sqlx::query("DELETE FROM offline_pages WHERE chapter_id = ?")
            .bind(&record.chapter_id)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO offline_chapters (chapter_id, manga_id, manga_title, manga_slug, chapter_number, title, page_count, total_size_bytes, downloaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.chapter_id)
        .bind(&record.manga_id)
        .bind(&record.manga_title)
        .bind(&record.manga_slug)
        .bind(record.chapter_number)
        .bind(&record.title)
        .bind(record.pages.len() as i64)
        .bind(record.total_size_bytes as i64)
        .bind(record.downloaded_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        for page in &record.pages {
            sqlx::query(
                r#"
                INSERT INTO offline_pages (chapter_id, page_index, source_url, encoded_data, size_bytes)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.chapter_id)
            .bind(i64::from(page.page_index))
            .bind(&page.source_url)
            .bind(&page.encoded_data)
            .bind(page.size_bytes as i64)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)?;
        debug!("[STORE] Stored chapter {} ({} pages)", record.chapter_id, record.pages.len());
        Ok(())
    }

    async fn get(&self, chapter_id: &str) -> Result<Option<ChapterRecord>> {
        let sql = format!("SELECT {} FROM offline_chapters WHERE chapter_id = ?", CHAPTER_COLUMNS);
        Ok(self.read_chapters(&sql, Some(chapter_id)).await?.pop())
    }

    async fn delete(&self, chapter_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        sqlx::query("DELETE FROM offline_pages WHERE chapter_id = ?")
            .bind(chapter_id)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        let result = sqlx::query("DELETE FROM offline_chapters WHERE chapter_id = ?")
            .bind(chapter_id)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<ChapterRecord>> {
        let sql = format!("SELECT {} FROM offline_chapters ORDER BY downloaded_at DESC", CHAPTER_COLUMNS);
        self.read_chapters(&sql, None).await
    }

    async fn list_by_manga(&self, manga_id: &str) -> Result<Vec<ChapterRecord>> {
        let sql = format!(
            "SELECT {} FROM offline_chapters WHERE manga_id = ? ORDER BY chapter_number",
            CHAPTER_COLUMNS
        );
        self.read_chapters(&sql, Some(manga_id)).await
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query("DELETE FROM offline_pages")
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        sqlx::query("DELETE FROM offline_chapters")
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        info!("[STORE] Cleared all offline chapters");
        Ok(())
    }

    async fn used_bytes(&self) -> Result<u64> {
        let (used,): (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(total_size_bytes), 0) FROM offline_chapters")
                .fetch_one(&self.pool)
                .await
                .map_err(store_error)?;
        Ok(used.max(0) as u64)
    }
}

#[async_trait::async_trait]
impl StateStore for Database {
    async fn load_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM local_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.map(|(value,)| value))
    }

    async fn save_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO local_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn remove_state(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM local_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
