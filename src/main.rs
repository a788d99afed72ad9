use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use mango_offline::content::HttpContentService;
use mango_offline::models::{Credential, MangaSummary};
use mango_offline::traits::{ChapterStore, ContentService, StateStore};
use mango_offline::{Config, Database, DownloadManager, SyncEngine};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mango-offline")]
#[command(about = "Offline chapter cache and reading state for the Mango manga reader")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the local database
    Init,
    /// Show storage usage, offline chapters and pending changes
    Status,
    /// List chapters available offline
    List {
        /// Only chapters of this manga
        #[arg(short, long)]
        manga: Option<String>,
    },
    /// Download a chapter for offline reading
    Download {
        /// Chapter id
        chapter_id: String,
        /// Manga id
        #[arg(long)]
        manga_id: String,
        /// Manga title shown in the offline list
        #[arg(long)]
        manga_title: String,
        /// Manga slug
        #[arg(long, default_value = "")]
        manga_slug: String,
    },
    /// Delete one offline chapter
    Delete {
        /// Chapter id
        chapter_id: String,
    },
    /// Delete every offline chapter
    Clear,
    /// Reconcile bookmarks, history and statistics with the server
    Sync,
    /// Show reading statistics
    Stats,
    /// Export bookmarks, history and progress to a JSON file
    Export {
        #[arg(default_value = "mango-backup.json")]
        path: String,
    },
    /// Import a JSON backup
    Import { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = Config::load(&cli.config)?;

    let db = Arc::new(Database::new(&config.storage.database_url).await?);
    let content: Arc<dyn ContentService> = Arc::new(HttpContentService::new(&config.content)?);

    match cli.command {
        Commands::Init => run_init(&cli.config, &config, &db).await?,
        Commands::Status => show_status(&config, db, content).await?,
        Commands::List { manga } => list_chapters(&config, db, content, manga.as_deref()).await,
        Commands::Download {
            chapter_id,
            manga_id,
            manga_title,
            manga_slug,
        } => {
            let manga = MangaSummary {
                id: manga_id,
                title: manga_title,
                slug: manga_slug,
                ..Default::default()
            };
            run_download(&config, db, content, &chapter_id, &manga).await?;
        }
        Commands::Delete { chapter_id } => {
            let manager = DownloadManager::new(db, content, &config);
            if manager.delete_chapter(&chapter_id).await? {
                info!("Deleted offline chapter {}", chapter_id);
            } else {
                warn!("Chapter {} is not available offline", chapter_id);
            }
        }
        Commands::Clear => {
            let manager = DownloadManager::new(db, content, &config);
            manager.clear_all().await?;
            info!("All offline chapters deleted");
        }
        Commands::Sync => run_sync(&config, db, content).await?,
        Commands::Stats => show_stats(&config, db, content).await,
        Commands::Export { path } => {
            let engine = load_engine(&config, db, content).await;
            let export = engine.export_data();
            std::fs::write(&path, serde_json::to_string_pretty(&export)?)?;
            info!("Exported library to {}", path);
            engine.shutdown().await;
        }
        Commands::Import { path } => {
            let engine = load_engine(&config, db, content).await;
            let json = std::fs::read_to_string(&path)?;
            engine.import_json(&json).await?;
            info!("Imported library from {}", path);
            engine.shutdown().await;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(format!("mango_offline={}", level))
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    Ok(())
}

fn credential(config: &Config) -> Option<Credential> {
    if !config.has_credential() {
        return None;
    }
    config.content.auth_token.as_deref().map(Credential::new)
}

async fn load_engine(
    config: &Config,
    db: Arc<Database>,
    content: Arc<dyn ContentService>,
) -> SyncEngine {
    let store: Arc<dyn StateStore> = db;
    SyncEngine::load(store, content, credential(config), &config.sync).await
}

async fn run_init(config_path: &str, config: &Config, db: &Database) -> Result<()> {
    info!("Initializing mango-offline...");
    if Path::new(config_path).exists() {
        info!("Configuration {} already exists", config_path);
    } else {
        config.save(config_path)?;
        info!("Wrote default configuration to {}", config_path);
    }

    info!("Local database ready (schema version {})", db.schema_version().await?);
    Ok(())
}

async fn show_status(
    config: &Config,
    db: Arc<Database>,
    content: Arc<dyn ContentService>,
) -> Result<()> {
    let store: Arc<dyn ChapterStore> = db.clone();
    let manager = DownloadManager::new(store, content.clone(), config);
    manager.load_offline_chapters().await;
    let quota = manager.quota().check_quota().await;
    let engine = load_engine(config, db, content).await;

    println!("📦 Offline cache:");
    if quota.is_unknown() {
        println!("  Storage:   unknown");
    } else {
        println!(
            "  Storage:   {} MB / {} MB ({:.1}%)",
            quota.used_mb(),
            quota.limit_mb(),
            quota.percentage()
        );
    }
    println!("  Chapters:  {}", manager.total_offline_chapters());
    println!(
        "  Size:      {} MB",
        mango_offline::utils::bytes_to_mb(manager.total_offline_size())
    );
    println!("📚 Library:");
    println!("  Bookmarks: {}", engine.bookmark_count());
    println!("  History:   {}", engine.history_count());
    println!("  Pending:   {}", engine.pending_count());
    println!(
        "  Mode:      {}",
        if engine.is_local_only() { "local only" } else { "synced" }
    );

    engine.shutdown().await;
    Ok(())
}

async fn list_chapters(
    config: &Config,
    db: Arc<Database>,
    content: Arc<dyn ContentService>,
    manga_id: Option<&str>,
) {
    let manager = DownloadManager::new(db, content, config);
    manager.load_offline_chapters().await;
    let chapters = match manga_id {
        Some(manga_id) => manager.offline_chapters_by_manga(manga_id),
        None => manager.offline_chapters(),
    };

    println!(
        "{:<24} {:<24} {:<8} {:<7} {:<10} {:<12}",
        "Chapter", "Manga", "Number", "Pages", "Size (MB)", "Downloaded"
    );
    println!("{}", "-".repeat(90));
    for chapter in chapters {
        println!(
            "{:<24} {:<24} {:<8} {:<7} {:<10} {:<12}",
            chapter.chapter_id,
            chapter.manga_title,
            chapter.chapter_number,
            chapter.page_count,
            mango_offline::utils::bytes_to_mb(chapter.size_bytes),
            chapter.downloaded_at.format("%Y-%m-%d")
        );
    }
}

async fn run_download(
    config: &Config,
    db: Arc<Database>,
    content: Arc<dyn ContentService>,
    chapter_id: &str,
    manga: &MangaSummary,
) -> Result<()> {
    let manager = DownloadManager::new(db, content, config);
    manager.load_offline_chapters().await;
    if manager.is_chapter_offline(chapter_id) {
        info!("Chapter {} is already available offline, downloading again", chapter_id);
    }

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(chapter_id.to_string());

    let mut progress = manager.subscribe();
    let watched = chapter_id.to_string();
    let bar = pb.clone();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let value = progress.borrow().get(&watched).copied();
            if let Some(value) = value {
                bar.set_position(value.round() as u64);
            }
        }
    });

    let result = manager.download_chapter(chapter_id, manga).await;
    watcher.abort();

    match result {
        Ok(record) => {
            pb.finish_with_message(format!("{} pages saved", record.page_count()));
            info!(
                "Chapter {} of {} available offline ({} MB)",
                record.chapter_number,
                record.manga_title,
                mango_offline::utils::bytes_to_mb(record.total_size_bytes)
            );
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message(e.user_message());
            Err(e.into())
        }
    }
}

async fn run_sync(config: &Config, db: Arc<Database>, content: Arc<dyn ContentService>) -> Result<()> {
    let engine = load_engine(config, db, content).await;
    if engine.is_local_only() {
        warn!("No auth token configured, nothing to synchronize");
        return Ok(());
    }

    info!("Synchronizing {} pending changes...", engine.pending_count());
    engine.sync_with_server().await?;
    let stats = engine.sync_statistics().await?;
    info!(
        "Synchronized: {} bookmarks, {} history entries, {:.0} minutes read",
        engine.bookmark_count(),
        engine.history_count(),
        stats.stats.total_reading_time
    );
    engine.shutdown().await;
    Ok(())
}

async fn show_stats(config: &Config, db: Arc<Database>, content: Arc<dyn ContentService>) {
    let engine = load_engine(config, db, content).await;
    let snapshot = engine.statistics();
    let today = chrono::Local::now().date_naive();
    let stats = &snapshot.stats;
    let level = stats.reading_level();

    println!("📖 Reading statistics:");
    println!("  Level:          {} ({})", level.level, level.name);
    println!("  Reading time:   {:.0} min", stats.total_reading_time);
    println!("  Chapters read:  {}", stats.total_chapters_read);
    println!("  Pages read:     {}", stats.total_pages_read);
    println!("  Speed:          {:.1} pages/min", stats.average_reading_speed);
    println!(
        "  Streak:         {} days (longest {})",
        stats.current_streak(today),
        stats.longest_streak
    );
    println!(
        "  Weekly goal:    {:.0}% of {} min",
        snapshot.weekly_progress(today),
        stats.weekly_goal
    );
    println!(
        "  Monthly goal:   {:.0}% of {} min",
        snapshot.monthly_progress(today),
        stats.monthly_goal
    );
    println!("  Achievements:   {}", stats.achievements.len());
    for id in &stats.achievements {
        if let Some(achievement) = mango_offline::stats::find_achievement(id) {
            println!("    {} {}", achievement.icon, achievement.name);
        }
    }

    engine.shutdown().await;
}
