use std::{
    collections::HashSet,
    fs::OpenOptions,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use feedfetch::{build_fetcher, FetchParams, FEED_NAMES};
use feedstore::{
    baseline::SnapshotStore,
    config::{FeedConfig, StorageConfig},
    models::{RunFailure, RunSummary, SyncRun},
    FeedStorage, Record,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Runs the feedsync command line interface.
pub async fn run_cli() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    execute(cli.command).await
}

#[derive(Parser)]
#[command(author, version, about = "Incremental threat-intelligence feed synchronization")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fetches a feed and reconciles it into the store
    Run(RunArgs),
    /// Lists recent runs from the catalog
    History(HistoryArgs),
    /// Prints the live item stored under a key
    Inspect(InspectArgs),
}

#[derive(Args, Clone, Debug)]
pub struct StorageArgs {
    /// Base directory for snapshots, store, catalog and locks
    #[arg(long, env = "FEEDSYNC_BASE_PATH", default_value = "./feedsync-data")]
    pub base_path: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct FeedArgs {
    /// Feed name (cisa, metasploit, misp, epss)
    pub feed: String,
    /// JSON file replacing the feed's built-in settings
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Overrides the feed's store batch size
    #[arg(long, env = "FEEDSYNC_BATCH_SIZE")]
    pub batch_size: Option<usize>,
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
    #[command(flatten)]
    pub feed: FeedArgs,
    /// Local raw payload used instead of downloading (CVE list CSV for epss)
    #[arg(long)]
    pub input: Option<PathBuf>,
    /// Overrides the upstream URL
    #[arg(long)]
    pub url: Option<String>,
    /// Computes the write plan without writing or publishing
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Clone, Debug)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
    /// Only show runs of this feed
    #[arg(long)]
    pub feed: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Clone, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
    #[command(flatten)]
    pub feed: FeedArgs,
    /// Store key (natural key, or surrogate id for surrogate feeds)
    pub key: String,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

pub async fn execute(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run(args) => match run_feed(&args).await {
            Ok(summary) => println!("{}", render_summary(&summary)?),
            Err(err) => {
                if let Some(failure) = err.downcast_ref::<RunFailure>() {
                    println!("{}", render_summary(&failure.partial)?);
                }
                return Err(err);
            }
        },
        Command::History(args) => {
            let runs = load_history(&args).await?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for run in runs {
                print_run(&run);
            }
        }
        Command::Inspect(args) => match inspect_item(&args).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("No item stored under '{}'.", args.key),
        },
    }
    Ok(())
}

/// Pretty JSON form of a run summary, printed for finished and failed runs alike.
pub fn render_summary(summary: &RunSummary) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(summary)?)
}

fn print_run(run: &SyncRun) {
    let started = chrono::DateTime::from_timestamp(run.start_time, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| run.start_time.to_string());
    println!(
        "{}  {:<10} {:<8} stage={:<16} started={}",
        run.run_id, run.feed, run.status, run.stage, started
    );
}

/// Resolves the feed settings: preset or `--config` file, then overrides.
pub fn resolve_feed_config(args: &FeedArgs) -> anyhow::Result<FeedConfig> {
    let mut config = match &args.config {
        Some(path) => FeedConfig::from_json_file(path)
            .with_context(|| format!("failed to load feed config {}", path.display()))?,
        None => match FeedConfig::preset(&args.feed) {
            Some(config) => config,
            None => bail!(
                "unknown feed '{}' (expected one of: {})",
                args.feed,
                FEED_NAMES.join(", ")
            ),
        },
    };
    if config.name != args.feed {
        bail!(
            "feed config {} describes '{}', not '{}'",
            args.config
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            config.name,
            args.feed
        );
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;
    Ok(config)
}

/// Exclusive per-feed lock, released on drop.
pub struct FeedLock {
    path: PathBuf,
}

impl FeedLock {
    pub fn acquire(lock_dir: &Path, feed: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(lock_dir)
            .with_context(|| format!("failed to create lock dir {}", lock_dir.display()))?;
        let path = lock_dir.join(format!("{feed}.lock"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => bail!(
                "feed '{}' is already being synchronized (remove {} if no run is active)",
                feed,
                path.display()
            ),
            Err(e) => {
                Err(e).with_context(|| format!("failed to create lock file {}", path.display()))
            }
        }
    }
}

impl Drop for FeedLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// Fetches one feed and reconciles it, holding the feed's lock throughout.
pub async fn run_feed(args: &RunArgs) -> anyhow::Result<RunSummary> {
    let feed = resolve_feed_config(&args.feed)?;
    let storage = FeedStorage::new(StorageConfig::new(&args.storage.base_path))
        .await
        .context("failed to initialize storage")?;
    let _lock = FeedLock::acquire(&storage.config.lock_dir, &feed.name)?;

    let mut known_keys = HashSet::new();
    if feed.name == "epss" {
        let baseline = storage
            .snapshot_store(&feed)
            .load()
            .await
            .context("failed to load baseline for incremental extraction")?;
        known_keys = baseline.into_values().map(|r| r.natural_key).collect();
    }
    let params = FetchParams {
        input: args.input.clone(),
        url: args.url.clone(),
        archive_dir: Some(storage.config.feed_dir(&feed.name)),
        known_keys,
    };

    let fetcher = build_fetcher(&feed.name, params)?;
    let records = fetcher
        .fetch()
        .await
        .with_context(|| format!("failed to fetch feed '{}'", fetcher.name()))?;
    info!("Fetched {} records for '{}'", records.len(), feed.name);

    match storage.sync(&feed, records, args.dry_run).await {
        Ok(summary) => {
            info!(
                "Run {} of '{}' finished: {} to write, {} uploaded, {} failed, {} skipped",
                summary.run_id,
                summary.feed,
                summary.to_write,
                summary.uploaded,
                summary.failed,
                summary.skipped
            );
            Ok(summary)
        }
        Err(failure) => {
            let partial = &failure.partial;
            error!(
                "Run {} of '{}' failed during {}: {} current, {} unkeyed, {} changed, {} to write, {} uploaded, {} failed, {} skipped",
                partial.run_id,
                failure.feed,
                failure.stage,
                partial.total_current,
                partial.skipped_unkeyed,
                partial.changed_considered,
                partial.to_write,
                partial.uploaded,
                partial.failed,
                partial.skipped
            );
            Err(failure.into())
        }
    }
}

pub async fn load_history(args: &HistoryArgs) -> anyhow::Result<Vec<SyncRun>> {
    let storage = FeedStorage::new(StorageConfig::new(&args.storage.base_path)).await?;
    let runs = storage
        .catalog
        .recent_runs(args.feed.as_deref(), args.limit)
        .context("failed to read run catalog")?;
    Ok(runs)
}

pub async fn inspect_item(args: &InspectArgs) -> anyhow::Result<Option<Record>> {
    let feed = resolve_feed_config(&args.feed)?;
    let storage = FeedStorage::new(StorageConfig::new(&args.storage.base_path)).await?;
    let record = storage
        .inspect(&feed, &args.key)
        .await
        .with_context(|| format!("failed to read '{}' from {}", args.key, feed.table_name))?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Command {
        Cli::try_parse_from(args).unwrap().command
    }

    #[test]
    fn test_parse_run_command() {
        let Command::Run(args) = parse(&[
            "feedsync",
            "run",
            "cisa",
            "--base-path",
            "/tmp/data",
            "--input",
            "kev.json",
            "--dry-run",
            "--batch-size",
            "10",
        ]) else {
            panic!("expected run command");
        };
        assert_eq!(args.feed.feed, "cisa");
        assert_eq!(args.storage.base_path, PathBuf::from("/tmp/data"));
        assert_eq!(args.input, Some(PathBuf::from("kev.json")));
        assert_eq!(args.feed.batch_size, Some(10));
        assert!(args.dry_run);
    }

    #[test]
    fn test_resolve_feed_config() {
        let args = FeedArgs {
            feed: "metasploit".into(),
            config: None,
            batch_size: Some(7),
        };
        let config = resolve_feed_config(&args).unwrap();
        assert_eq!(config.batch_size, 7);
        assert!(config.surrogate.is_some());

        let zero = FeedArgs {
            batch_size: Some(0),
            ..args.clone()
        };
        assert!(resolve_feed_config(&zero).is_err());

        let unknown = FeedArgs {
            feed: "nvd".into(),
            ..args
        };
        assert!(resolve_feed_config(&unknown).is_err());
    }

    #[test]
    fn test_config_file_must_describe_the_named_feed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kev.json");
        std::fs::write(
            &path,
            r#"{"name": "cisa", "table_name": "kev", "key_attribute": "cveID", "snapshot_filename": "kev.json"}"#,
        )
        .unwrap();

        let matching = FeedArgs {
            feed: "cisa".into(),
            config: Some(path.clone()),
            batch_size: None,
        };
        assert_eq!(resolve_feed_config(&matching).unwrap().table_name, "kev");

        let mismatched = FeedArgs {
            feed: "epss".into(),
            ..matching
        };
        let err = resolve_feed_config(&mismatched).unwrap_err();
        assert!(err.to_string().contains("describes 'cisa', not 'epss'"));
    }

    #[test]
    fn test_feed_lock_is_exclusive_and_released() {
        let dir = tempdir().unwrap();
        let lock = FeedLock::acquire(dir.path(), "cisa").unwrap();
        assert!(dir.path().join("cisa.lock").exists());
        assert!(FeedLock::acquire(dir.path(), "cisa").is_err());
        assert!(FeedLock::acquire(dir.path(), "misp").is_ok());

        drop(lock);
        assert!(!dir.path().join("cisa.lock").exists());
        assert!(FeedLock::acquire(dir.path(), "cisa").is_ok());
    }
}
