pub mod allocator;
pub mod baseline;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod models;
pub mod reconcile;
pub mod record;
pub mod store;
pub mod value;
pub mod writer;

use crate::baseline::FileSnapshotStore;
use crate::catalog::Catalog;
use crate::config::{FeedConfig, StorageConfig};
use crate::errors::Result;
use crate::models::{RunFailure, RunSummary};
use crate::reconcile::ReconcileEngine;
use crate::store::SqliteStore;
use std::sync::Arc;

pub use crate::record::{KeyLayout, Record};
pub use crate::value::FieldValue;

/// The main entry point for the `feedstore` library.
///
/// `FeedStorage` ties one deployment directory to its components:
/// - per-feed baseline snapshots (`FileSnapshotStore`) under `snapshots/<feed>`,
/// - the SQLite-backed key-value store (`SqliteStore`), one table per feed,
/// - a run catalog (`Catalog`) recording every reconciliation run.
///
/// # Example
///
/// ```rust,no_run
/// use feedstore::{FeedStorage, Record, config::{FeedConfig, StorageConfig}};
/// use tempfile::tempdir;
///
/// #[tokio::main]
/// async fn main() {
///     let dir = tempdir().unwrap();
///     let storage = FeedStorage::new(StorageConfig::new(dir.path())).await.unwrap();
///     let records = vec![Record::new("CVE-2024-0001").with_field("product", "widget")];
///     let summary = storage.sync(&FeedConfig::cisa(), records, false).await.unwrap();
///     assert_eq!(summary.uploaded, 1);
/// }
/// ```
pub struct FeedStorage {
    pub config: StorageConfig,
    pub catalog: Arc<Catalog>,
}

impl FeedStorage {
    /// Creates the directory layout and initializes the run catalog.
    pub async fn new(config: StorageConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.snapshot_dir).await?;
        tokio::fs::create_dir_all(&config.lock_dir).await?;

        let catalog = Arc::new(Catalog::new(&config)?);
        catalog.initialize_schema()?;

        Ok(Self { config, catalog })
    }

    pub fn snapshot_store(&self, feed: &FeedConfig) -> FileSnapshotStore {
        FileSnapshotStore::new(self.config.feed_dir(&feed.name), feed.snapshot_filename.clone())
    }

    pub fn open_store(&self, feed: &FeedConfig) -> Result<SqliteStore> {
        SqliteStore::open(&self.config.store_path, &feed.table_name, feed.layout())
    }

    /// Reconciles `records` into the feed's table and logs the run.
    ///
    /// With `dry_run` the write plan is computed and logged but neither the
    /// store nor the baseline is touched.
    pub async fn sync(
        &self,
        feed: &FeedConfig,
        records: Vec<Record>,
        dry_run: bool,
    ) -> std::result::Result<RunSummary, RunFailure> {
        let store = self.open_store(feed).map_err(|e| {
            let mut partial = RunSummary::start(&feed.name);
            partial.finish(models::RunStage::Failed);
            RunFailure {
                feed: feed.name.clone(),
                stage: models::RunStage::Init,
                source: e,
                partial,
            }
        })?;
        let snapshots = self.snapshot_store(feed);
        let engine = ReconcileEngine::new(feed, &store, &snapshots);

        if dry_run {
            let planned = engine.plan(records).await?;
            for record in planned.writes() {
                log::info!("[dry-run] would write {}", record.store_key());
            }
            let mut summary = planned.summary.clone();
            summary.finish(summary.stage);
            return Ok(summary);
        }

        let result = engine.run(records).await;
        let (summary, status) = match &result {
            Ok(summary) => (summary, "SUCCESS"),
            Err(failure) => (&failure.partial, "FAILED"),
        };
        if let Err(e) = self.catalog.record_run(summary, status) {
            log::warn!("Could not record run {} of '{}': {}", summary.run_id, summary.feed, e);
        }
        result
    }

    /// The live item stored under store key `key` in a feed's table.
    pub async fn inspect(&self, feed: &FeedConfig, key: &str) -> Result<Option<Record>> {
        use crate::store::StoreAdapter;
        let store = self.open_store(feed)?;
        store.ensure_schema(&feed.layout().key_attribute).await?;
        store.get(key).await
    }
}
