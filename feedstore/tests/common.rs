use std::time::Duration;

use feedstore::{
    baseline::FileSnapshotStore,
    config::{FeedConfig, RetryPolicy},
    store::MemoryStore,
};
use tempfile::TempDir;

#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub config: FeedConfig,
    pub store: MemoryStore,
    pub snapshots: FileSnapshotStore,
}

pub fn init_test_context(mut config: FeedConfig) -> anyhow::Result<TestContext> {
    let _ = env_logger::builder().is_test(true).try_init();

    let temp_dir = tempfile::tempdir()?;
    config.retry = RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(1),
    };
    let store = MemoryStore::new(config.layout());
    let snapshots = FileSnapshotStore::new(
        temp_dir.path().join(&config.name),
        config.snapshot_filename.clone(),
    );

    Ok(TestContext {
        temp_dir,
        config,
        store,
        snapshots,
    })
}
