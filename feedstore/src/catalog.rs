use crate::config::StorageConfig;
use crate::errors::{Result, StorageError};
use crate::models::{RunSummary, SyncRun};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

/// Local audit log of reconciliation runs.
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.catalog_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("catalog connection poisoned".into()))
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS sync_runs (
                run_id TEXT PRIMARY KEY,
                feed TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                details TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_runs_feed ON sync_runs(feed, start_time);
            COMMIT;",
        )?;
        Ok(())
    }

    /// Records a finished run with its final status and summary.
    pub fn record_run(&self, summary: &RunSummary, status: &str) -> Result<()> {
        let details = serde_json::to_string(summary)?;
        let end_time = summary
            .finished_at
            .unwrap_or_else(chrono::Utc::now)
            .timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (run_id, feed, start_time, end_time, status, stage, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(run_id) DO UPDATE SET
                end_time = excluded.end_time,
                status = excluded.status,
                stage = excluded.stage,
                details = excluded.details",
            params![
                summary.run_id.to_string(),
                summary.feed,
                summary.started_at.timestamp(),
                end_time,
                status,
                summary.stage.to_string(),
                details,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first, optionally for a single feed.
    pub fn recent_runs(&self, feed: Option<&str>, limit: usize) -> Result<Vec<SyncRun>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, feed, start_time, end_time, status, stage, COALESCE(details, '')
             FROM sync_runs
             WHERE ?1 IS NULL OR feed = ?1
             ORDER BY start_time DESC, rowid DESC
             LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![feed, limit as i64], |row| {
                Ok(SyncRun {
                    run_id: row.get(0)?,
                    feed: row.get(1)?,
                    start_time: row.get(2)?,
                    end_time: row.get(3)?,
                    status: row.get(4)?,
                    stage: row.get(5)?,
                    details: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}
