use crate::errors::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stage of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Init,
    LoadBaseline,
    LoadCurrent,
    Diff,
    ResolveIds,
    PlanWrites,
    Execute,
    PublishBaseline,
    Done,
    Failed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Init => "init",
            RunStage::LoadBaseline => "load_baseline",
            RunStage::LoadCurrent => "load_current",
            RunStage::Diff => "diff",
            RunStage::ResolveIds => "resolve_ids",
            RunStage::PlanWrites => "plan_writes",
            RunStage::Execute => "execute",
            RunStage::PublishBaseline => "publish_baseline",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Counters and metadata of one run, complete or partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub feed: String,
    pub run_id: Uuid,
    pub stage: RunStage,
    pub total_current: usize,
    pub skipped_unkeyed: usize,
    pub changed_considered: usize,
    pub to_write: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// Records dropped because their live item could not be read.
    pub skipped: usize,
    pub baseline_location: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn start(feed: impl Into<String>) -> Self {
        Self {
            feed: feed.into(),
            run_id: Uuid::new_v4(),
            stage: RunStage::Init,
            total_current: 0,
            skipped_unkeyed: 0,
            changed_considered: 0,
            to_write: 0,
            uploaded: 0,
            failed: 0,
            skipped: 0,
            baseline_location: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, stage: RunStage) {
        self.stage = stage;
        self.finished_at = Some(Utc::now());
    }
}

/// A fatal run error, with whatever the run had counted so far.
#[derive(Debug, thiserror::Error)]
#[error("run of feed '{feed}' failed during {stage}: {source}")]
pub struct RunFailure {
    pub feed: String,
    pub stage: RunStage,
    #[source]
    pub source: StorageError,
    pub partial: RunSummary,
}

/// A row of the `sync_runs` catalog table.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub run_id: String,
    pub feed: String,
    pub start_time: i64, // Unix timestamp
    pub end_time: Option<i64>,
    pub status: String,
    pub stage: String,
    pub details: String, // JSON string
}
