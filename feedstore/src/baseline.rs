use crate::errors::{Result, StorageError};
use crate::record::Record;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Last synchronized record set, keyed by natural key.
pub type Baseline = BTreeMap<String, Record>;

static DATED_EXTRACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}\.").expect("dated extract pattern is valid"));

/// Durable home of a feed's baseline snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The last published baseline, or an empty one on first run.
    async fn load(&self) -> Result<Baseline>;

    /// Replaces the baseline atomically. Readers see either the old or the
    /// new snapshot, never a partial one.
    async fn publish(&self, baseline: &Baseline) -> Result<()>;

    fn location(&self) -> String;
}

/// Baseline kept as a JSON array of flat records in a per-feed directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
    filename: String,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            filename: filename.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    fn is_stray(&self, name: &str) -> bool {
        if name == self.filename {
            return false;
        }
        if DATED_EXTRACT_RE.is_match(name) || name.starts_with(".tmp") {
            return true;
        }
        let extension = |n: &str| Path::new(n).extension().map(|e| e.to_os_string());
        match extension(&self.filename) {
            Some(ext) => extension(name).as_ref() == Some(&ext),
            None => false,
        }
    }

    /// Deletes leftover extracts next to the baseline. Failures are logged
    /// and never propagated. Returns how many files were removed.
    pub async fn remove_strays(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Could not list {} for cleanup: {}", self.dir.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Cleanup of {} stopped early: {}", self.dir.display(), e);
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file || !self.is_stray(&name) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    log::info!("Removed stray snapshot artifact {}", name);
                    removed += 1;
                }
                Err(e) => log::warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
        removed
    }
}

fn parse_baseline(text: &str) -> Result<Baseline> {
    let value: JsonValue = serde_json::from_str(text)?;
    let records: Vec<Record> = match value {
        JsonValue::Array(_) => serde_json::from_value(value)?,
        // Older snapshots were written as a key -> record object.
        JsonValue::Object(map) => map
            .into_iter()
            .map(|(key, item)| {
                let mut record: Record = serde_json::from_value(item)?;
                if !record.has_natural_key() {
                    record.natural_key = key;
                }
                Ok(record)
            })
            .collect::<Result<_>>()?,
        other => {
            return Err(StorageError::InvalidRecord(format!(
                "baseline must be a JSON array, found {}",
                match other {
                    JsonValue::Null => "null",
                    JsonValue::Bool(_) => "a boolean",
                    JsonValue::Number(_) => "a number",
                    _ => "a string",
                }
            )));
        }
    };

    let mut baseline = Baseline::new();
    for record in records {
        if !record.has_natural_key() {
            log::warn!("Ignoring baseline record without a natural key");
            continue;
        }
        baseline.insert(record.natural_key.clone(), record);
    }
    Ok(baseline)
}

fn write_atomically(dir: &Path, target: &Path, payload: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target)?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Baseline> {
        let path = self.path();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let baseline = parse_baseline(&text)?;
                log::info!(
                    "Loaded baseline with {} records from {}",
                    baseline.len(),
                    path.display()
                );
                Ok(baseline)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No baseline at {}; treating as first run", path.display());
                Ok(Baseline::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, baseline: &Baseline) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&baseline.values().collect::<Vec<_>>())?;
        let dir = self.dir.clone();
        let target = self.path();
        tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &payload))
            .await
            .map_err(|e| StorageError::Publish(e.to_string()))??;
        log::info!(
            "Published baseline with {} records to {}",
            baseline.len(),
            self.path().display()
        );
        self.remove_strays().await;
        Ok(())
    }

    fn location(&self) -> String {
        self.path().display().to_string()
    }
}
