use crate::errors::{Result, StorageError};
use crate::record::KeyLayout;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Filesystem layout of one deployment.
#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    pub snapshot_dir: PathBuf,
    pub store_path: PathBuf,
    pub catalog_path: PathBuf,
    pub lock_dir: PathBuf,
}

impl StorageConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            snapshot_dir: base_path.join("snapshots"),
            store_path: base_path.join("store.sqlite"),
            catalog_path: base_path.join("catalog.sqlite"),
            lock_dir: base_path.join("locks"),
        }
    }

    /// Directory holding the baseline (and any dated extracts) of one feed.
    pub fn feed_dir(&self, feed: &str) -> PathBuf {
        self.snapshot_dir.join(feed)
    }
}

/// How the engine learns which baseline records are still live.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelfHeal {
    /// Enumerate all store keys once per run.
    #[default]
    Scan,
    /// Issue one point lookup per baseline key.
    Lookup,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SurrogateConfig {
    pub prefix: String,
    #[serde(default = "default_sequence_width")]
    pub width: usize,
    /// Fields tried in order when deriving the partition year.
    #[serde(default)]
    pub partition_fields: Vec<String>,
}

fn default_sequence_width() -> usize {
    crate::allocator::DEFAULT_SEQUENCE_WIDTH
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Immutable per-feed settings, built once per run and passed by reference.
#[derive(Deserialize, Debug, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub table_name: String,
    pub key_attribute: String,
    /// Attribute holding the natural key; defaults to `key_attribute`.
    #[serde(default)]
    pub natural_key_attribute: Option<String>,
    #[serde(default)]
    pub surrogate: Option<SurrogateConfig>,
    #[serde(default)]
    pub canonical_fields: Option<Vec<String>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
    #[serde(default)]
    pub self_heal: SelfHeal,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub snapshot_filename: String,
}

fn default_batch_size() -> usize {
    25
}

fn default_progress_interval() -> usize {
    100
}

impl FeedConfig {
    pub fn layout(&self) -> KeyLayout {
        match &self.natural_key_attribute {
            Some(natural) if self.surrogate.is_some() => {
                KeyLayout::surrogate(self.key_attribute.clone(), natural.clone())
            }
            _ => KeyLayout::natural(self.key_attribute.clone()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StorageError::Config("feed name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(StorageError::Config(format!(
                "feed '{}': batch_size must be positive",
                self.name
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(StorageError::Config(format!(
                "feed '{}': retry.max_attempts must be positive",
                self.name
            )));
        }
        if let Some(surrogate) = &self.surrogate {
            let natural = self.natural_key_attribute.as_deref().unwrap_or_default();
            if natural.is_empty() || natural == self.key_attribute {
                return Err(StorageError::Config(format!(
                    "feed '{}': surrogate feeds need a natural_key_attribute distinct from '{}'",
                    self.name, self.key_attribute
                )));
            }
            if surrogate.prefix.is_empty() || surrogate.prefix.contains('-') {
                return Err(StorageError::Config(format!(
                    "feed '{}': surrogate prefix must be non-empty and contain no '-'",
                    self.name
                )));
            }
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: FeedConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in settings for a known feed.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "cisa" => Some(Self::cisa()),
            "metasploit" => Some(Self::metasploit()),
            "misp" => Some(Self::misp()),
            "epss" => Some(Self::epss()),
            _ => None,
        }
    }

    pub fn cisa() -> Self {
        Self {
            name: "cisa".into(),
            table_name: "cisa_data".into(),
            key_attribute: "cveID".into(),
            natural_key_attribute: None,
            surrogate: None,
            canonical_fields: None,
            batch_size: 25,
            progress_interval: 25,
            self_heal: SelfHeal::Lookup,
            retry: RetryPolicy::default(),
            snapshot_filename: "cisa_extract.json".into(),
        }
    }

    pub fn metasploit() -> Self {
        Self {
            name: "metasploit".into(),
            table_name: "metasploit_data".into(),
            key_attribute: "id".into(),
            natural_key_attribute: Some("module_id".into()),
            surrogate: Some(SurrogateConfig {
                prefix: "META".into(),
                width: crate::allocator::DEFAULT_SEQUENCE_WIDTH,
                partition_fields: vec!["mod_time".into(), "uploaded_date".into()],
            }),
            canonical_fields: None,
            batch_size: 25,
            progress_interval: 100,
            self_heal: SelfHeal::Scan,
            retry: RetryPolicy::default(),
            snapshot_filename: "metasploit_baseline.json".into(),
        }
    }

    pub fn misp() -> Self {
        Self {
            name: "misp".into(),
            table_name: "misp_data".into(),
            key_attribute: "uuid".into(),
            natural_key_attribute: None,
            surrogate: None,
            canonical_fields: None,
            batch_size: 25,
            progress_interval: 100,
            self_heal: SelfHeal::Scan,
            retry: RetryPolicy::default(),
            snapshot_filename: "misp_baseline.json".into(),
        }
    }

    pub fn epss() -> Self {
        Self {
            name: "epss".into(),
            table_name: "epss_data".into(),
            key_attribute: "cve".into(),
            natural_key_attribute: None,
            surrogate: None,
            canonical_fields: Some(vec!["epss".into(), "percentile".into(), "date".into()]),
            batch_size: 25,
            progress_interval: 500,
            self_heal: SelfHeal::Scan,
            retry: RetryPolicy::default(),
            snapshot_filename: "epss_extract.json".into(),
        }
    }
}
