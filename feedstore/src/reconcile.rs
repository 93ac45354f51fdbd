//! The incremental reconciliation engine.
//!
//! A run compares the freshly normalized records against the last baseline
//! and the live store, writes only what is missing or stale, and rolls the
//! baseline forward:
//!
//! `Init → LoadBaseline → LoadCurrent → Diff → ResolveIds → PlanWrites →
//! Execute → PublishBaseline → Done`
//!
//! Any fatal error ends the run in `Failed` with a partial [`RunSummary`].
//! Record-level lookup and write failures are counted and never fatal; the
//! affected keys keep their previous baseline entry so the next run
//! reconsiders them.

use crate::allocator::{derive_partition, IdAllocator, LiveIds};
use crate::baseline::{Baseline, SnapshotStore};
use crate::config::{FeedConfig, SelfHeal};
use crate::errors::StorageError;
use crate::fingerprint::Fingerprinter;
use crate::models::{RunFailure, RunStage, RunSummary};
use crate::record::{KeyLayout, Record};
use crate::store::{with_retry, StoreAdapter};
use crate::writer::{BatchWriter, WriteReport};
use chrono::{Datelike, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A computed but not yet executed run.
#[derive(Debug)]
pub struct PlannedRun {
    pub summary: RunSummary,
    writes: Vec<Record>,
    current: BTreeMap<String, Record>,
    baseline: Baseline,
    resolved_ids: HashMap<String, String>,
    skipped_keys: BTreeSet<String>,
}

impl PlannedRun {
    /// Records to upsert, in natural-key order.
    pub fn writes(&self) -> &[Record] {
        &self.writes
    }
}

pub struct ReconcileEngine<'a> {
    config: &'a FeedConfig,
    layout: KeyLayout,
    store: &'a dyn StoreAdapter,
    snapshots: &'a dyn SnapshotStore,
    fingerprinter: Fingerprinter,
    fallback_year: i32,
}

impl<'a> ReconcileEngine<'a> {
    pub fn new(
        config: &'a FeedConfig,
        store: &'a dyn StoreAdapter,
        snapshots: &'a dyn SnapshotStore,
    ) -> Self {
        let layout = config.layout();
        let fingerprinter = Fingerprinter::new(config.canonical_fields.clone(), &layout);
        Self {
            config,
            layout,
            store,
            snapshots,
            fingerprinter,
            fallback_year: Utc::now().year(),
        }
    }

    /// Year used for records whose partition fields carry no date.
    pub fn with_fallback_year(mut self, year: i32) -> Self {
        self.fallback_year = year;
        self
    }

    fn fail(&self, summary: &RunSummary, source: StorageError) -> RunFailure {
        log::error!(
            "Run {} of '{}' failed during {}: {}",
            summary.run_id,
            summary.feed,
            summary.stage,
            source
        );
        let mut partial = summary.clone();
        partial.finish(RunStage::Failed);
        RunFailure {
            feed: summary.feed.clone(),
            stage: summary.stage,
            source,
            partial,
        }
    }

    /// Runs every stage, writing to the store and publishing the new baseline.
    pub async fn run(&self, current: Vec<Record>) -> Result<RunSummary, RunFailure> {
        let planned = self.plan(current).await?;
        self.execute(planned).await
    }

    /// Computes the write plan without touching the store or the baseline.
    pub async fn plan(&self, current: Vec<Record>) -> Result<PlannedRun, RunFailure> {
        let mut summary = RunSummary::start(&self.config.name);
        summary.baseline_location = Some(self.snapshots.location());
        log::info!(
            "Starting run {} for feed '{}' against {}",
            summary.run_id,
            summary.feed,
            self.store.describe()
        );

        let retry = &self.config.retry;
        let key_attribute = self.layout.key_attribute.as_str();
        with_retry(retry, "ensure_schema", || {
            self.store.ensure_schema(key_attribute)
        })
        .await
        .map_err(|e| self.fail(&summary, e))?;

        summary.stage = RunStage::LoadBaseline;
        let baseline = self
            .snapshots
            .load()
            .await
            .map_err(|e| self.fail(&summary, e))?;

        summary.stage = RunStage::LoadCurrent;
        let current = self.load_current(current, &mut summary);

        summary.stage = RunStage::Diff;
        let live_keys = self
            .live_keys(&baseline)
            .await
            .map_err(|e| self.fail(&summary, e))?;
        let change_set = self.diff(&current, &baseline, &live_keys).await;
        summary.changed_considered = change_set.len();
        log::info!(
            "{} of {} current records and baseline entries need evaluation",
            change_set.len(),
            current.len()
        );

        summary.stage = RunStage::ResolveIds;
        let resolved_ids = match (&self.config.surrogate, &live_keys) {
            (Some(_), Some(live)) => self.resolve_ids(&change_set, &current, &baseline, live),
            _ => HashMap::new(),
        };

        summary.stage = RunStage::PlanWrites;
        let (writes, skipped_keys) = self
            .plan_writes(&change_set, &current, &baseline, &resolved_ids)
            .await;
        summary.to_write = writes.len();
        summary.skipped = skipped_keys.len();
        log::info!(
            "Write plan: {} records ({} unchanged in store, {} skipped)",
            writes.len(),
            change_set
                .len()
                .saturating_sub(writes.len() + skipped_keys.len()),
            skipped_keys.len()
        );

        Ok(PlannedRun {
            summary,
            writes,
            current,
            baseline,
            resolved_ids,
            skipped_keys,
        })
    }

    /// Executes a plan and publishes the merged baseline.
    pub async fn execute(&self, planned: PlannedRun) -> Result<RunSummary, RunFailure> {
        let PlannedRun {
            mut summary,
            writes,
            current,
            baseline,
            resolved_ids,
            mut skipped_keys,
        } = planned;

        summary.stage = RunStage::Execute;
        let report = if writes.is_empty() {
            log::info!("Nothing to write");
            WriteReport::default()
        } else {
            BatchWriter::new(self.store, self.config.batch_size)
                .with_progress_interval(self.config.progress_interval)
                .with_retry(self.config.retry)
                .execute(&writes)
                .await
        };
        summary.uploaded = report.uploaded;
        summary.failed = report.failed;

        let natural_by_store_key: HashMap<&str, &str> = writes
            .iter()
            .map(|r| (r.store_key(), r.natural_key.as_str()))
            .collect();
        for (store_key, _) in &report.failures {
            if let Some(natural) = natural_by_store_key.get(store_key.as_str()) {
                skipped_keys.insert(natural.to_string());
            }
        }

        summary.stage = RunStage::PublishBaseline;
        let next = self.merge(&current, &baseline, &resolved_ids, &skipped_keys);
        self.snapshots
            .publish(&next)
            .await
            .map_err(|e| self.fail(&summary, e))?;

        summary.finish(RunStage::Done);
        log::info!(
            "Run {} of '{}' done: {} uploaded, {} failed, {} skipped",
            summary.run_id,
            summary.feed,
            summary.uploaded,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    fn load_current(
        &self,
        records: Vec<Record>,
        summary: &mut RunSummary,
    ) -> BTreeMap<String, Record> {
        summary.total_current = records.len();
        let mut current = BTreeMap::new();
        for mut record in records {
            let key = record.natural_key.trim().to_string();
            if key.is_empty() {
                log::warn!("Dropping record without a natural key");
                summary.skipped_unkeyed += 1;
                continue;
            }
            record.natural_key = key.clone();
            self.fingerprinter.stamp(&mut record);
            if current.insert(key.clone(), record).is_some() {
                log::debug!("Duplicate natural key {}; keeping the later record", key);
            }
        }
        current
    }

    /// Keys present in the store with the natural key of each item, when
    /// they can be enumerated.
    ///
    /// Surrogate feeds always scan: the allocator must see every live id.
    async fn live_keys(
        &self,
        baseline: &Baseline,
    ) -> Result<Option<HashMap<String, String>>, StorageError> {
        let scan = self.config.self_heal == SelfHeal::Scan || self.config.surrogate.is_some();
        if !scan || (baseline.is_empty() && self.config.surrogate.is_none()) {
            return Ok(None);
        }
        let keys = with_retry(&self.config.retry, "scan_keys", || self.store.scan_keys()).await?;
        log::info!("Store holds {} items", keys.len());
        Ok(Some(keys))
    }

    async fn is_live(
        &self,
        store_key: &str,
        live_keys: &Option<HashMap<String, String>>,
    ) -> Option<bool> {
        if let Some(keys) = live_keys {
            return Some(keys.contains_key(store_key));
        }
        match with_retry(&self.config.retry, "lookup", || self.store.get(store_key)).await {
            Ok(item) => Some(item.is_some()),
            Err(e) => {
                log::warn!("Could not look up {}: {}", store_key, e);
                None
            }
        }
    }

    async fn diff(
        &self,
        current: &BTreeMap<String, Record>,
        baseline: &Baseline,
        live_keys: &Option<HashMap<String, String>>,
    ) -> BTreeSet<String> {
        let mut change_set = BTreeSet::new();
        for (key, record) in current {
            let unchanged = baseline
                .get(key)
                .map(|prior| self.fingerprinter.fingerprint(prior))
                .is_some_and(|hash| record.content_hash.as_deref() == Some(hash.as_str()));
            if !unchanged {
                change_set.insert(key.clone());
            }
        }

        let mut healed = 0;
        for (key, prior) in baseline {
            if change_set.contains(key) {
                continue;
            }
            if self.is_live(prior.store_key(), live_keys).await == Some(false) {
                log::debug!("{} is in the baseline but missing from the store", key);
                change_set.insert(key.clone());
                healed += 1;
            }
        }
        if healed > 0 {
            log::info!("{} baseline records are missing from the store", healed);
        }
        change_set
    }

    fn resolve_ids(
        &self,
        change_set: &BTreeSet<String>,
        current: &BTreeMap<String, Record>,
        baseline: &Baseline,
        live_ids: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let Some(surrogate) = &self.config.surrogate else {
            return HashMap::new();
        };
        let known = live_ids
            .keys()
            .chain(baseline.values().filter_map(|r| r.surrogate_id.as_ref()));
        let mut allocator = IdAllocator::seeded(surrogate.prefix.clone(), surrogate.width, known);
        let live = LiveIds::new(live_ids);

        let mut resolved = HashMap::new();
        let mut minted = 0;
        for key in change_set {
            let Some(record) = current.get(key).or_else(|| baseline.get(key)) else {
                continue;
            };
            let prior_id = baseline.get(key).and_then(|r| r.surrogate_id.as_deref());
            let id = match live.reuse(prior_id, key) {
                Some(id) => id,
                None => {
                    let partition =
                        derive_partition(record, &surrogate.partition_fields, self.fallback_year);
                    minted += 1;
                    allocator.allocate(&partition)
                }
            };
            resolved.insert(key.clone(), id);
        }
        log::info!(
            "Resolved {} surrogate ids ({} newly minted)",
            resolved.len(),
            minted
        );
        resolved
    }

    async fn plan_writes(
        &self,
        change_set: &BTreeSet<String>,
        current: &BTreeMap<String, Record>,
        baseline: &Baseline,
        resolved_ids: &HashMap<String, String>,
    ) -> (Vec<Record>, BTreeSet<String>) {
        let mut writes = Vec::new();
        let mut skipped = BTreeSet::new();

        for key in change_set {
            let Some(source) = current.get(key).or_else(|| baseline.get(key)) else {
                continue;
            };
            let mut record = source.clone();
            if self.layout.uses_surrogate() {
                record.surrogate_id = resolved_ids.get(key).cloned();
            }
            let hash = self.fingerprinter.stamp(&mut record);

            let store_key = record.store_key().to_string();
            match with_retry(&self.config.retry, "get", || self.store.get(&store_key)).await {
                Ok(Some(live)) if self.fingerprinter.fingerprint(&live) == hash => {
                    log::debug!("{} is already current in the store", store_key);
                }
                Ok(_) => writes.push(record),
                Err(e) => {
                    log::warn!("Skipping {}: lookup failed: {}", key, e);
                    skipped.insert(key.clone());
                }
            }
        }
        (writes, skipped)
    }

    /// Next baseline: prior entries overlaid with the current records.
    ///
    /// Keys that could not be looked up or written keep their prior entry (or
    /// stay absent) so the next run evaluates them again.
    fn merge(
        &self,
        current: &BTreeMap<String, Record>,
        baseline: &Baseline,
        resolved_ids: &HashMap<String, String>,
        skipped_keys: &BTreeSet<String>,
    ) -> Baseline {
        let mut next = baseline.clone();
        for (key, record) in current {
            let mut record = record.clone();
            if self.layout.uses_surrogate() {
                record.surrogate_id = resolved_ids
                    .get(key)
                    .cloned()
                    .or_else(|| baseline.get(key).and_then(|r| r.surrogate_id.clone()));
            }
            next.insert(key.clone(), record);
        }
        for (key, id) in resolved_ids {
            if let Some(record) = next.get_mut(key) {
                record.surrogate_id = Some(id.clone());
            }
        }
        for key in skipped_keys {
            match baseline.get(key) {
                Some(prior) => {
                    next.insert(key.clone(), prior.clone());
                }
                None => {
                    next.remove(key);
                }
            }
        }
        for record in next.values_mut() {
            self.fingerprinter.stamp(record);
        }
        next
    }
}
