use crate::config::RetryPolicy;
use crate::record::Record;
use crate::store::{with_retry, StoreAdapter};
use serde::Serialize;

/// Outcome of executing a write plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// Store key and error message of every failed item.
    pub failures: Vec<(String, String)>,
}

/// Writes a plan to the store in bounded, sequential chunks.
pub struct BatchWriter<'a> {
    store: &'a dyn StoreAdapter,
    batch_size: usize,
    progress_interval: usize,
    retry: RetryPolicy,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn StoreAdapter, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            progress_interval: 100,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn execute(&self, plan: &[Record]) -> WriteReport {
        let mut report = WriteReport {
            attempted: plan.len(),
            ..Default::default()
        };
        let mut processed = 0;

        for chunk in plan.chunks(self.batch_size) {
            let what = format!("batched put of {} items", chunk.len());
            match with_retry(&self.retry, &what, || {
                self.store.batched_put(chunk, self.batch_size)
            })
            .await
            {
                Ok(outcomes) => {
                    for (key, outcome) in outcomes {
                        match outcome {
                            Ok(()) => report.uploaded += 1,
                            Err(e) => {
                                log::warn!("Failed to write {}: {}", key, e);
                                report.failed += 1;
                                report.failures.push((key, e.to_string()));
                            }
                        }
                    }
                }
                Err(e) => {
                    log::error!("Chunk of {} items failed: {}", chunk.len(), e);
                    for record in chunk {
                        report.failed += 1;
                        report
                            .failures
                            .push((record.store_key().to_string(), e.to_string()));
                    }
                }
            }

            let before = processed;
            processed += chunk.len();
            if processed / self.progress_interval > before / self.progress_interval
                && processed < plan.len()
            {
                log::info!("Progress: {}/{} items written", processed, plan.len());
            }
        }

        log::info!(
            "Write complete: {} uploaded, {} failed of {}",
            report.uploaded,
            report.failed,
            report.attempted
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::KeyLayout;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn plan(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new(format!("CVE-2024-{i}")).with_field("sev", "high"))
            .collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_chunks_are_written_sequentially() {
        let store = MemoryStore::new(KeyLayout::natural("cveID"));
        let report = BatchWriter::new(&store, 25)
            .with_progress_interval(10)
            .execute(&plan(60))
            .await;
        assert_eq!(report.uploaded, 60);
        assert_eq!(report.failed, 0);
        assert_eq!(store.put_calls(), 3);
        assert_eq!(store.len(), 60);
    }

    #[tokio::test]
    async fn test_item_failures_are_isolated() {
        let store = MemoryStore::new(KeyLayout::natural("cveID"));
        store.fail_puts_for("CVE-2024-3");
        let report = BatchWriter::new(&store, 2).execute(&plan(5)).await;
        assert_eq!(report.uploaded, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].0, "CVE-2024-3");
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_is_retried() {
        let store = MemoryStore::new(KeyLayout::natural("cveID"));
        store.fail_transiently(2);
        let report = BatchWriter::new(&store, 10)
            .with_retry(fast_retry())
            .execute(&plan(4))
            .await;
        assert_eq!(report.uploaded, 4);
        assert_eq!(store.put_calls(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_item() {
        let store = MemoryStore::new(KeyLayout::natural("cveID"));
        store.set_unavailable(true);
        let report = BatchWriter::new(&store, 2)
            .with_retry(fast_retry())
            .execute(&plan(3))
            .await;
        assert_eq!(report.uploaded, 0);
        assert_eq!(report.failed, 3);
    }

    #[tokio::test]
    async fn test_empty_plan_makes_no_calls() {
        let store = MemoryStore::new(KeyLayout::natural("cveID"));
        let report = BatchWriter::new(&store, 25).execute(&[]).await;
        assert_eq!(report.attempted, 0);
        assert_eq!(store.put_calls(), 0);
    }
}
