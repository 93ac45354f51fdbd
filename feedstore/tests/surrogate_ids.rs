use std::collections::HashMap;

use async_trait::async_trait;
use feedstore::{
    Record,
    allocator::parse_id,
    baseline::{Baseline, SnapshotStore},
    config::FeedConfig,
    errors::{Result as StorageResult, StorageError},
    models::RunStage,
    reconcile::ReconcileEngine,
    store::StoreAdapter,
};

mod common;

fn module(key: &str, mod_time: &str, rank: &str) -> Record {
    Record::new(key)
        .with_field("mod_time", mod_time)
        .with_field("rank", rank)
}

fn modules() -> Vec<Record> {
    vec![
        module("exploit/unix/ftp/vsftpd", "2025-02-01 10:00:00 +0000", "excellent"),
        module("auxiliary/scanner/smb", "2025-03-01 10:00:00 +0000", "normal"),
    ]
}

async fn ids_by_key(snapshots: &impl SnapshotStore) -> anyhow::Result<HashMap<String, String>> {
    Ok(snapshots
        .load()
        .await?
        .into_iter()
        .filter_map(|(key, record)| record.surrogate_id.map(|id| (key, id)))
        .collect())
}

#[tokio::test]
async fn first_run_mints_sequential_ids_in_key_order() -> anyhow::Result<()> {
    let ctx = common::init_test_context(FeedConfig::metasploit())?;
    let engine = ReconcileEngine::new(&ctx.config, &ctx.store, &ctx.snapshots);

    let summary = engine.run(modules()).await?;
    assert_eq!(summary.uploaded, 2);

    let ids = ids_by_key(&ctx.snapshots).await?;
    assert_eq!(ids["auxiliary/scanner/smb"], "META-2025-000001");
    assert_eq!(ids["exploit/unix/ftp/vsftpd"], "META-2025-000002");

    let stored = ctx.store.get("META-2025-000002").await?.expect("item stored under its id");
    assert_eq!(stored.natural_key, "exploit/unix/ftp/vsftpd");
    assert_eq!(stored.surrogate_id.as_deref(), Some("META-2025-000002"));
    Ok(())
}

#[tokio::test]
async fn ids_are_stable_across_runs() -> anyhow::Result<()> {
    let ctx = common::init_test_context(FeedConfig::metasploit())?;
    let engine = ReconcileEngine::new(&ctx.config, &ctx.store, &ctx.snapshots);

    engine.run(modules()).await?;
    let before = ids_by_key(&ctx.snapshots).await?;

    let second = engine.run(modules()).await?;
    assert_eq!(second.to_write, 0);

    let mut changed = modules();
    changed[0].set("rank", "great");
    let third = engine.run(changed).await?;
    assert_eq!(third.uploaded, 1);

    assert_eq!(ids_by_key(&ctx.snapshots).await?, before);
    let rewritten = ctx.store.get(&before["exploit/unix/ftp/vsftpd"]).await?.unwrap();
    assert_eq!(rewritten.text("rank").as_deref(), Some("great"));
    assert_eq!(ctx.store.len(), 2);
    Ok(())
}

#[tokio::test]
async fn vanished_item_gets_a_fresh_id() -> anyhow::Result<()> {
    let ctx = common::init_test_context(FeedConfig::metasploit())?;
    let engine = ReconcileEngine::new(&ctx.config, &ctx.store, &ctx.snapshots);

    engine.run(modules()).await?;
    assert!(ctx.store.remove("META-2025-000001"));

    let summary = engine.run(modules()).await?;
    assert_eq!(summary.uploaded, 1);

    // The lost id is never handed out again.
    let ids = ids_by_key(&ctx.snapshots).await?;
    assert_eq!(ids["auxiliary/scanner/smb"], "META-2025-000003");
    assert!(ctx.store.get("META-2025-000003").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn undated_records_use_the_fallback_year() -> anyhow::Result<()> {
    let ctx = common::init_test_context(FeedConfig::metasploit())?;
    let engine =
        ReconcileEngine::new(&ctx.config, &ctx.store, &ctx.snapshots).with_fallback_year(2030);

    let mut uploaded = Record::new("post/linux/gather").with_field("rank", "normal");
    uploaded.uploaded_date = Some("2024-11-05".into());
    let undated = Record::new("payload/generic/shell").with_field("rank", "normal");

    engine.run(vec![uploaded, undated]).await?;

    let ids = ids_by_key(&ctx.snapshots).await?;
    assert_eq!(ids["post/linux/gather"], "META-2024-000001");
    assert_eq!(ids["payload/generic/shell"], "META-2030-000001");
    Ok(())
}

#[tokio::test]
async fn ids_increase_within_a_partition() -> anyhow::Result<()> {
    let ctx = common::init_test_context(FeedConfig::metasploit())?;
    let engine = ReconcileEngine::new(&ctx.config, &ctx.store, &ctx.snapshots);

    engine.run(modules()).await?;
    let mut next = modules();
    next.push(module("exploit/windows/smb/ms17", "2025-06-01 00:00:00 +0000", "great"));
    next.push(module("exploit/linux/http/a", "2025-07-01 00:00:00 +0000", "good"));
    engine.run(next).await?;

    let ids = ids_by_key(&ctx.snapshots).await?;
    assert_eq!(ids.len(), 4);
    let mut sequences: Vec<u64> = ids
        .values()
        .filter_map(|id| parse_id("META", id))
        .filter(|parsed| parsed.partition == "2025")
        .map(|parsed| parsed.sequence)
        .collect();
    sequences.sort();
    assert_eq!(sequences, vec![1, 2, 3, 4]);

    // Newly seen keys are minted after the existing ones, in key order.
    assert_eq!(ids["exploit/linux/http/a"], "META-2025-000003");
    assert_eq!(ids["exploit/windows/smb/ms17"], "META-2025-000004");
    Ok(())
}

struct UnpublishableSnapshots;

#[async_trait]
impl SnapshotStore for UnpublishableSnapshots {
    async fn load(&self) -> StorageResult<Baseline> {
        Ok(Baseline::new())
    }

    async fn publish(&self, _baseline: &Baseline) -> StorageResult<()> {
        Err(StorageError::Publish("disk full".into()))
    }

    fn location(&self) -> String {
        "unpublishable".into()
    }
}

#[tokio::test]
async fn store_ahead_of_baseline_keeps_stored_ids() -> anyhow::Result<()> {
    let ctx = common::init_test_context(FeedConfig::metasploit())?;

    let failing = ReconcileEngine::new(&ctx.config, &ctx.store, &UnpublishableSnapshots);
    let failure = failing.run(modules()).await.unwrap_err();
    assert_eq!(failure.stage, RunStage::PublishBaseline);
    assert_eq!(ctx.store.len(), 2);

    let engine = ReconcileEngine::new(&ctx.config, &ctx.store, &ctx.snapshots);
    let summary = engine.run(modules()).await?;
    assert_eq!(summary.to_write, 0);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(ctx.store.len(), 2);

    let ids = ids_by_key(&ctx.snapshots).await?;
    assert_eq!(ids["auxiliary/scanner/smb"], "META-2025-000001");
    assert_eq!(ids["exploit/unix/ftp/vsftpd"], "META-2025-000002");

    let mut changed = modules();
    changed[1].set("rank", "low");
    let third = engine.run(changed).await?;
    assert_eq!(third.uploaded, 1);
    assert_eq!(ctx.store.len(), 2);
    Ok(())
}
