//! Integration tests for commit cycles against in-memory and custom sinks.
//!
//! These tests run the local store and the coordinator together and check
//! what ends up at the sink and what stays on disk: full commits, retries
//! after partial success, idempotent re-sends, whole-batch failures,
//! timeouts, and coalescing of concurrent cycles.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use spool::compression::CompressionMode;
use spool::config::SpoolConfig;
use spool::datum::{DataKind, DataUnit};
use spool::error::{CommitError, SinkError, SpoolError};
use spool::local::LocalStore;
use spool::remote::{CommitMode, CycleOutcome, RemoteStoreCoordinator};
use spool::sink::{MemorySink, RecordOutcome, RemoteSink, SinkRecord};
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const KINDS: [&str; 3] = ["location", "battery", "wifi"];

fn config(dir: &Path, mode: CompressionMode) -> SpoolConfig {
    SpoolConfig::new(dir)
        .with_compression(mode)
        .with_max_file_bytes(u64::MAX)
        .with_batch_size(128)
        .with_table(DataKind::new("location").unwrap(), "locations")
        .with_table(DataKind::new("battery").unwrap(), "batteries")
        .with_table(DataKind::new("wifi").unwrap(), "wifi_scans")
}

async fn pipeline(
    config: &SpoolConfig,
    sink: Arc<dyn RemoteSink>,
) -> (Arc<LocalStore>, Arc<RemoteStoreCoordinator>) {
    let local = Arc::new(LocalStore::new(config, "integration"));
    let remote = Arc::new(RemoteStoreCoordinator::new(config, sink, "integration"));
    local.start().unwrap();
    remote.start().await.unwrap();
    (local, remote)
}

/// Writes `n` records with randomly chosen kinds and returns their keys.
fn write_random(local: &LocalStore, n: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|i| {
            let kind = DataKind::new(KINDS[rng.gen_range(0..KINDS.len())]).unwrap();
            let unit = DataUnit::new(
                "integration",
                kind,
                json!({ "seq": i, "value": rng.gen_range(0.0..100.0) }),
            )
            .unwrap();
            local.write(&unit).unwrap();
            unit.commit_key()
        })
        .collect()
}

fn store_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_thousand_random_records_commit_exactly_once() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::None), sink.clone()).await;

    let keys = write_random(&local, 1000);
    let before = store_files(temp_dir.path());
    assert_eq!(before.len(), 1, "one local file before any promotion: {before:?}");
    assert!(before[0].ends_with(".open"));

    let report = remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.records_committed, 1000);
    assert_eq!(report.files_committed, 1);

    let after = store_files(temp_dir.path());
    assert_eq!(after.len(), 1, "only the fresh active file remains: {after:?}");
    assert!(after[0].ends_with(".open"));
    assert_ne!(after[0], before[0]);
    assert_eq!(local.current_size_estimate(), 0);

    assert_eq!(sink.len(), 1000);
    assert_eq!(sink.records_received(), 1000);
    for key in &keys {
        assert!(sink.contains_key(key), "missing {key}");
    }
    let per_table: usize = ["locations", "batteries", "wifi_scans"]
        .iter()
        .map(|t| sink.table_len(t))
        .sum();
    assert_eq!(per_table, 1000);
}

#[tokio::test]
async fn test_full_commit_empties_pending_for_every_mode() {
    for mode in CompressionMode::ALL {
        let temp_dir = tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let config = config(temp_dir.path(), mode).with_max_file_bytes(2048);
        let (local, remote) = pipeline(&config, sink.clone()).await;

        write_random(&local, 400);
        local.promote().unwrap();
        assert!(!local.pending_files().unwrap().is_empty());

        remote
            .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
            .await
            .unwrap();

        assert!(local.pending_files().unwrap().is_empty(), "{mode}");
        assert_eq!(sink.len(), 400, "{mode}");
    }
}

#[tokio::test]
async fn test_sink_failing_every_second_insert_eventually_commits_all() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    sink.fail_every(2);
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::Fast), sink.clone()).await;
    let keys = write_random(&local, 1000);
    let cancel = CancellationToken::new();

    let first = remote
        .commit_pending(&local, &cancel, CommitMode::Forced)
        .await
        .unwrap();
    assert_eq!(first.records_committed, 500);
    assert_eq!(first.retried, 500);
    assert_eq!(first.files_retained, 1);
    let retained = local.pending_files().unwrap();
    assert_eq!(retained.len(), 1, "file must survive a partial commit");
    assert_eq!(retained[0].read_units().unwrap().units.len(), 500);

    let mut cycles = 1;
    while !local.pending_files().unwrap().is_empty() {
        assert!(cycles < 20, "retries did not converge");
        remote
            .commit_pending(&local, &cancel, CommitMode::Forced)
            .await
            .unwrap();
        cycles += 1;
    }

    assert_eq!(sink.len(), 1000);
    let unique: HashSet<String> = sink.keys().into_iter().collect();
    assert_eq!(unique.len(), 1000);
    for key in &keys {
        assert!(unique.contains(key));
    }
    assert_eq!(remote.counters().committed, 1000);
    assert_eq!(remote.counters().duplicates, 0);
}

#[tokio::test]
async fn test_sink_failing_every_second_batch_drains_multi_batch_file() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    sink.fail_every_batch(2);
    let config = config(temp_dir.path(), CompressionMode::Fast).with_batch_size(100);
    let (local, remote) = pipeline(&config, sink.clone()).await;
    let keys = write_random(&local, 300);
    let cancel = CancellationToken::new();

    // Each cycle settles one batch before the next call fails; the file
    // shrinks to what is still unsettled instead of starting over.
    for (stored, remaining) in [(100, 200), (200, 100)] {
        let err = remote
            .commit_pending(&local, &cancel, CommitMode::Forced)
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolError::Sink(SinkError::Unavailable { .. })));
        assert_eq!(sink.len(), stored);

        let pending = local.pending_files().unwrap();
        assert_eq!(pending.len(), 1, "file must survive until fully committed");
        assert_eq!(pending[0].read_units().unwrap().units.len(), remaining);
    }

    let last = remote
        .commit_pending(&local, &cancel, CommitMode::Forced)
        .await
        .unwrap();
    assert_eq!(last.records_committed, 100);
    assert_eq!(last.files_committed, 1);
    assert!(local.pending_files().unwrap().is_empty());

    assert_eq!(sink.len(), 300);
    for key in &keys {
        assert!(sink.contains_key(key), "missing {key}");
    }
    assert_eq!(remote.counters().committed, 300);
    assert_eq!(remote.counters().duplicates, 0);
    assert_eq!(sink.insert_calls(), 5);
}

#[tokio::test]
async fn test_two_batch_file_commits_after_one_retried_cycle() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    sink.fail_every_batch(2);
    let config = config(temp_dir.path(), CompressionMode::None).with_batch_size(100);
    let (local, remote) = pipeline(&config, sink.clone()).await;
    write_random(&local, 200);
    let cancel = CancellationToken::new();

    assert!(remote.commit_pending(&local, &cancel, CommitMode::Forced).await.is_err());
    assert_eq!(local.pending_files().unwrap().len(), 1);

    let retried = remote
        .commit_pending(&local, &cancel, CommitMode::Forced)
        .await
        .unwrap();
    assert_eq!(retried.records_committed, 100);
    assert!(local.pending_files().unwrap().is_empty());
    assert_eq!(sink.len(), 200);
    assert_eq!(remote.counters().duplicates, 0);
}

#[tokio::test]
async fn test_commit_from_unstarted_store_leaves_open_file_alone() {
    let temp_dir = tempdir().unwrap();
    let config = config(temp_dir.path(), CompressionMode::None);
    let (producer, _) = pipeline(&config, Arc::new(MemorySink::new())).await;
    write_random(&producer, 10);
    producer.promote().unwrap();
    write_random(&producer, 4);

    // A second process commits the same directory without starting a store.
    let sink = Arc::new(MemorySink::new());
    let reader = LocalStore::new(&config, "reader");
    let remote = RemoteStoreCoordinator::new(&config, sink.clone(), "reader");
    remote.start().await.unwrap();
    let report = remote
        .commit_pending(&reader, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap();

    assert_eq!(report.records_committed, 10);
    assert_eq!(sink.len(), 10);
    let names = store_files(temp_dir.path());
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with(".open"));
    assert_eq!(producer.stats().active_records, 4);
    producer.write(&DataUnit::new("integration", DataKind::new("wifi").unwrap(), json!({})).unwrap()).unwrap();
}

#[tokio::test]
async fn test_committing_same_file_twice_is_idempotent() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::Optimal), sink.clone()).await;

    write_random(&local, 200);
    let pending = local.promote().unwrap().unwrap();
    let copy = std::fs::read(pending.path()).unwrap();
    let cancel = CancellationToken::new();

    let first = remote
        .commit_pending(&local, &cancel, CommitMode::Forced)
        .await
        .unwrap();
    assert_eq!(first.records_committed, 200);
    assert!(!pending.path().exists());

    // Put the same file back, as if the delete had been lost in a crash.
    std::fs::write(pending.path(), copy).unwrap();
    let second = remote
        .commit_pending(&local, &cancel, CommitMode::Forced)
        .await
        .unwrap();

    assert_eq!(second.records_committed, 0);
    assert_eq!(second.duplicates, 200);
    assert_eq!(second.committed_count(), 200);
    assert_eq!(sink.len(), 200);
    assert!(local.pending_files().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_records_are_dropped_not_retried() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    sink.reject_kind(DataKind::new("wifi").unwrap());
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::None), sink.clone()).await;

    for (i, kind) in KINDS.iter().cycle().take(30).enumerate() {
        let unit = DataUnit::new("integration", DataKind::new(*kind).unwrap(), json!({ "i": i })).unwrap();
        local.write(&unit).unwrap();
    }

    let report = remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap();

    assert_eq!(report.records_committed, 20);
    assert_eq!(report.rejected, 10);
    assert_eq!(report.retried, 0);
    assert!(local.pending_files().unwrap().is_empty());
    assert_eq!(sink.table_len("wifi_scans"), 0);
}

#[tokio::test]
async fn test_unavailable_sink_leaves_file_untouched() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::Fast), sink.clone()).await;

    write_random(&local, 50);
    let pending = local.promote().unwrap().unwrap();
    let original = std::fs::read(pending.path()).unwrap();

    sink.set_unavailable(true);
    let err = remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap_err();
    assert!(matches!(err, SpoolError::Sink(SinkError::Unavailable { .. })));
    assert_eq!(std::fs::read(pending.path()).unwrap(), original);
    assert_eq!(remote.counters().attempted, 50);
    assert_eq!(remote.counters().successes(), 0);

    sink.set_unavailable(false);
    let report = remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap();
    assert_eq!(report.records_committed, 50);
    assert!(local.pending_files().unwrap().is_empty());
}

#[tokio::test]
async fn test_files_commit_oldest_first_in_write_order() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::None), sink.clone()).await;

    for i in 0..30 {
        let unit = DataUnit::new("integration", DataKind::new("battery").unwrap(), json!({ "seq": i })).unwrap();
        local.write(&unit).unwrap();
        if i % 10 == 9 {
            local.promote().unwrap();
        }
    }
    assert_eq!(local.pending_files().unwrap().len(), 3);

    remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap();

    let seen = sink.seqs.lock().clone();
    assert_eq!(seen, (0..30).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_truncated_tail_commits_readable_prefix() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::None), sink.clone()).await;

    write_random(&local, 8);
    let pending = local.promote().unwrap().unwrap();
    let mut bytes = std::fs::read(pending.path()).unwrap();
    bytes.extend_from_slice(b"{\"id\":\"00000000-");
    std::fs::write(pending.path(), bytes).unwrap();

    let report = remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap();

    assert_eq!(report.records_committed, 8);
    assert_eq!(report.data_loss_files, 1);
    assert!(local.pending_files().unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_batch_times_out_and_keeps_file() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(GatedSink::default());
    let config = config(temp_dir.path(), CompressionMode::None).with_commit_timeout(Duration::from_millis(50));
    let (local, remote) = pipeline(&config, sink.clone()).await;

    write_random(&local, 5);
    let err = remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap_err();

    assert!(matches!(err, SpoolError::Commit(CommitError::Timeout { .. })));
    assert_eq!(local.pending_files().unwrap().len(), 1);
    assert!(sink.inner.is_empty());
}

#[tokio::test]
async fn test_concurrent_cycle_request_is_coalesced() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(GatedSink::default());
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::None), sink.clone()).await;
    write_random(&local, 5);

    let first = {
        let local = Arc::clone(&local);
        let remote = Arc::clone(&remote);
        tokio::spawn(async move {
            remote
                .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
                .await
        })
    };
    sink.entered.notified().await;

    let second = remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap();
    assert_eq!(second.outcome, CycleOutcome::Coalesced);

    sink.release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.outcome, CycleOutcome::Completed);
    assert_eq!(first.records_committed, 5);
    assert_eq!(remote.counters().cycles, 1);
}

#[tokio::test]
async fn test_cancellation_mid_batch_keeps_file() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(GatedSink::default());
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::None), sink.clone()).await;
    write_random(&local, 5);

    let cancel = CancellationToken::new();
    let cycle = {
        let local = Arc::clone(&local);
        let remote = Arc::clone(&remote);
        let cancel = cancel.clone();
        tokio::spawn(async move { remote.commit_pending(&local, &cancel, CommitMode::Forced).await })
    };
    sink.entered.notified().await;
    cancel.cancel();

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(report.outcome, CycleOutcome::Cancelled);
    assert_eq!(local.pending_files().unwrap().len(), 1);
}

#[tokio::test]
async fn test_outcome_count_mismatch_is_an_error() {
    let temp_dir = tempdir().unwrap();
    let (local, remote) = pipeline(&config(temp_dir.path(), CompressionMode::None), Arc::new(ShortSink)).await;
    write_random(&local, 3);

    let err = remote
        .commit_pending(&local, &CancellationToken::new(), CommitMode::Forced)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SpoolError::Commit(CommitError::OutcomeMismatch { sent: 3, returned: 0 })
    ));
    assert_eq!(local.pending_files().unwrap().len(), 1);
}

/// Records the `seq` payload field of everything it receives.
#[derive(Default)]
struct RecordingSink {
    seqs: parking_lot::Mutex<Vec<u64>>,
}

#[async_trait]
impl RemoteSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn insert_batch(&self, records: &[SinkRecord<'_>]) -> Result<Vec<RecordOutcome>, SinkError> {
        let mut seqs = self.seqs.lock();
        for record in records {
            seqs.push(record.unit.payload()["seq"].as_u64().unwrap());
        }
        Ok(vec![RecordOutcome::Committed; records.len()])
    }
}

/// Blocks every batch until released, then forwards to a memory sink.
#[derive(Default)]
struct GatedSink {
    inner: MemorySink,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl RemoteSink for GatedSink {
    fn name(&self) -> &str {
        "gated"
    }

    async fn insert_batch(&self, records: &[SinkRecord<'_>]) -> Result<Vec<RecordOutcome>, SinkError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.insert_batch(records).await
    }
}

/// Violates the contract by never returning outcomes.
struct ShortSink;

#[async_trait]
impl RemoteSink for ShortSink {
    fn name(&self) -> &str {
        "short"
    }

    async fn insert_batch(&self, _records: &[SinkRecord<'_>]) -> Result<Vec<RecordOutcome>, SinkError> {
        Ok(Vec::new())
    }
}
