//! Integration tests for the owning session lifecycle.
//!
//! Start, stop and restart with pending files in flight, the scheduled
//! commit task, configuration failures, explicit reset, and health-driven
//! restarts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spool::config::SpoolConfig;
use spool::datum::{DataKind, DataUnit};
use spool::error::{ConfigError, SinkError, SpoolError};
use spool::health::RestartReason;
use spool::session::Session;
use spool::sink::{DirectorySink, MemorySink};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn config(dir: &Path) -> SpoolConfig {
    SpoolConfig::new(dir.join("store")).with_default_table("events")
}

fn write_n(session: &Session, n: usize) {
    let cancel = CancellationToken::new();
    for i in 0..n {
        let unit = DataUnit::new(session.id(), DataKind::new("battery").unwrap(), json!({ "i": i })).unwrap();
        session.write(&unit, &cancel).unwrap();
    }
}

#[tokio::test]
async fn test_stop_commits_everything_written() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let session = Session::new(config(temp_dir.path()), sink.clone());

    session.start().await.unwrap();
    assert!(sink.is_started());
    write_n(&session, 100);
    session.stop().await.unwrap();

    assert_eq!(sink.len(), 100);
    assert!(!sink.is_started());
    assert!(session.local().pending_files().unwrap().is_empty());
}

#[tokio::test]
async fn test_pending_files_survive_restart() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    sink.set_unavailable(true);
    let config = config(temp_dir.path());

    {
        let session = Session::new(config.clone(), sink.clone());
        session.start().await.unwrap();
        write_n(&session, 40);
        session.stop().await.unwrap();
        assert_eq!(session.local().pending_files().unwrap().len(), 1);
    }
    assert!(sink.is_empty());

    sink.set_unavailable(false);
    let session = Session::new(config, sink.clone());
    session.start().await.unwrap();
    let report = session.commit_now(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.records_committed, 40);
    assert!(session.local().pending_files().unwrap().is_empty());
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_scheduled_task_commits_after_write_delay() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let config = config(temp_dir.path()).with_write_delay(Duration::from_millis(50));
    let session = Session::new(config, sink.clone());

    session.start().await.unwrap();
    write_n(&session, 10);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sink.len() < 10 {
        assert!(tokio::time::Instant::now() < deadline, "scheduled commit never ran");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(session.remote().counters().cycles >= 1);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_fails_start() {
    let temp_dir = tempdir().unwrap();
    let config = config(temp_dir.path()).with_batch_size(0);
    let session = Session::new(config, Arc::new(MemorySink::new()));

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SpoolError::Config(ConfigError::InvalidValue { field: "batch_size", .. })));
    assert!(!session.is_running());
    assert!(!session.local().is_running());
}

#[tokio::test]
async fn test_sink_configuration_error_fails_start() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    sink.set_misconfigured(Some("no bucket".to_string()));
    let session = Session::new(config(temp_dir.path()), sink);

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SpoolError::Sink(SinkError::Configuration { .. })));
    assert!(!session.is_running());
    assert!(!session.local().is_running());
    assert!(!session.remote().is_running());

    let err = session
        .write(
            &DataUnit::new(session.id(), DataKind::new("battery").unwrap(), json!({})).unwrap(),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("not running"));
}

#[tokio::test]
async fn test_health_restart_keeps_pending_files() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let session = Session::new(config(temp_dir.path()), sink.clone());
    session.start().await.unwrap();

    sink.set_unavailable(true);
    write_n(&session, 20);
    sink.set_restart_recommended(true);

    let report = session.test_health().await.unwrap();
    assert!(report.restart);
    assert_eq!(report.reason, Some(RestartReason::SinkRecommended));
    assert_eq!(report.event.properties["restart"], "true");

    // Restart ran stop (with a failing final commit) then start.
    assert!(session.is_running());
    assert_eq!(session.local().pending_files().unwrap().len(), 1);

    sink.set_unavailable(false);
    sink.set_restart_recommended(false);
    let report = session.commit_now(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.records_committed, 20);

    let healthy = session.test_health().await.unwrap();
    assert!(!healthy.restart);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_session_is_not_restarted() {
    let temp_dir = tempdir().unwrap();
    let session = Session::new(config(temp_dir.path()), Arc::new(MemorySink::new()));

    let report = session.test_health().await.unwrap();
    assert_eq!(report.reason, Some(RestartReason::LocalStopped));
    assert!(!session.is_running());
}

#[tokio::test]
async fn test_reset_clears_pending_and_counters() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let session = Session::new(config(temp_dir.path()), sink.clone());
    session.start().await.unwrap();

    write_n(&session, 10);
    session.commit_now(&CancellationToken::new()).await.unwrap();
    sink.set_unavailable(true);
    write_n(&session, 5);
    assert!(session.commit_now(&CancellationToken::new()).await.is_err());

    assert_eq!(session.reset().await.unwrap(), 1);
    assert!(session.local().pending_files().unwrap().is_empty());
    assert_eq!(session.remote().counters().attempted, 0);
    assert_eq!(session.remote().counters().cycles, 0);

    sink.set_unavailable(false);
    session.stop().await.unwrap();
    assert_eq!(sink.len(), 10);
}

#[tokio::test]
async fn test_directory_sink_end_to_end() {
    let temp_dir = tempdir().unwrap();
    let remote_root = temp_dir.path().join("remote");
    let config = config(temp_dir.path()).with_table(DataKind::new("battery").unwrap(), "batteries");
    let session = Session::new(config, Arc::new(DirectorySink::new(&remote_root)));

    session.start().await.unwrap();
    write_n(&session, 12);
    let first = session.commit_now(&CancellationToken::new()).await.unwrap();
    assert_eq!(first.records_committed, 12);
    session.stop().await.unwrap();

    let stored = std::fs::read_dir(remote_root.join("batteries")).unwrap().count();
    assert_eq!(stored, 12);
}

#[tokio::test]
async fn test_requested_commit_is_throttled_by_write_delay() {
    let temp_dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let session = Session::new(config(temp_dir.path()), sink.clone());
    session.start().await.unwrap();
    let cancel = CancellationToken::new();

    write_n(&session, 3);
    let first = session.request_commit(&cancel).await.unwrap();
    write_n(&session, 3);
    let second = session.request_commit(&cancel).await.unwrap();

    assert_eq!(first.records_committed, 3);
    assert_eq!(second.outcome, spool::remote::CycleOutcome::Throttled);
    assert_eq!(sink.len(), 3);

    session.stop().await.unwrap();
    assert_eq!(sink.len(), 6);
}
