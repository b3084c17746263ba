//! Owning session: binds one local store and one coordinator together.
//!
//! A [`Session`] is the unit of lifecycle. It builds exactly one
//! [`LocalStore`], one [`RemoteStoreCoordinator`] and one [`HealthMonitor`]
//! from a [`SpoolConfig`], all tagged with the session id, and runs the
//! background task that commits pending files every `write_delay`.
//!
//! Stopping is always safe: pending files live on disk, so a restart (or a
//! process crash) only delays their commit.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spool::config::SpoolConfig;
//! use spool::datum::{DataKind, DataUnit};
//! use spool::session::Session;
//! use spool::sink::MemorySink;
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpoolConfig::new("./spool_data").with_default_table("events");
//! let session = Session::new(config, Arc::new(MemorySink::new()));
//! session.start().await?;
//!
//! let cancel = CancellationToken::new();
//! let unit = DataUnit::new(session.id(), DataKind::new("battery")?, json!({ "level": 0.8 }))?;
//! session.write(&unit, &cancel)?;
//!
//! let report = session.commit_now(&cancel).await?;
//! println!("committed {}", report.committed_count());
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::SpoolConfig;
use crate::datum::DataUnit;
use crate::error::{LocalError, Result};
use crate::health::{HealthMonitor, HealthReport};
use crate::local::{LocalStore, WriteAck};
use crate::remote::{CommitMode, CommitReport, RemoteStoreCoordinator};
use crate::sink::RemoteSink;

/// Background commit task handle.
#[derive(Debug)]
struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One buffering session: local store, coordinator, health monitor, and the
/// scheduled commit task.
#[derive(Debug)]
pub struct Session {
    id: String,
    config: SpoolConfig,
    local: Arc<LocalStore>,
    remote: Arc<RemoteStoreCoordinator>,
    monitor: HealthMonitor,
    running: AtomicBool,
    worker: tokio::sync::Mutex<Option<Worker>>,
    span: Span,
}

impl Session {
    /// Creates a stopped session with a generated id.
    pub fn new(config: SpoolConfig, sink: Arc<dyn RemoteSink>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), config, sink)
    }

    /// Creates a stopped session with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, config: SpoolConfig, sink: Arc<dyn RemoteSink>) -> Self {
        let id = id.into();
        Self {
            local: Arc::new(LocalStore::new(&config, &id)),
            remote: Arc::new(RemoteStoreCoordinator::new(&config, sink, &id)),
            monitor: HealthMonitor::new(config.health, &id),
            span: info_span!("session", session = %id),
            running: AtomicBool::new(false),
            worker: tokio::sync::Mutex::new(None),
            config,
            id,
        }
    }

    /// Session id stamped on every log line and expected on data units.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configuration the session was built from.
    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    /// The session's local store.
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// The session's coordinator.
    pub fn remote(&self) -> &Arc<RemoteStoreCoordinator> {
        &self.remote
    }

    /// Returns `true` between a successful `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the coordinator (and its sink), then the local store, then the
    /// scheduled commit task. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](crate::error::ConfigError) for an invalid
    /// configuration, the sink's start error, or the local store's start
    /// error. Nothing is left running on failure.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }

        self.config.validate()?;
        self.remote.start().await?;
        if let Err(e) = self.local.start() {
            if let Err(stop_err) = self.remote.stop().await {
                warn!(parent: &self.span, error = %stop_err, "failed to stop coordinator after local start failure");
            }
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            commit_loop(
                Arc::clone(&self.local),
                Arc::clone(&self.remote),
                cancel.clone(),
                self.config.write_delay,
            )
            .instrument(self.span.clone()),
        );
        *worker = Some(Worker { cancel, handle });
        self.running.store(true, Ordering::SeqCst);

        info!(
            parent: &self.span,
            directory = %self.config.directory.display(),
            write_delay = ?self.config.write_delay,
            "session started"
        );
        Ok(())
    }

    /// Stops the session: cancels and joins the commit task, stops the local
    /// store (promoting its active file), runs one final forced commit bounded
    /// by `commit_timeout`, and stops the coordinator.
    ///
    /// Files the final commit could not send stay pending for the next start.
    ///
    /// # Errors
    ///
    /// Returns the first error from stopping the local store or the
    /// coordinator. A failed final commit is logged, not returned. The
    /// session is stopped regardless.
    pub async fn stop(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        let Some(Worker { cancel, handle }) = worker.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);

        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(parent: &self.span, error = %e, "commit task ended abnormally");
        }

        let mut first_error = None;
        if let Err(e) = self.local.stop() {
            warn!(parent: &self.span, error = %e, "failed to stop local store");
            first_error = Some(e);
        }

        let final_cancel = CancellationToken::new();
        let final_commit = self
            .remote
            .commit_pending(&self.local, &final_cancel, CommitMode::Forced);
        match tokio::time::timeout(self.config.commit_timeout, final_commit).await {
            Ok(Ok(report)) => debug!(
                parent: &self.span,
                committed = report.committed_count(),
                retained = report.files_retained,
                "final commit finished"
            ),
            Ok(Err(e)) => warn!(parent: &self.span, error = %e, "final commit failed; files stay pending"),
            Err(_) => warn!(
                parent: &self.span,
                timeout = ?self.config.commit_timeout,
                "final commit timed out; files stay pending"
            ),
        }

        if let Err(e) = self.remote.stop().await {
            first_error.get_or_insert(e);
        }

        info!(parent: &self.span, "session stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Stops then starts the session. Pending files survive.
    ///
    /// # Errors
    ///
    /// Returns the start error. A stop error is logged and does not prevent
    /// the start attempt.
    pub async fn restart(&self) -> Result<()> {
        if let Err(e) = self.stop().await {
            warn!(parent: &self.span, error = %e, "stop during restart failed");
        }
        self.monitor.reset();
        info!(parent: &self.span, "restarting session");
        self.start().await
    }

    /// Hands one data unit to the local store.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::Cancelled`] if `cancel` has fired, otherwise
    /// whatever [`LocalStore::write`] returns.
    pub fn write(&self, unit: &DataUnit, cancel: &CancellationToken) -> Result<WriteAck> {
        if cancel.is_cancelled() {
            return Err(LocalError::Cancelled.into());
        }
        self.local.write(unit)
    }

    /// Runs a commit cycle now, ignoring the write delay.
    ///
    /// # Errors
    ///
    /// See [`RemoteStoreCoordinator::commit_pending`].
    pub async fn commit_now(&self, cancel: &CancellationToken) -> Result<CommitReport> {
        self.remote
            .commit_pending(&self.local, cancel, CommitMode::Forced)
            .await
    }

    /// Runs a commit cycle unless one started within the write delay.
    ///
    /// # Errors
    ///
    /// See [`RemoteStoreCoordinator::commit_pending`].
    pub async fn request_commit(&self, cancel: &CancellationToken) -> Result<CommitReport> {
        self.remote
            .commit_pending(&self.local, cancel, CommitMode::Requested)
            .await
    }

    /// Runs the health monitor and restarts the session when it says so.
    /// A stopped session is reported on but never restarted.
    ///
    /// # Errors
    ///
    /// Returns the restart error, if a restart was attempted and failed.
    pub async fn test_health(&self) -> Result<HealthReport> {
        let report = self.monitor.check(&self.local, &self.remote).await;
        if report.restart && self.is_running() {
            self.restart().await?;
        }
        Ok(report)
    }

    /// Explicit store reset: deletes every pending file and clears the
    /// commit counters and health streak. Returns the number of files
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns the first deletion error.
    pub async fn reset(&self) -> Result<usize> {
        let removed = self.remote.reset(&self.local).await?;
        self.monitor.reset();
        Ok(removed)
    }

    /// Subscribes to the most recently written data unit.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Option<Arc<DataUnit>>> {
        self.local.subscribe()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel.cancel();
        }
    }
}

/// Commits pending files every `write_delay` until cancelled.
async fn commit_loop(
    local: Arc<LocalStore>,
    remote: Arc<RemoteStoreCoordinator>,
    cancel: CancellationToken,
    write_delay: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + write_delay, write_delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match remote.commit_pending(&local, &cancel, CommitMode::Forced).await {
                    Ok(report) => debug!(
                        outcome = ?report.outcome,
                        committed = report.committed_count(),
                        "scheduled commit finished"
                    ),
                    Err(e) => warn!(error = %e, "scheduled commit failed; files stay pending"),
                }
            }
        }
    }

    debug!("commit task stopped");
}
