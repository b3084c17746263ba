//! Remote store coordinator: moves pending files to the remote sink.
//!
//! The coordinator owns no durable state. The files left by the
//! [`LocalStore`] are the record of what still has to be sent; the
//! coordinator only holds the sink, the routing table, timing parameters,
//! and running counters for health reporting.
//!
//! # Design
//!
//! A commit cycle:
//!
//! 1. asks the local store to promote its active file, so everything written
//!    so far becomes eligible;
//! 2. walks pending files oldest generation first, reading each back in
//!    write order and sending it in batches of `batch_size`;
//! 3. classifies every record by its [`RecordOutcome`]. Committed and
//!    duplicate records are done, rejected records are dropped with a
//!    warning, and retry records are kept;
//! 4. deletes a file once nothing in it needs retrying, or atomically
//!    rewrites it to hold only the records that do.
//!
//! A whole-batch [`SinkError`](crate::error::SinkError), a timeout, or
//! cancellation ends the cycle. Records settled by earlier batches of the
//! current file are dropped from it; the interrupted batch and everything
//! after it stay pending. A batch that was in flight may have reached the
//! sink anyway, so its records can come back as duplicates next cycle.
//!
//! Only one cycle runs at a time. A request that arrives while a cycle is in
//! flight returns immediately with [`CycleOutcome::Coalesced`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::config::SpoolConfig;
use crate::datum::DataUnit;
use crate::error::{CommitError, Result};
use crate::local::LocalStore;
use crate::pending::{PendingFile, ReadOutcome};
use crate::sink::{RecordOutcome, RemoteSink, SinkRecord, TableRegistry};

/// How a commit cycle treats the write delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Skipped if a cycle started less than `write_delay` ago.
    Requested,
    /// Runs regardless of the write delay.
    Forced,
}

/// How a commit cycle ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every pending file was attempted.
    #[default]
    Completed,
    /// Skipped because of the write delay.
    Throttled,
    /// Skipped because another cycle was in flight.
    Coalesced,
    /// Stopped by the cancellation token; remaining files stay pending.
    Cancelled,
}

/// Summary of one commit cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Files fully acknowledged and deleted.
    pub files_committed: usize,
    /// Files left pending (rewritten with retry records, or not reached).
    pub files_retained: usize,
    /// Records newly stored by the sink.
    pub records_committed: u64,
    /// Records the sink already had.
    pub duplicates: u64,
    /// Records dropped: refused by the sink or without a destination table.
    pub rejected: u64,
    /// Records kept for the next cycle.
    pub retried: u64,
    /// Files whose unreadable tail was discarded.
    pub data_loss_files: usize,
}

impl CommitReport {
    fn skipped(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            ..Self::default()
        }
    }

    /// Records known to be at the sink after this cycle, duplicates included.
    pub fn committed_count(&self) -> u64 {
        self.records_committed + self.duplicates
    }
}

/// Running totals across commit cycles. Only [`RemoteStoreCoordinator::reset_counters`]
/// clears them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCounters {
    /// Cycles that ran (not throttled or coalesced).
    pub cycles: u64,
    /// Records handed to the sink, including failed batches.
    pub attempted: u64,
    /// Records newly stored.
    pub committed: u64,
    /// Records the sink already had.
    pub duplicates: u64,
    /// Records dropped.
    pub rejected: u64,
}

impl CommitCounters {
    /// Attempts that ended with the record at the sink.
    pub fn successes(&self) -> u64 {
        self.committed + self.duplicates
    }
}

#[derive(Debug, Default)]
struct CycleState {
    last_started: Option<Instant>,
}

/// What happened to one pending file.
enum FileDisposition {
    Removed,
    Retained,
    Cancelled,
}

/// Commits pending files from a [`LocalStore`] to a [`RemoteSink`].
pub struct RemoteStoreCoordinator {
    sink: Arc<dyn RemoteSink>,
    tables: TableRegistry,
    write_delay: Duration,
    commit_timeout: Duration,
    batch_size: usize,
    running: AtomicBool,
    cycle: tokio::sync::Mutex<CycleState>,
    counters: parking_lot::Mutex<CommitCounters>,
    span: Span,
}

impl std::fmt::Debug for RemoteStoreCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStoreCoordinator")
            .field("sink", &self.sink.name())
            .field("tables", &self.tables)
            .field("write_delay", &self.write_delay)
            .field("commit_timeout", &self.commit_timeout)
            .field("batch_size", &self.batch_size)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RemoteStoreCoordinator {
    /// Creates a stopped coordinator for `session_id`.
    pub fn new(config: &SpoolConfig, sink: Arc<dyn RemoteSink>, session_id: &str) -> Self {
        Self {
            span: info_span!("remote_store", session = %session_id, sink = sink.name()),
            sink,
            tables: config.table_registry(),
            write_delay: config.write_delay,
            commit_timeout: config.commit_timeout,
            batch_size: config.batch_size.max(1),
            running: AtomicBool::new(false),
            cycle: tokio::sync::Mutex::new(CycleState::default()),
            counters: parking_lot::Mutex::new(CommitCounters::default()),
        }
    }

    /// Minimum interval between automatic commit cycles.
    pub fn write_delay(&self) -> Duration {
        self.write_delay
    }

    /// Upper bound on a single sink batch.
    pub fn commit_timeout(&self) -> Duration {
        self.commit_timeout
    }

    /// The sink records are committed to.
    pub fn sink(&self) -> &Arc<dyn RemoteSink> {
        &self.sink
    }

    /// Starts the sink. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the sink's error, typically
    /// [`SinkError::Configuration`](crate::error::SinkError::Configuration).
    /// The coordinator stays stopped in that case.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        if let Err(e) = self.sink.start().instrument(self.span.clone()).await {
            warn!(parent: &self.span, error = %e, "sink failed to start");
            return Err(e.into());
        }
        self.running.store(true, Ordering::SeqCst);
        info!(parent: &self.span, "remote store coordinator started");
        Ok(())
    }

    /// Stops the sink. Pending files are left for the next start.
    ///
    /// # Errors
    ///
    /// Returns the sink's error; the coordinator is stopped regardless.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.sink.stop().instrument(self.span.clone()).await;
        match &result {
            Ok(()) => info!(parent: &self.span, "remote store coordinator stopped"),
            Err(e) => warn!(parent: &self.span, error = %e, "sink failed to stop cleanly"),
        }
        result.map_err(Into::into)
    }

    /// Returns `true` between a successful `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one commit cycle over every pending file of `local`.
    ///
    /// # Errors
    ///
    /// - [`CommitError::NotRunning`] if the coordinator is stopped
    /// - [`SinkError`](crate::error::SinkError) if a whole batch failed
    /// - [`CommitError::Timeout`] if a batch exceeded the commit timeout
    /// - [`CommitError::OutcomeMismatch`] if the sink broke the batch contract
    /// - [`PendingError`](crate::error::PendingError) if a file could not be
    ///   read, rewritten, or removed
    ///
    /// In every error case the unsettled records of the file being committed
    /// stay pending.
    pub async fn commit_pending(
        &self,
        local: &LocalStore,
        cancel: &CancellationToken,
        mode: CommitMode,
    ) -> Result<CommitReport> {
        if !self.is_running() {
            return Err(CommitError::NotRunning.into());
        }

        let Ok(mut cycle) = self.cycle.try_lock() else {
            debug!(parent: &self.span, "commit cycle already in flight; coalescing");
            return Ok(CommitReport::skipped(CycleOutcome::Coalesced));
        };

        if mode == CommitMode::Requested
            && cycle
                .last_started
                .is_some_and(|started| started.elapsed() < self.write_delay)
        {
            debug!(parent: &self.span, "commit requested within write delay; skipping");
            return Ok(CommitReport::skipped(CycleOutcome::Throttled));
        }

        cycle.last_started = Some(Instant::now());
        self.counters.lock().cycles += 1;

        self.run_cycle(local, cancel)
            .instrument(self.span.clone())
            .await
    }

    async fn run_cycle(&self, local: &LocalStore, cancel: &CancellationToken) -> Result<CommitReport> {
        if let Err(e) = local.promote() {
            // Files promoted earlier can still be committed.
            warn!(error = %e, "failed to promote active file before commit");
        }

        let files = local.pending_files()?;
        let total = files.len();
        let mut report = CommitReport::default();
        debug!(files = total, "commit cycle started");

        for (index, file) in files.into_iter().enumerate() {
            let disposition = if cancel.is_cancelled() {
                FileDisposition::Cancelled
            } else {
                self.commit_file(file, cancel, &mut report).await?
            };

            match disposition {
                FileDisposition::Removed => report.files_committed += 1,
                FileDisposition::Retained => report.files_retained += 1,
                FileDisposition::Cancelled => {
                    report.outcome = CycleOutcome::Cancelled;
                    report.files_retained += total - index;
                    break;
                }
            }
        }

        info!(
            outcome = ?report.outcome,
            files_committed = report.files_committed,
            files_retained = report.files_retained,
            committed = report.records_committed,
            duplicates = report.duplicates,
            rejected = report.rejected,
            retried = report.retried,
            "commit cycle finished"
        );
        Ok(report)
    }

    async fn commit_file(
        &self,
        file: PendingFile,
        cancel: &CancellationToken,
        report: &mut CommitReport,
    ) -> Result<FileDisposition> {
        let ReadOutcome { units, truncated } = file.read_units()?;
        if let Some(reason) = truncated {
            report.data_loss_files += 1;
            warn!(
                path = %file.path().display(),
                recovered = units.len(),
                reason = %reason,
                "data loss: committing readable prefix only"
            );
        }

        let mut retry: Vec<DataUnit> = Vec::new();
        for (index, chunk) in units.chunks(self.batch_size).enumerate() {
            let keys: Vec<String> = chunk.iter().map(DataUnit::commit_key).collect();
            let mut records = Vec::with_capacity(chunk.len());
            let mut unroutable = 0;
            for (unit, key) in chunk.iter().zip(&keys) {
                match self.tables.resolve(unit.kind()) {
                    Some(table) => records.push(SinkRecord { table, key, unit }),
                    None => {
                        unroutable += 1;
                        warn!(kind = %unit.kind(), key = %key, "no table for kind; dropping record");
                    }
                }
            }

            report.rejected += unroutable;
            {
                let mut counters = self.counters.lock();
                counters.rejected += unroutable;
                counters.attempted += records.len() as u64;
            }
            if records.is_empty() {
                continue;
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = tokio::time::timeout(self.commit_timeout, self.sink.insert_batch(&records)) => Some(result),
            };

            // Records of earlier batches are settled; everything from this
            // batch on stays pending if it is interrupted.
            let unsettled = || -> Vec<DataUnit> {
                let rest = &units[index * self.batch_size + chunk.len()..];
                retry
                    .iter()
                    .cloned()
                    .chain(records.iter().map(|record| record.unit.clone()))
                    .chain(rest.iter().cloned())
                    .collect()
            };

            let outcomes = match result {
                Some(Ok(Ok(outcomes))) => outcomes,
                Some(Ok(Err(e))) => {
                    warn!(path = %file.path().display(), error = %e, "batch failed; file retained");
                    Self::keep_unsettled(&file, &unsettled(), units.len())?;
                    return Err(e.into());
                }
                Some(Err(_)) => {
                    warn!(path = %file.path().display(), timeout = ?self.commit_timeout, "batch timed out; file retained");
                    Self::keep_unsettled(&file, &unsettled(), units.len())?;
                    return Err(CommitError::Timeout {
                        path: file.path().to_path_buf(),
                        timeout: self.commit_timeout,
                    }
                    .into());
                }
                None => {
                    debug!(path = %file.path().display(), "commit cancelled mid-file");
                    Self::keep_unsettled(&file, &unsettled(), units.len())?;
                    return Ok(FileDisposition::Cancelled);
                }
            };

            if outcomes.len() != records.len() {
                return Err(CommitError::OutcomeMismatch {
                    sent: records.len(),
                    returned: outcomes.len(),
                }
                .into());
            }

            let (mut committed, mut duplicates, mut rejected) = (0, 0, 0);
            for (record, outcome) in records.iter().zip(outcomes) {
                match outcome {
                    RecordOutcome::Committed => committed += 1,
                    RecordOutcome::Duplicate => duplicates += 1,
                    RecordOutcome::Rejected { reason } => {
                        rejected += 1;
                        warn!(key = record.key, table = record.table, reason = %reason, "sink rejected record; dropping");
                    }
                    RecordOutcome::Retry { reason } => {
                        debug!(key = record.key, reason = %reason, "record will be retried");
                        retry.push(record.unit.clone());
                    }
                }
            }

            report.records_committed += committed;
            report.duplicates += duplicates;
            report.rejected += rejected;
            {
                let mut counters = self.counters.lock();
                counters.committed += committed;
                counters.duplicates += duplicates;
                counters.rejected += rejected;
            }
        }

        if retry.is_empty() {
            debug!(path = %file.path().display(), records = units.len(), "file fully committed");
            file.remove()?;
            Ok(FileDisposition::Removed)
        } else {
            report.retried += retry.len() as u64;
            debug!(
                path = %file.path().display(),
                remaining = retry.len(),
                "file partially committed; keeping unacknowledged records"
            );
            file.rewrite(&retry)?;
            Ok(FileDisposition::Retained)
        }
    }

    /// Shrinks `file` to the records not yet settled by the sink when a batch
    /// is interrupted part-way through the file. A file with nothing settled
    /// is left untouched.
    fn keep_unsettled(file: &PendingFile, unsettled: &[DataUnit], total: usize) -> Result<()> {
        if unsettled.len() == total {
            return Ok(());
        }
        debug!(
            path = %file.path().display(),
            settled = total - unsettled.len(),
            remaining = unsettled.len(),
            "dropping settled records from interrupted file"
        );
        file.rewrite(unsettled)
    }

    /// Snapshot of the running counters.
    pub fn counters(&self) -> CommitCounters {
        *self.counters.lock()
    }

    /// Clears the running counters. Only called on explicit store reset.
    pub fn reset_counters(&self) {
        *self.counters.lock() = CommitCounters::default();
    }

    /// Explicit store reset: waits for any in-flight cycle, then deletes the
    /// pending files of `local` and clears the counters. Returns the number
    /// of files deleted.
    ///
    /// # Errors
    ///
    /// Returns the first deletion error.
    pub async fn reset(&self, local: &LocalStore) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        let removed = local.clear()?;
        self.reset_counters();
        info!(parent: &self.span, removed, "store reset");
        Ok(removed)
    }

    /// Asks the sink whether the session should restart.
    pub async fn test_sink_health(&self) -> bool {
        self.sink.test_health().instrument(self.span.clone()).await
    }
}
