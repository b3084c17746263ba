//! Local store: the buffered, rotating file writer producers append to.
//!
//! The local store owns one directory. At most one file in it is open for
//! writing (the active file); every other store file is closed and waiting
//! for the remote store coordinator. All file-handle state lives behind a
//! single mutex, so concurrent producers never interleave partial records.
//!
//! # Design
//!
//! - Serialization and anonymization happen *before* the lock is taken; the
//!   critical section is one `write_all` of a complete line, plus a rotation
//!   when the size threshold is crossed.
//! - The size estimate is the number of bytes that have reached the file,
//!   read from a counting writer underneath the compressor. It never requires
//!   closing the stream and never decreases between rotations.
//! - Promotion finishes the stream (writing the zstd end-of-frame marker),
//!   fsyncs, renames `*.open` to its pending name, and opens the next
//!   generation.
//! - `start()` recovers `*.open` files left by a process that was killed,
//!   turning them into pending files. Their unreadable tail, if any, is
//!   dropped later by the reader.
//!
//! # Example
//!
//! ```rust,no_run
//! use spool::config::SpoolConfig;
//! use spool::datum::{DataKind, DataUnit};
//! use spool::local::LocalStore;
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalStore::new(&SpoolConfig::new("./spool_data"), "session-1");
//! store.start()?;
//!
//! let unit = DataUnit::new("session-1", DataKind::new("battery")?, json!({ "level": 0.8 }))?;
//! store.write(&unit)?;
//!
//! let pending = store.promote()?;
//! assert!(pending.is_some());
//! store.stop()?;
//! # Ok(())
//! # }
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{Span, debug, info, info_span, warn};

use crate::anonymize::Anonymizer;
use crate::compression::{CompressionMode, FileEncoder};
use crate::config::SpoolConfig;
use crate::datum::DataUnit;
use crate::error::{LocalError, Result};
use crate::pending::{FileState, PendingFile, list_store_files, open_name, pending_name};

/// Acknowledgement for an accepted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// Serialized (uncompressed) bytes appended for this unit.
    pub bytes: u64,
    /// The file closed by an automatic rotation triggered by this write.
    pub rotated: Option<PendingFile>,
}

/// Running totals for the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStats {
    /// Data units accepted since construction.
    pub records_written: u64,
    /// Serialized bytes accepted since construction.
    pub bytes_written: u64,
    /// Writes (or finalizations) that failed with an I/O error.
    pub write_failures: u64,
    /// Files moved into the pending set.
    pub promotions: u64,
    /// Records in the active file.
    pub active_records: u64,
    /// Bytes of the active file on disk.
    pub active_file_bytes: u64,
}

/// The file currently open for writes.
#[derive(Debug)]
struct ActiveFile {
    path: PathBuf,
    generation: u64,
    encoder: FileEncoder,
    records: u64,
    /// A write failed part-way; the next write rotates this file out.
    poisoned: bool,
}

/// State guarded by the store mutex.
#[derive(Debug)]
struct ActiveState {
    running: bool,
    next_generation: u64,
    active: Option<ActiveFile>,
}

/// Buffered, rotating file writer for one session.
///
/// # Thread Safety
///
/// All methods take `&self`; share the store behind an `Arc` and call
/// [`LocalStore::write`] from any number of producer threads.
#[derive(Debug)]
pub struct LocalStore {
    dir: PathBuf,
    mode: CompressionMode,
    max_file_bytes: u64,
    anonymizer: Anonymizer,
    span: Span,
    state: Mutex<ActiveState>,
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
    promotions: AtomicU64,
    latest: watch::Sender<Option<Arc<DataUnit>>>,
}

impl LocalStore {
    /// Creates a stopped store for `session_id` using the directory,
    /// compression, rotation threshold and anonymization rules in `config`.
    pub fn new(config: &SpoolConfig, session_id: &str) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            dir: config.directory.clone(),
            mode: config.compression,
            max_file_bytes: config.max_file_bytes,
            anonymizer: config.anonymization.clone(),
            span: info_span!("local_store", session = %session_id),
            state: Mutex::new(ActiveState {
                running: false,
                next_generation: 1,
                active: None,
            }),
            records_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            latest,
        }
    }

    /// The store directory.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Compression applied to new files.
    pub fn compression(&self) -> CompressionMode {
        self.mode
    }

    /// Opens the store: creates the directory, recovers files left open by
    /// a previous process, and opens a fresh active file. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::DirectoryAccess`] or [`LocalError::Open`] if the
    /// directory or the new active file cannot be created. The store stays
    /// stopped in that case.
    pub fn start(&self) -> Result<()> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        if state.running {
            return Ok(());
        }

        fs::create_dir_all(&self.dir).map_err(|e| LocalError::DirectoryAccess {
            path: self.dir.clone(),
            source: e,
        })?;

        let mut max_generation = 0;
        for (path, generation, mode, file_state) in list_store_files(&self.dir)? {
            max_generation = max_generation.max(generation);
            match file_state {
                FileState::Pending => {}
                FileState::Open => self.recover_open_file(&path, generation, mode),
                FileState::Temp => {
                    debug!(path = %path.display(), "discarding partial rewrite");
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "failed to remove partial rewrite");
                    }
                }
            }
        }

        state.next_generation = state.next_generation.max(max_generation + 1);
        let active = self.create_active(state.next_generation)?;
        state.next_generation += 1;
        state.active = Some(active);
        state.running = true;

        info!(
            directory = %self.dir.display(),
            compression = %self.mode,
            generation = state.next_generation - 1,
            "local store started"
        );
        Ok(())
    }

    /// Turns a file left open by a killed process into a pending file.
    fn recover_open_file(&self, path: &Path, generation: u64, mode: CompressionMode) {
        let empty = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false);
        let result = if empty {
            fs::remove_file(path)
        } else {
            fs::rename(path, self.dir.join(pending_name(generation, mode)))
        };

        match result {
            Ok(()) if empty => debug!(path = %path.display(), "removed empty file from previous run"),
            Ok(()) => warn!(
                path = %path.display(),
                generation,
                "recovered file left open by previous run; its tail may be incomplete"
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to recover open file"),
        }
    }

    /// Closes the store. The active file is promoted if it holds records and
    /// removed otherwise, so no file is left open. Pending files stay on disk
    /// for the next commit cycle.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::Promote`] if the active file cannot be renamed
    /// into the pending set. It will be recovered on the next start.
    pub fn stop(&self) -> Result<()> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        if !state.running {
            return Ok(());
        }
        state.running = false;

        let closed = match state.active.take() {
            Some(active) => self.close_active(active)?,
            None => None,
        };

        info!(promoted = closed.is_some(), "local store stopped");
        Ok(())
    }

    /// Returns `true` between a successful `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Appends one data unit to the active file.
    ///
    /// The unit is anonymized and serialized outside the lock; the lock is
    /// held only to append the complete line and, when the size threshold is
    /// reached, to rotate.
    ///
    /// # Errors
    ///
    /// - [`LocalError::NotRunning`] if the store is stopped
    /// - [`LocalError::Serialize`] if the unit cannot be serialized
    /// - [`LocalError::Open`] if a replacement active file cannot be created
    /// - [`LocalError::Write`] if the append fails; the store stays usable and
    ///   the damaged file is rotated out on the next write
    pub fn write(&self, unit: &DataUnit) -> Result<WriteAck> {
        let projected = self.anonymizer.project(unit);
        let persisted = projected.as_ref().unwrap_or(unit);
        let mut line = serde_json::to_vec(persisted).map_err(|e| LocalError::Serialize {
            id: unit.id().to_string(),
            source: e,
        })?;
        line.push(b'\n');
        let bytes = line.len() as u64;

        let rotated = {
            let _entered = self.span.enter();
            let mut state = self.state.lock();
            if !state.running {
                return Err(LocalError::NotRunning.into());
            }

            self.ensure_writable(&mut state)?;
            let Some(active) = state.active.as_mut() else {
                return Err(LocalError::NotRunning.into());
            };

            if let Err(e) = active.encoder.write_all(&line) {
                active.poisoned = true;
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %active.path.display(), error = %e, "write failed; file will be rotated");
                return Err(LocalError::Write {
                    path: active.path.clone(),
                    source: e,
                }
                .into());
            }
            active.records += 1;

            if active.encoder.bytes_on_disk() >= self.max_file_bytes {
                match self.promote_locked(&mut state) {
                    Ok(rotated) => rotated,
                    Err(e) => {
                        // The record itself is on disk; the file is recovered on restart.
                        warn!(error = %e, "automatic rotation failed");
                        None
                    }
                }
            } else {
                None
            }
        };

        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        if self.latest.receiver_count() > 0 {
            self.latest.send_replace(Some(Arc::new(unit.clone())));
        }

        Ok(WriteAck { bytes, rotated })
    }

    /// Bytes of the active file that have reached disk, without closing the
    /// stream. Non-decreasing between rotations; 0 when stopped.
    pub fn current_size_estimate(&self) -> u64 {
        self.state
            .lock()
            .active
            .as_ref()
            .map_or(0, |active| active.encoder.bytes_on_disk())
    }

    /// Closes the active file into the pending set and opens a new one.
    ///
    /// Returns `None` without rotating when the active file holds no
    /// records, or when the store is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::Promote`] if the file cannot be renamed.
    pub fn promote(&self) -> Result<Option<PendingFile>> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        if !state.running {
            return Ok(None);
        }
        self.promote_locked(&mut state)
    }

    /// Pending files, oldest generation first.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::DirectoryAccess`] if the directory cannot be read.
    pub fn pending_files(&self) -> Result<Vec<PendingFile>> {
        PendingFile::scan(&self.dir)
    }

    /// Deletes every pending file. Used for an explicit store reset; the
    /// active file is left alone.
    ///
    /// # Errors
    ///
    /// Returns the first deletion error; earlier files stay deleted.
    pub fn clear(&self) -> Result<usize> {
        let _entered = self.span.enter();
        // Hold the lock so no rotation adds a file mid-clear.
        let _state = self.state.lock();
        let files = PendingFile::scan(&self.dir)?;
        let count = files.len();
        for file in files {
            file.remove()?;
        }
        info!(removed = count, "cleared pending files");
        Ok(count)
    }

    /// Subscribes to the most recently written data unit.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<DataUnit>>> {
        self.latest.subscribe()
    }

    /// Snapshot of the store's counters.
    pub fn stats(&self) -> LocalStats {
        let (active_records, active_file_bytes) = self
            .state
            .lock()
            .active
            .as_ref()
            .map_or((0, 0), |a| (a.records, a.encoder.bytes_on_disk()));

        LocalStats {
            records_written: self.records_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            active_records,
            active_file_bytes,
        }
    }

    /// Makes sure a healthy active file exists, rotating out a poisoned one.
    fn ensure_writable(&self, state: &mut ActiveState) -> Result<()> {
        if state.active.as_ref().is_some_and(|a| a.poisoned) {
            if let Some(damaged) = state.active.take() {
                if let Err(e) = self.close_active(damaged) {
                    warn!(error = %e, "failed to retire damaged file; it will be recovered on restart");
                }
            }
        }

        if state.active.is_none() {
            let active = self.create_active(state.next_generation)?;
            state.next_generation += 1;
            state.active = Some(active);
        }

        Ok(())
    }

    fn promote_locked(&self, state: &mut ActiveState) -> Result<Option<PendingFile>> {
        let has_records = state
            .active
            .as_ref()
            .is_some_and(|a| a.records > 0 || a.poisoned);
        if !has_records {
            return Ok(None);
        }

        let closed = match state.active.take() {
            Some(active) => self.close_active(active)?,
            None => None,
        };

        match self.create_active(state.next_generation) {
            Ok(active) => {
                state.next_generation += 1;
                state.active = Some(active);
            }
            Err(e) => {
                // The next write retries the open.
                warn!(error = %e, "failed to open next active file");
            }
        }

        Ok(closed)
    }

    fn create_active(&self, generation: u64) -> Result<ActiveFile> {
        let path = self.dir.join(open_name(generation, self.mode));
        let open_err = |e| LocalError::Open {
            path: path.clone(),
            source: e,
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(open_err)?;
        let encoder = FileEncoder::new(file, self.mode).map_err(open_err)?;

        debug!(path = %path.display(), generation, "opened active file");
        Ok(ActiveFile {
            path,
            generation,
            encoder,
            records: 0,
            poisoned: false,
        })
    }

    /// Finishes the stream and moves the file into the pending set. A file
    /// with no records is deleted instead and `None` is returned.
    fn close_active(&self, active: ActiveFile) -> Result<Option<PendingFile>> {
        let ActiveFile {
            path,
            generation,
            encoder,
            records,
            poisoned,
        } = active;

        if let Err(e) = encoder.finish().and_then(|file| file.sync_all()) {
            // Whatever reached disk is still readable up to the damaged tail.
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(path = %path.display(), error = %e, "failed to finalize file");
        }

        if records == 0 {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove empty file");
            }
            return Ok(None);
        }

        let target = self.dir.join(pending_name(generation, self.mode));
        fs::rename(&path, &target).map_err(|e| LocalError::Promote {
            path: path.clone(),
            source: e,
        })?;
        self.promotions.fetch_add(1, Ordering::Relaxed);

        let pending = PendingFile::from_path(&target)?;
        debug!(
            path = %target.display(),
            records,
            bytes = pending.size_on_disk(),
            poisoned,
            "promoted file"
        );
        Ok(Some(pending))
    }
}
