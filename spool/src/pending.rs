//! Pending files: closed local files awaiting remote commit.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── 000000000003.fast.jsonl        <- pending, generation 3, zstd level 1
//! ├── 000000000004.fast.jsonl        <- pending, generation 4
//! ├── 000000000005.fast.jsonl.open   <- active file (at most one per store)
//! └── 000000000002.plain.jsonl.tmp   <- partial rewrite, discarded on start
//! ```
//!
//! The generation orders files oldest first; the tag records the compression
//! mode the file was written with, so a mode change between runs does not
//! strand older files.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::compression::{CompressionMode, FileEncoder, open_decoder};
use crate::datum::DataUnit;
use crate::error::{LocalError, PendingError, Result};

/// Extension shared by every store file.
const EXTENSION: &str = "jsonl";

/// Suffix marking the active file.
const OPEN_SUFFIX: &str = "open";

/// Suffix marking an in-progress rewrite.
const TEMP_SUFFIX: &str = "tmp";

/// Lifecycle state encoded in a store file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileState {
    /// Closed and awaiting commit.
    Pending,
    /// Open for writes (or left open by a killed process).
    Open,
    /// Partial rewrite of a pending file.
    Temp,
}

/// Name of a closed file for `generation` written with `mode`.
pub(crate) fn pending_name(generation: u64, mode: CompressionMode) -> String {
    format!("{generation:012}.{}.{EXTENSION}", mode.tag())
}

/// Name of the active file for `generation` written with `mode`.
pub(crate) fn open_name(generation: u64, mode: CompressionMode) -> String {
    format!("{}.{OPEN_SUFFIX}", pending_name(generation, mode))
}

/// Parses a store file name into its generation, mode and state.
///
/// Returns `None` for anything that is not a store file.
pub(crate) fn parse_name(name: &str) -> Option<(u64, CompressionMode, FileState)> {
    let mut parts = name.split('.');
    let generation = parts.next()?.parse::<u64>().ok()?;
    let mode = CompressionMode::from_tag(parts.next()?)?;
    if parts.next()? != EXTENSION {
        return None;
    }

    let state = match parts.next() {
        None => FileState::Pending,
        Some(OPEN_SUFFIX) => FileState::Open,
        Some(TEMP_SUFFIX) => FileState::Temp,
        Some(_) => return None,
    };

    if parts.next().is_some() {
        return None;
    }

    Some((generation, mode, state))
}

/// Lists every store file in `dir` with its parsed name, in no particular order.
pub(crate) fn list_store_files(dir: &Path) -> Result<Vec<(PathBuf, u64, CompressionMode, FileState)>> {
    let entries = fs::read_dir(dir).map_err(|e| LocalError::DirectoryAccess {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LocalError::DirectoryAccess {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some((generation, mode, state)) = parse_name(name) {
            files.push((path, generation, mode, state));
        }
    }

    Ok(files)
}

/// Result of reading a pending file.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Records in write order, up to the first unreadable one.
    pub units: Vec<DataUnit>,
    /// Why reading stopped early, if it did. Everything after that point is
    /// treated as lost.
    pub truncated: Option<String>,
}

/// A closed, fully written store file awaiting commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    path: PathBuf,
    generation: u64,
    mode: CompressionMode,
}

impl PendingFile {
    /// Builds a handle from a pending file path.
    ///
    /// # Errors
    ///
    /// Returns [`PendingError::UnrecognizedName`] if the name is not a
    /// pending file name (including active and temporary files).
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let parsed = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_name);

        match parsed {
            Some((generation, mode, FileState::Pending)) => Ok(Self {
                path,
                generation,
                mode,
            }),
            _ => Err(PendingError::UnrecognizedName { path }.into()),
        }
    }

    /// Lists pending files in `dir`, oldest generation first.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::DirectoryAccess`] if the directory cannot be read.
    pub fn scan<P: AsRef<Path>>(dir: P) -> Result<Vec<Self>> {
        let mut pending: Vec<Self> = list_store_files(dir.as_ref())?
            .into_iter()
            .filter(|(_, _, _, state)| *state == FileState::Pending)
            .map(|(path, generation, mode, _)| Self {
                path,
                generation,
                mode,
            })
            .collect();

        pending.sort_by_key(|file| file.generation);
        Ok(pending)
    }

    /// Path of the file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rotation generation; lower is older.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Compression mode the file was written with.
    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    /// Size of the file on disk in bytes, or 0 if it cannot be read.
    pub fn size_on_disk(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Reads the records back in write order.
    ///
    /// Reading stops at the first record that cannot be recovered: an
    /// incomplete final line, a line that is not a valid data unit, or a
    /// decoder error from a truncated compressed stream. The readable prefix
    /// is returned along with the reason.
    ///
    /// # Errors
    ///
    /// Returns [`PendingError::Open`] only if the file cannot be opened at all.
    pub fn read_units(&self) -> Result<ReadOutcome> {
        let file = File::open(&self.path).map_err(|e| PendingError::Open {
            path: self.path.clone(),
            source: e,
        })?;
        let decoder = open_decoder(self.mode, file).map_err(|e| PendingError::Open {
            path: self.path.clone(),
            source: e,
        })?;

        let mut reader = BufReader::new(decoder);
        let mut outcome = ReadOutcome::default();
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) if line.last() != Some(&b'\n') => {
                    outcome.truncated = Some(format!(
                        "incomplete record after {} units",
                        outcome.units.len()
                    ));
                    break;
                }
                Ok(_) => {
                    let body = &line[..line.len() - 1];
                    if body.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<DataUnit>(body) {
                        Ok(unit) => outcome.units.push(unit),
                        Err(e) => {
                            outcome.truncated = Some(format!(
                                "unreadable record after {} units: {e}",
                                outcome.units.len()
                            ));
                            break;
                        }
                    }
                }
                Err(e) => {
                    outcome.truncated = Some(format!(
                        "stream error after {} units: {e}",
                        outcome.units.len()
                    ));
                    break;
                }
            }
        }

        if let Some(reason) = &outcome.truncated {
            warn!(
                path = %self.path.display(),
                recovered = outcome.units.len(),
                reason = %reason,
                "pending file has an unreadable tail; remaining data is lost"
            );
        }

        Ok(outcome)
    }

    /// Atomically replaces the file's contents with `units`, keeping its
    /// generation and compression mode.
    ///
    /// # Errors
    ///
    /// Returns [`PendingError::Rewrite`] if the replacement cannot be written
    /// or renamed into place. The original file is untouched in that case.
    pub fn rewrite(&self, units: &[DataUnit]) -> Result<()> {
        let temp_path = self.path.with_file_name(format!(
            "{}.{TEMP_SUFFIX}",
            pending_name(self.generation, self.mode)
        ));
        let rewrite_err = |e| PendingError::Rewrite {
            path: self.path.clone(),
            source: e,
        };

        let file = File::create(&temp_path).map_err(rewrite_err)?;
        let mut encoder = FileEncoder::new(file, self.mode).map_err(rewrite_err)?;
        for unit in units {
            let mut line = serde_json::to_vec(unit).map_err(|e| LocalError::Serialize {
                id: unit.id().to_string(),
                source: e,
            })?;
            line.push(b'\n');
            encoder.write_all(&line).map_err(rewrite_err)?;
        }
        encoder
            .finish()
            .and_then(|file| file.sync_all())
            .map_err(rewrite_err)?;

        fs::rename(&temp_path, &self.path).map_err(rewrite_err)?;
        Ok(())
    }

    /// Deletes the file after its records were fully acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`PendingError::Remove`] if the file cannot be deleted.
    pub fn remove(self) -> Result<()> {
        fs::remove_file(&self.path).map_err(|e| PendingError::Remove {
            path: self.path,
            source: e,
        })?;
        Ok(())
    }
}
