//! Error types for the spool buffering pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all spool operations.
///
/// This enum covers every failure the pipeline reports, from configuration
/// validation through local writes to remote commits. None of these are
/// meant to abort the process: callers log them and keep the store in a
/// running or stopped state.
#[derive(Error, Debug)]
pub enum SpoolError {
    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error in the local store (write path, rotation, lifecycle).
    #[error("local store error: {0}")]
    Local(#[from] LocalError),

    /// Error reading or rewriting a pending file.
    #[error("pending file error: {0}")]
    Pending(#[from] PendingError),

    /// Error during a remote commit cycle.
    #[error("commit error: {0}")]
    Commit(#[from] CommitError),

    /// Error reported by the remote sink.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::SpoolConfig`].
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// Why the value is invalid.
        reason: String,
    },

    /// A data kind name is malformed.
    #[error("invalid data kind '{kind}': {reason}")]
    InvalidKind {
        /// The rejected kind.
        kind: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors from the local store.
#[derive(Error, Debug)]
pub enum LocalError {
    /// The store directory could not be created or listed.
    #[error("failed to access store directory '{}': {source}", path.display())]
    DirectoryAccess {
        /// The directory path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The active file could not be created.
    #[error("failed to open active file '{}': {source}", path.display())]
    Open {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Appending a record to the active file failed.
    #[error("failed to write to '{}': {source}", path.display())]
    Write {
        /// The active file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Finalizing or renaming the active file failed during promotion.
    #[error("failed to promote '{}': {source}", path.display())]
    Promote {
        /// The active file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A data unit could not be serialized.
    #[error("failed to serialize data unit {id}: {source}")]
    Serialize {
        /// The data unit id.
        id: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The store is not running; the write was rejected.
    #[error("local store is not running")]
    NotRunning,

    /// The producer cancelled the write before it was accepted.
    #[error("write cancelled by producer")]
    Cancelled,
}

/// Errors while reading, rewriting, or removing a pending file.
#[derive(Error, Debug)]
pub enum PendingError {
    /// The file name does not follow the pending-file naming scheme.
    #[error("unrecognized pending file name '{}'", path.display())]
    UnrecognizedName {
        /// The offending path.
        path: PathBuf,
    },

    /// The pending file could not be opened.
    #[error("failed to open pending file '{}': {source}", path.display())]
    Open {
        /// The pending file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Rewriting the unacknowledged subset failed.
    #[error("failed to rewrite pending file '{}': {source}", path.display())]
    Rewrite {
        /// The pending file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Deleting a fully committed file failed.
    #[error("failed to remove pending file '{}': {source}", path.display())]
    Remove {
        /// The pending file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort a commit cycle.
#[derive(Error, Debug)]
pub enum CommitError {
    /// A batch did not complete within the commit timeout.
    #[error("batch for '{}' timed out after {timeout:?}", path.display())]
    Timeout {
        /// The pending file being committed.
        path: PathBuf,
        /// The configured timeout.
        timeout: std::time::Duration,
    },

    /// The sink returned a different number of outcomes than records sent.
    #[error("sink returned {returned} outcomes for {sent} records")]
    OutcomeMismatch {
        /// Records sent in the batch.
        sent: usize,
        /// Outcomes returned by the sink.
        returned: usize,
    },

    /// The coordinator is not running.
    #[error("remote store coordinator is not running")]
    NotRunning,
}

/// Whole-batch and lifecycle failures reported by a remote sink.
///
/// Per-record failures are reported through
/// [`RecordOutcome`](crate::sink::RecordOutcome) instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink could not be reached; the batch should be retried later.
    #[error("sink unavailable: {reason}")]
    Unavailable {
        /// Description of the connectivity failure.
        reason: String,
    },

    /// Missing credentials, bucket, or similar; fatal to `start()`.
    #[error("sink misconfigured: {reason}")]
    Configuration {
        /// Description of what is missing.
        reason: String,
    },

    /// The sink answered with something the contract does not allow.
    #[error("sink protocol error: {reason}")]
    Protocol {
        /// Description of the violation.
        reason: String,
    },
}

impl SinkError {
    /// Returns `true` if retrying on a later cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Type alias for `Result<T, SpoolError>`.
pub type Result<T> = std::result::Result<T, SpoolError>;
