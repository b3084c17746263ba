//! Remote sink contract.
//!
//! A [`RemoteSink`] is the external backend that durably accepts committed
//! records. The pipeline is agnostic to transport; it only requires batch
//! insert with an explicit per-record duplicate signal, lifecycle hooks, and
//! a health probe.
//!
//! Records are routed to per-kind destinations through a [`TableRegistry`]:
//! each data unit declares its [`DataKind`], and the registry resolves the
//! table (or collection, or bucket prefix) it belongs in.
//!
//! Implementations:
//! - [`MemorySink`]: in-memory, with fault injection, for tests and benches
//! - [`DirectorySink`]: one JSON object per record under a local directory

mod fs;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::datum::{DataKind, DataUnit};
use crate::error::SinkError;

pub use fs::DirectorySink;
pub use memory::MemorySink;

/// One record handed to [`RemoteSink::insert_batch`].
#[derive(Debug, Clone, Copy)]
pub struct SinkRecord<'a> {
    /// Destination table resolved from the unit's kind.
    pub table: &'a str,
    /// Idempotent key (`"{kind}:{id}"`); re-sending the same key is a no-op.
    pub key: &'a str,
    /// The record itself.
    pub unit: &'a DataUnit,
}

/// Per-record result of a batch insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Newly stored.
    Committed,
    /// Already present under the same key; counts as committed.
    Duplicate,
    /// Permanently refused (malformed payload and the like). Not retried.
    Rejected {
        /// Why the sink refused the record.
        reason: String,
    },
    /// Transient per-record failure. Retried on a later cycle.
    Retry {
        /// Why the record was not stored.
        reason: String,
    },
}

impl RecordOutcome {
    /// Returns `true` if the record is durably at the sink.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Committed | Self::Duplicate)
    }
}

/// Backend that durably accepts committed records.
///
/// `insert_batch` must return exactly one outcome per input record, in input
/// order. Whole-batch failures (connectivity, credentials) are reported as a
/// [`SinkError`] instead.
#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Prepares the sink. A [`SinkError::Configuration`] here is fatal to the
    /// owning session's start.
    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Releases sink resources.
    async fn stop(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Stores a batch of records.
    async fn insert_batch(&self, records: &[SinkRecord<'_>]) -> Result<Vec<RecordOutcome>, SinkError>;

    /// Returns `true` if the sink recommends restarting the session.
    async fn test_health(&self) -> bool {
        false
    }
}

/// Resolves data kinds to remote tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRegistry {
    tables: BTreeMap<DataKind, String>,
    default: Option<String>,
}

impl TableRegistry {
    /// Creates an empty registry; every kind is unresolved.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `kind` to `table`, replacing any previous entry.
    pub fn register(&mut self, kind: DataKind, table: impl Into<String>) {
        self.tables.insert(kind, table.into());
    }

    /// Routes every unregistered kind to `table`.
    pub fn set_default(&mut self, table: impl Into<String>) {
        self.default = Some(table.into());
    }

    /// Destination table for `kind`, if any.
    pub fn resolve(&self, kind: &DataKind) -> Option<&str> {
        self.tables
            .get(kind)
            .or(self.default.as_ref())
            .map(String::as_str)
    }
}
