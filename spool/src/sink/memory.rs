//! In-memory sink for tests, benchmarks and dry runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RecordOutcome, RemoteSink, SinkRecord};
use crate::datum::{DataKind, DataUnit};
use crate::error::SinkError;

#[derive(Debug, Default)]
struct MemoryState {
    /// table -> key -> unit
    tables: BTreeMap<String, BTreeMap<String, DataUnit>>,
    insert_calls: u64,
    records_received: u64,
    fail_every: Option<u64>,
    fail_every_batch: Option<u64>,
    unavailable: bool,
    misconfigured: Option<String>,
    rejected_kinds: BTreeSet<DataKind>,
    restart_recommended: bool,
    started: bool,
}

/// Sink that keeps committed records in memory, keyed by commit key.
///
/// Duplicate keys are reported as [`RecordOutcome::Duplicate`] and never
/// stored twice. Faults can be injected to exercise retry paths:
///
/// - [`MemorySink::fail_every`]: every n-th record received gets
///   [`RecordOutcome::Retry`]
/// - [`MemorySink::fail_every_batch`]: every n-th `insert_batch` call fails
///   with [`SinkError::Unavailable`]
/// - [`MemorySink::set_unavailable`]: whole batches fail with
///   [`SinkError::Unavailable`]
/// - [`MemorySink::reject_kind`]: records of a kind get
///   [`RecordOutcome::Rejected`]
/// - [`MemorySink::set_misconfigured`]: `start()` fails with
///   [`SinkError::Configuration`]
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    /// Creates an empty, healthy sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `n`-th received record fail transiently. `0` disables.
    pub fn fail_every(&self, n: u64) {
        self.state.lock().fail_every = (n > 0).then_some(n);
    }

    /// Makes every `n`-th `insert_batch` call fail as a whole. `0` disables.
    pub fn fail_every_batch(&self, n: u64) {
        self.state.lock().fail_every_batch = (n > 0).then_some(n);
    }

    /// Makes whole batches fail as if the network were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Permanently rejects records of `kind`.
    pub fn reject_kind(&self, kind: DataKind) {
        self.state.lock().rejected_kinds.insert(kind);
    }

    /// Makes `start()` fail with a configuration error.
    pub fn set_misconfigured(&self, reason: Option<String>) {
        self.state.lock().misconfigured = reason;
    }

    /// Sets the answer of `test_health()`.
    pub fn set_restart_recommended(&self, restart: bool) {
        self.state.lock().restart_recommended = restart;
    }

    /// Records stored across all tables.
    pub fn len(&self) -> usize {
        self.state.lock().tables.values().map(BTreeMap::len).sum()
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records stored in `table`.
    pub fn table_len(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Returns `true` if a record with `key` is stored in any table.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state
            .lock()
            .tables
            .values()
            .any(|table| table.contains_key(key))
    }

    /// Every stored key, across tables.
    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .tables
            .values()
            .flat_map(|table| table.keys().cloned())
            .collect()
    }

    /// Number of `insert_batch` calls, including failed ones.
    pub fn insert_calls(&self) -> u64 {
        self.state.lock().insert_calls
    }

    /// Records received, including duplicates and failures.
    pub fn records_received(&self) -> u64 {
        self.state.lock().records_received
    }

    /// Returns `true` between `start()` and `stop()`.
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }
}

#[async_trait]
impl RemoteSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn start(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.misconfigured {
            return Err(SinkError::Configuration {
                reason: reason.clone(),
            });
        }
        state.started = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), SinkError> {
        self.state.lock().started = false;
        Ok(())
    }

    async fn insert_batch(&self, records: &[SinkRecord<'_>]) -> Result<Vec<RecordOutcome>, SinkError> {
        let mut state = self.state.lock();
        state.insert_calls += 1;

        if state.unavailable {
            return Err(SinkError::Unavailable {
                reason: "memory sink marked unavailable".to_string(),
            });
        }
        if state
            .fail_every_batch
            .is_some_and(|n| state.insert_calls % n == 0)
        {
            return Err(SinkError::Unavailable {
                reason: "injected batch failure".to_string(),
            });
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            state.records_received += 1;

            if state
                .fail_every
                .is_some_and(|n| state.records_received % n == 0)
            {
                outcomes.push(RecordOutcome::Retry {
                    reason: "injected transient failure".to_string(),
                });
                continue;
            }

            if state.rejected_kinds.contains(record.unit.kind()) {
                outcomes.push(RecordOutcome::Rejected {
                    reason: format!("kind '{}' is not accepted", record.unit.kind()),
                });
                continue;
            }

            let table = state.tables.entry(record.table.to_string()).or_default();
            if table.contains_key(record.key) {
                outcomes.push(RecordOutcome::Duplicate);
            } else {
                table.insert(record.key.to_string(), record.unit.clone());
                outcomes.push(RecordOutcome::Committed);
            }
        }

        Ok(outcomes)
    }

    async fn test_health(&self) -> bool {
        self.state.lock().restart_recommended
    }
}
