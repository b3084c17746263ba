//! # spool
//!
//! Durable local buffering with batched remote sync.
//!
//! spool is a Rust library for capturing records on a device that is often
//! offline. Producers append data units to a local, rotating, optionally
//! compressed file; a background coordinator commits closed files to a
//! remote sink in batches, deletes what the sink acknowledged, and keeps
//! everything else on disk for the next attempt. Nothing is lost to a crash
//! or a flaky network that was already written to local storage.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Concurrent producers share one bounded critical section per store
//! - Streaming zstd compression with a live on-disk size estimate
//! - Crash-safe: files left open by a killed process are recovered on start
//! - Idempotent commit keys, so retries after partial success never duplicate
//! - Per-record outcomes: only unacknowledged records are retried
//! - Health checks that turn a failing pipeline into a restart verdict
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spool::{DataKind, DataUnit, DirectorySink, Session, SpoolConfig};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpoolConfig::new("./spool_data")
//!     .with_table(DataKind::new("location")?, "locations")
//!     .with_default_table("events");
//! let sink = Arc::new(DirectorySink::new("./remote"));
//!
//! let session = Session::new(config, sink);
//! session.start().await?;
//!
//! let cancel = CancellationToken::new();
//! let unit = DataUnit::new(
//!     session.id(),
//!     DataKind::new("location")?,
//!     json!({ "lat": 38.03, "lon": -78.48 }),
//! )?;
//! session.write(&unit, &cancel)?;
//!
//! // Commit now instead of waiting for the write delay.
//! let report = session.commit_now(&cancel).await?;
//! assert_eq!(report.committed_count(), 1);
//!
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Session`] — Owns one local store, one coordinator and the commit task
//! - [`LocalStore`] — Rotating file writer producers append to
//! - [`RemoteStoreCoordinator`] — Commits pending files through a [`RemoteSink`]
//! - [`HealthMonitor`] — Success-ratio and liveness checks with restart verdicts
//!
//! ## Modules
//!
//! - [`datum`] — Data units, kinds and identifiers
//! - [`anonymize`] — Payload rules applied before persistence
//! - [`compression`] — Compression modes and the streaming encoder
//! - [`pending`] — Closed files awaiting commit and their reader
//! - [`local`] — The local store
//! - [`sink`] — Remote sink contract, table routing, provided sinks
//! - [`remote`] — The commit coordinator
//! - [`health`] — The health monitor
//! - [`session`] — Session lifecycle
//! - [`config`] — Configuration and validation
//! - [`error`] — Error types

pub mod anonymize;
pub mod compression;
pub mod config;
pub mod datum;
pub mod error;
pub mod health;
pub mod local;
pub mod pending;
pub mod remote;
pub mod session;
pub mod sink;

// Re-export primary API types at crate root for convenience.
pub use compression::CompressionMode;
pub use config::{HealthConfig, SpoolConfig};
pub use datum::{DataKind, DataUnit, DatumId};
pub use error::{Result, SpoolError};
pub use health::{HealthMonitor, HealthReport};
pub use local::LocalStore;
pub use remote::{CommitMode, CommitReport, CycleOutcome, RemoteStoreCoordinator};
pub use session::Session;
pub use sink::{DirectorySink, MemorySink, RecordOutcome, RemoteSink, SinkRecord, TableRegistry};
