//! Configuration for a spool session.
//!
//! A [`SpoolConfig`] fixes where the local store lives, how its files are
//! compressed and rotated, how often and in what batch size pending files are
//! committed, how data kinds map to remote tables, and the thresholds the
//! health monitor uses. Configuration is validated up front; a session never
//! starts with values it cannot honour.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use spool::config::SpoolConfig;
//! use spool::compression::CompressionMode;
//! use spool::datum::DataKind;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpoolConfig::new("./spool_data")
//!     .with_compression(CompressionMode::Fast)
//!     .with_max_file_bytes(4 * 1024 * 1024)
//!     .with_write_delay(Duration::from_secs(600))
//!     .with_table(DataKind::new("location")?, "locations");
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::anonymize::Anonymizer;
use crate::compression::CompressionMode;
use crate::datum::DataKind;
use crate::error::{ConfigError, Result};
use crate::sink::TableRegistry;

/// Default rotation threshold: 1 MiB on disk.
const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Default minimum interval between automatic commit cycles.
const DEFAULT_WRITE_DELAY: Duration = Duration::from_secs(300);

/// Default bound on a single sink batch.
const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of records per sink batch.
const DEFAULT_BATCH_SIZE: usize = 500;

/// Configuration for a spool session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Directory holding the active file and pending files.
    pub directory: PathBuf,

    /// Compression applied to newly written files.
    pub compression: CompressionMode,

    /// Rotate the active file once this many bytes have reached disk.
    pub max_file_bytes: u64,

    /// Minimum interval between automatic commit cycles.
    pub write_delay: Duration,

    /// Upper bound on each sink batch before the cycle is aborted.
    pub commit_timeout: Duration,

    /// Records sent to the sink per `insert_batch` call.
    pub batch_size: usize,

    /// Remote table for each data kind.
    pub tables: BTreeMap<DataKind, String>,

    /// Table for kinds without an entry in `tables`. Without one, such
    /// records are rejected at commit time.
    pub default_table: Option<String>,

    /// Payload anonymization rules applied before persistence.
    pub anonymization: Anonymizer,

    /// Health monitor thresholds.
    pub health: HealthConfig,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./spool_data"),
            compression: CompressionMode::Fast,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            write_delay: DEFAULT_WRITE_DELAY,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            tables: BTreeMap::new(),
            default_table: None,
            anonymization: Anonymizer::default(),
            health: HealthConfig::default(),
        }
    }
}

impl SpoolConfig {
    /// Creates a config with defaults for everything but the directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be loaded, or a validation error from [`SpoolConfig::validate`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the compression mode.
    #[must_use]
    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the rotation threshold.
    #[must_use]
    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    /// Sets the minimum interval between automatic commit cycles.
    #[must_use]
    pub fn with_write_delay(mut self, write_delay: Duration) -> Self {
        self.write_delay = write_delay;
        self
    }

    /// Sets the per-batch commit timeout.
    #[must_use]
    pub fn with_commit_timeout(mut self, commit_timeout: Duration) -> Self {
        self.commit_timeout = commit_timeout;
        self
    }

    /// Sets the sink batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Routes `kind` to `table`.
    #[must_use]
    pub fn with_table(mut self, kind: DataKind, table: impl Into<String>) -> Self {
        self.tables.insert(kind, table.into());
        self
    }

    /// Sets the fallback table for unmapped kinds.
    #[must_use]
    pub fn with_default_table(mut self, table: impl Into<String>) -> Self {
        self.default_table = Some(table.into());
        self
    }

    /// Sets the anonymization rules.
    #[must_use]
    pub fn with_anonymizer(mut self, anonymizer: Anonymizer) -> Self {
        self.anonymization = anonymizer;
        self
    }

    /// Sets the health thresholds.
    #[must_use]
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Builds the kind-to-table lookup the coordinator resolves against.
    pub fn table_registry(&self) -> TableRegistry {
        let mut registry = TableRegistry::new();
        for (kind, table) in &self.tables {
            registry.register(kind.clone(), table.clone());
        }
        if let Some(table) = &self.default_table {
            registry.set_default(table.clone());
        }
        registry
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(invalid("directory", "must not be empty"));
        }

        if self.max_file_bytes == 0 {
            return Err(invalid("max_file_bytes", "must be > 0"));
        }

        if self.write_delay.is_zero() {
            return Err(invalid("write_delay", "must be > 0"));
        }

        if self.commit_timeout.is_zero() {
            return Err(invalid("commit_timeout", "must be > 0"));
        }

        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }

        for table in self.tables.values().chain(self.default_table.iter()) {
            validate_table_name(table)?;
        }

        self.health.validate()
    }
}

/// Thresholds for the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Commit success ratio (0.0..=1.0) below which a check counts as low.
    pub min_success_ratio: f64,

    /// Consecutive low checks before a restart is recommended.
    pub max_low_checks: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_success_ratio: 0.5,
            max_low_checks: 3,
        }
    }
}

impl HealthConfig {
    /// Validates the thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the ratio is outside
    /// `0.0..=1.0` or `max_low_checks` is zero.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_success_ratio) {
            return Err(invalid(
                "health.min_success_ratio",
                format!("{} is outside 0.0..=1.0", self.min_success_ratio),
            ));
        }

        if self.max_low_checks == 0 {
            return Err(invalid("health.max_low_checks", "must be > 0"));
        }

        Ok(())
    }
}

/// Table names end up in sink paths and keys, so they follow the same
/// character rules as data kinds.
fn validate_table_name(table: &str) -> Result<()> {
    DataKind::new(table).map(|_| ()).map_err(|_| {
        invalid(
            "tables",
            format!("table name {table:?} must be non-empty and use [A-Za-z0-9_.-]"),
        )
    })
}

fn invalid(field: &'static str, reason: impl Into<String>) -> crate::error::SpoolError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
    .into()
}
