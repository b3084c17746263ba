//! Filesystem sink: one JSON object per record under a root directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{RecordOutcome, RemoteSink, SinkRecord};
use crate::error::SinkError;

/// Sink that stores each record as `{root}/{table}/{kind}@{id}.json`.
///
/// The file name is derived from the commit key, so re-sending a record
/// finds the existing object and reports [`RecordOutcome::Duplicate`].
/// Objects are written to a temporary name and renamed into place; a
/// half-written object is never visible under its final key.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// Creates a sink rooted at `root`. Nothing is touched until `start()`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the object stored for `key` in `table`.
    pub fn object_path(&self, table: &str, key: &str) -> PathBuf {
        self.root.join(table).join(format!("{}.json", key.replace(':', "@")))
    }

    async fn put(&self, record: &SinkRecord<'_>) -> std::io::Result<RecordOutcome> {
        let path = self.object_path(record.table, record.key);
        if tokio::fs::try_exists(&path).await? {
            return Ok(RecordOutcome::Duplicate);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_vec(record.unit).map_err(std::io::Error::other)?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, &body).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(RecordOutcome::Committed)
    }
}

#[async_trait]
impl RemoteSink for DirectorySink {
    fn name(&self) -> &str {
        "directory"
    }

    async fn start(&self) -> Result<(), SinkError> {
        if self.root.as_os_str().is_empty() {
            return Err(SinkError::Configuration {
                reason: "root directory is not set".to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => SinkError::Configuration {
                    reason: format!("cannot create '{}': {e}", self.root.display()),
                },
                _ => SinkError::Unavailable {
                    reason: format!("cannot create '{}': {e}", self.root.display()),
                },
            })?;

        debug!(root = %self.root.display(), "directory sink started");
        Ok(())
    }

    async fn insert_batch(&self, records: &[SinkRecord<'_>]) -> Result<Vec<RecordOutcome>, SinkError> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Err(SinkError::Unavailable {
                reason: format!("root '{}' is missing", self.root.display()),
            });
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let outcome = match self.put(record).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(key = record.key, table = record.table, error = %e, "failed to store object");
                    RecordOutcome::Retry {
                        reason: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn test_health(&self) -> bool {
        // A vanished root usually means an unmounted volume; a restart
        // re-runs `start()` which recreates it.
        !tokio::fs::try_exists(&self.root).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::{DataKind, DataUnit};
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_then_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("remote"));
        sink.start().await.unwrap();

        let unit = DataUnit::new("s", DataKind::new("location").unwrap(), json!({ "lat": 1.5 })).unwrap();
        let key = unit.commit_key();
        let record = SinkRecord {
            table: "locations",
            key: &key,
            unit: &unit,
        };

        assert_eq!(sink.insert_batch(&[record]).await.unwrap(), vec![RecordOutcome::Committed]);
        assert_eq!(sink.insert_batch(&[record]).await.unwrap(), vec![RecordOutcome::Duplicate]);

        let stored = std::fs::read(sink.object_path("locations", &key)).unwrap();
        let decoded: DataUnit = serde_json::from_slice(&stored).unwrap();
        assert_eq!(decoded.id(), unit.id());
    }

    #[tokio::test]
    async fn test_empty_root_is_configuration_error() {
        let sink = DirectorySink::new("");
        assert!(matches!(sink.start().await, Err(SinkError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_missing_root_recommends_restart() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("remote");
        let sink = DirectorySink::new(&root);
        sink.start().await.unwrap();
        assert!(!sink.test_health().await);

        std::fs::remove_dir_all(&root).unwrap();
        assert!(sink.test_health().await);
        assert!(matches!(
            sink.insert_batch(&[]).await,
            Err(SinkError::Unavailable { .. })
        ));
    }
}
