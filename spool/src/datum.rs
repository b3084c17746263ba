//! Data units: the immutable records producers hand to the local store.
//!
//! A [`DataUnit`] carries a generated identifier, a UTC timestamp, the id of
//! the session that owns it, a [`DataKind`] discriminator, and a JSON object
//! of kind-specific payload fields. Units are never mutated once built;
//! deduplication (locally and at the remote sink) uses the identifier only.
//!
//! # Example
//!
//! ```rust
//! use spool::datum::{DataKind, DataUnit};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let kind = DataKind::new("location")?;
//! let unit = DataUnit::new("session-1", kind, json!({ "lat": 38.03, "lon": -78.48 }))?;
//!
//! assert_eq!(unit.kind().as_str(), "location");
//! assert!(unit.commit_key().starts_with("location:"));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ConfigError, Result};

/// Unique identifier assigned to a data unit at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatumId(Uuid);

impl DatumId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DatumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The kind a data unit declares about itself.
///
/// Kinds route records to per-kind remote tables through a
/// [`TableRegistry`](crate::sink::TableRegistry). A kind is a non-empty
/// string of ASCII letters, digits, `_`, `.` or `-`, so it is always safe to
/// embed in commit keys and file paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataKind(String);

impl DataKind {
    /// Creates a validated kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKind`] if the name is empty or contains
    /// characters outside `[A-Za-z0-9_.-]`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::check(&name)?;
        Ok(Self(name))
    }

    fn check(name: &str) -> std::result::Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::InvalidKind {
                kind: name.to_string(),
                reason: "kind must not be empty".to_string(),
            });
        }

        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(ConfigError::InvalidKind {
                kind: name.to_string(),
                reason: format!("character {bad:?} is not allowed"),
            });
        }

        Ok(())
    }

    /// Returns the kind name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DataKind {
    type Error = ConfigError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::check(&value)?;
        Ok(Self(value))
    }
}

impl From<DataKind> for String {
    fn from(kind: DataKind) -> Self {
        kind.0
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One immutable captured record.
///
/// Serialized as a single self-describing JSON object:
///
/// ```text
/// {"id":"…","timestamp":"2026-…Z","session_id":"…","kind":"location","payload":{…}}
/// ```
///
/// Equality and hashing consider only [`DataUnit::id`], matching how the
/// remote sink deduplicates by commit key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataUnit {
    id: DatumId,
    timestamp: DateTime<Utc>,
    session_id: String,
    kind: DataKind,
    payload: Map<String, Value>,
}

impl DataUnit {
    /// Creates a data unit stamped with a fresh id and the current time.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `payload` is not a JSON object.
    pub fn new(session_id: impl Into<String>, kind: DataKind, payload: Value) -> Result<Self> {
        Self::at(session_id, kind, payload, Utc::now())
    }

    /// Creates a data unit with an explicit capture timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `payload` is not a JSON object.
    pub fn at(
        session_id: impl Into<String>,
        kind: DataKind,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let Value::Object(payload) = payload else {
            return Err(ConfigError::InvalidValue {
                field: "payload",
                reason: "data unit payload must be a JSON object".to_string(),
            }
            .into());
        };

        Ok(Self {
            id: DatumId::generate(),
            timestamp,
            session_id: session_id.into(),
            kind,
            payload,
        })
    }

    /// Returns the unit's identifier.
    pub fn id(&self) -> DatumId {
        self.id
    }

    /// Returns the capture timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the owning session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns the unit's kind.
    pub fn kind(&self) -> &DataKind {
        &self.kind
    }

    /// Returns the kind-specific payload fields.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Idempotent key used by the remote sink: `"{kind}:{id}"`.
    pub fn commit_key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }

    /// Builds the persisted projection of this unit with a transformed
    /// payload. Identity, timestamp, session and kind are carried over.
    pub(crate) fn project(&self, payload: Map<String, Value>) -> Self {
        Self {
            id: self.id,
            timestamp: self.timestamp,
            session_id: self.session_id.clone(),
            kind: self.kind.clone(),
            payload,
        }
    }
}

impl PartialEq for DataUnit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DataUnit {}

impl Hash for DataUnit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
