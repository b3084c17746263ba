//! Payload anonymization applied before a data unit is persisted.
//!
//! Rules are configured per [`DataKind`] and per payload field. The local
//! store asks the [`Anonymizer`] for a persisted projection of each unit; the
//! producer's unit itself is left untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::datum::{DataKind, DataUnit};

/// How a single payload field is transformed before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum AnonymizationRule {
    /// Drop the field entirely.
    Omit,
    /// Replace the value with the SHA-256 hex digest of its JSON text.
    Hash,
    /// Round a numeric value to the given number of decimal places.
    /// Non-numeric values are left as they are.
    Round {
        /// Decimal places to keep.
        decimals: u32,
    },
}

impl AnonymizationRule {
    /// Applies the rule to one value. `None` means the field is dropped.
    fn apply(self, value: &Value) -> Option<Value> {
        match self {
            Self::Omit => None,
            Self::Hash => {
                let digest = Sha256::digest(value.to_string().as_bytes());
                Some(Value::String(format!("{digest:x}")))
            }
            Self::Round { decimals } => match value.as_f64() {
                Some(v) if !value.is_i64() && !value.is_u64() => {
                    let factor = 10f64.powi(i32::try_from(decimals).unwrap_or(i32::MAX));
                    let rounded = (v * factor).round() / factor;
                    Some(Number::from_f64(rounded).map_or(Value::Null, Value::Number))
                }
                _ => Some(value.clone()),
            },
        }
    }
}

/// Per-kind, per-field anonymization rules.
///
/// Serialized as `{ "<kind>": { "<field>": { "rule": "hash" } } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Anonymizer {
    rules: BTreeMap<DataKind, BTreeMap<String, AnonymizationRule>>,
}

impl Anonymizer {
    /// Creates an anonymizer with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for `field` on units of `kind`, replacing any previous one.
    #[must_use]
    pub fn with_rule(mut self, kind: DataKind, field: impl Into<String>, rule: AnonymizationRule) -> Self {
        self.rules.entry(kind).or_default().insert(field.into(), rule);
        self
    }

    /// Returns `true` if no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.values().all(BTreeMap::is_empty)
    }

    /// Returns the projection to persist for `unit`, or `None` when no rule
    /// touches any of its fields and the unit can be written as is.
    pub fn project(&self, unit: &DataUnit) -> Option<DataUnit> {
        let fields = self.rules.get(unit.kind())?;
        if !fields.keys().any(|field| unit.payload().contains_key(field)) {
            return None;
        }

        let mut payload = Map::with_capacity(unit.payload().len());
        for (field, value) in unit.payload() {
            match fields.get(field) {
                Some(rule) => {
                    if let Some(transformed) = rule.apply(value) {
                        payload.insert(field.clone(), transformed);
                    }
                }
                None => {
                    payload.insert(field.clone(), value.clone());
                }
            }
        }

        Some(unit.project(payload))
    }
}
