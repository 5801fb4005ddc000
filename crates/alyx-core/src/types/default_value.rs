use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::FieldType;
use crate::value::Value;

/// A field's declared default.
///
/// `auto` is only meaningful on uuid fields, `now` only on timestamps;
/// schema validation enforces both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum DefaultValue {
    /// A literal value of the field's type.
    Literal(serde_json::Value),
    /// Generate a fresh uuid (v4) at create time.
    Auto,
    /// Stamp the current UTC instant at create time.
    Now,
}

impl DefaultValue {
    /// Returns true if this default can legally appear on a field of `ty`.
    pub fn compatible_with(&self, ty: FieldType) -> bool {
        match self {
            Self::Auto => ty == FieldType::Uuid,
            Self::Now => ty == FieldType::Timestamp,
            Self::Literal(json) => Value::from_json(json, ty).is_some(),
        }
    }

    /// Materializes the default into a concrete value.
    ///
    /// `now` is the per-request instant so that every default in one
    /// request observes the same clock reading.
    pub fn materialize(&self, ty: FieldType, now: chrono::DateTime<chrono::Utc>) -> Option<Value> {
        match self {
            Self::Auto => Some(Value::Uuid(uuid::Uuid::new_v4())),
            Self::Now => Some(Value::Timestamp(now)),
            Self::Literal(json) => Value::from_json(json, ty),
        }
    }
}

impl fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Auto => write!(f, "auto"),
            Self::Now => write!(f, "now"),
        }
    }
}
