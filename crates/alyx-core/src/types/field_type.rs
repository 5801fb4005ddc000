use std::fmt;

use serde::{Deserialize, Serialize};

/// The declared type of a collection field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum FieldType {
    Uuid,
    String,
    Text,
    Int,
    Float,
    Bool,
    Timestamp,
    Json,
    Blob,
    /// A file handle stored in a bucket; the bucket is named on the field.
    File,
}

impl FieldType {
    /// Returns true if a value of `from` can be widened losslessly into `self`.
    ///
    /// Widening is the only type change the migrator applies automatically:
    /// `int -> float`, and `string -> text`.
    pub fn widens_from(self, from: FieldType) -> bool {
        matches!(
            (from, self),
            (FieldType::Int, FieldType::Float) | (FieldType::String, FieldType::Text)
        )
    }

    /// The SQLite column type this field maps to.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Uuid | Self::String | Self::Text | Self::Timestamp | Self::File => "TEXT",
            Self::Int => "INTEGER",
            Self::Float => "REAL",
            Self::Bool => "INTEGER",
            Self::Json => "TEXT",
            Self::Blob => "BLOB",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uuid => "uuid",
            Self::String => "string",
            Self::Text => "text",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
            Self::Blob => "blob",
            Self::File => "file",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_are_wire_names() {
        assert_eq!(FieldType::Uuid.to_string(), "uuid");
        assert_eq!(FieldType::Timestamp.to_string(), "timestamp");
        assert_eq!(FieldType::Blob.to_string(), "blob");
    }

    #[test]
    fn serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&FieldType::Int).unwrap(), "\"int\"");
        let back: FieldType = serde_json::from_str("\"timestamp\"").unwrap();
        assert_eq!(back, FieldType::Timestamp);
    }

    #[test]
    fn widening_rules() {
        assert!(FieldType::Float.widens_from(FieldType::Int));
        assert!(FieldType::Text.widens_from(FieldType::String));
        assert!(!FieldType::Int.widens_from(FieldType::Float));
        assert!(!FieldType::String.widens_from(FieldType::Text));
        assert!(!FieldType::Json.widens_from(FieldType::Int));
    }

    #[test]
    fn sql_types() {
        assert_eq!(FieldType::Uuid.sql_type(), "TEXT");
        assert_eq!(FieldType::Int.sql_type(), "INTEGER");
        assert_eq!(FieldType::Float.sql_type(), "REAL");
        assert_eq!(FieldType::Blob.sql_type(), "BLOB");
    }
}
