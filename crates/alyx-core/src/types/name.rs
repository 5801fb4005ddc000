use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Identifiers the runtime turns into SQL: collection names become
/// table names, field names become column names. Both share one
/// grammar (`[a-z][a-z0-9_]*`) and one reserved namespace: anything
/// under `_alyx_` belongs to the runtime's own tables and columns.
const RESERVED_PREFIX: &str = "_alyx_";

/// The ways a candidate identifier can be unusable.
enum NameIssue {
    /// Leading underscore; the runtime keeps that namespace.
    Underscored,
    /// Anything else outside the snake_case grammar.
    Malformed,
}

/// Scans a candidate against the identifier grammar. `None` means the
/// name is usable as-is.
fn scan(raw: &str) -> Option<NameIssue> {
    let mut chars = raw.chars();
    match chars.next() {
        Some('a'..='z') => {}
        Some('_') => return Some(NameIssue::Underscored),
        _ => return Some(NameIssue::Malformed),
    }
    if chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_')) {
        None
    } else {
        Some(NameIssue::Malformed)
    }
}

/// A validated collection name.
///
/// Collections own top-level tables, so the whole underscore-leading
/// namespace is refused here, not just `_alyx_` itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

/// A validated field name.
///
/// Fields only need the `_alyx_` prefix fenced off; other underscore
/// starts fail the grammar anyway.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldName(String);

impl CollectionName {
    /// Validates and wraps a collection name.
    pub fn new(raw: impl Into<String>) -> Result<Self, SchemaError> {
        let raw = raw.into();
        match scan(&raw) {
            None => Ok(Self(raw)),
            Some(NameIssue::Underscored) => Err(SchemaError::ReservedName(raw)),
            Some(NameIssue::Malformed) => Err(SchemaError::InvalidCollectionName(raw)),
        }
    }

    /// The validated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FieldName {
    /// Validates and wraps a field name.
    pub fn new(raw: impl Into<String>) -> Result<Self, SchemaError> {
        let raw = raw.into();
        if raw.starts_with(RESERVED_PREFIX) {
            return Err(SchemaError::ReservedName(raw));
        }
        match scan(&raw) {
            None => Ok(Self(raw)),
            Some(_) => Err(SchemaError::InvalidFieldName(raw)),
        }
    }

    /// The validated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// The glue every name type needs: Display for SQL/error formatting,
// string conversions for serde's try_from/into round trip, AsRef for
// map lookups. Kept in one place so the two types cannot drift.
macro_rules! name_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$ty> for String {
            fn from(name: $ty) -> String {
                name.0
            }
        }

        impl TryFrom<String> for $ty {
            type Error = SchemaError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::new(raw)
            }
        }
    };
}

name_impls!(CollectionName);
name_impls!(FieldName);
