use std::collections::BTreeMap;
use std::fmt;

use alyx_rules::CompileFailure;

/// Errors surfaced by the storage layer.
///
/// Database errors are classified here, at the gateway boundary:
/// constraint failures become typed variants, everything unclassified
/// becomes `Internal` and is logged with the original text.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// No document with that id (or no such collection row target).
    NotFound { collection: String, id: String },
    /// The named collection is not part of the active schema.
    UnknownCollection { name: String },
    /// Field-level validation failures, field name to constraint.
    ValidationFailed { fields: BTreeMap<String, String> },
    /// A unique column or index rejected the write.
    UniqueViolation { collection: String, detail: String },
    /// `on_delete = restrict` blocked a delete.
    ForeignKeyRestrict { collection: String, referrer: String },
    /// A policy rule denied the operation.
    AccessDenied { collection: String, operation: String },
    /// A mutation arrived without authentication.
    Unauthenticated,
    /// The optimistic schema-hash check failed during migration.
    SchemaDrift { expected: String, actual: String },
    /// One or more rules failed to compile at schema load.
    RuleCompile { failures: Vec<CompileFailure> },
    /// Schema structural validation failed.
    Schema(alyx_core::SchemaError),
    /// A deployment was rejected because unsafe changes need a
    /// migration file (and `force` was not set).
    UnsafeChanges { summary: String },
    /// A migration file on disk no longer matches its recorded checksum.
    ChecksumMismatch { version: u64, name: String },
    /// Rollback target does not exist.
    UnknownDeployment { version: String },
    /// Anything the classifier could not name.
    Internal { message: String },
}

impl StoreError {
    /// Classifies a rusqlite error into a typed store error.
    pub fn classify(collection: &str, err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(code, message) => match code.code {
                ErrorCode::ConstraintViolation => {
                    let detail = message.clone().unwrap_or_default();
                    if detail.contains("UNIQUE") {
                        Self::UniqueViolation {
                            collection: collection.to_string(),
                            detail,
                        }
                    } else if detail.contains("FOREIGN KEY") {
                        Self::ForeignKeyRestrict {
                            collection: collection.to_string(),
                            referrer: detail,
                        }
                    } else {
                        Self::Internal { message: detail }
                    }
                }
                _ => Self::Internal {
                    message: err.to_string(),
                },
            },
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound {
                collection: collection.to_string(),
                id: String::new(),
            },
            _ => Self::Internal {
                message: err.to_string(),
            },
        }
    }

    /// The wire error code, matching the API taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::UnknownCollection { .. } => "not_found",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::UniqueViolation { .. } => "conflict",
            Self::ForeignKeyRestrict { .. } => "foreign_key_restrict",
            Self::AccessDenied { .. } => "access_denied",
            Self::Unauthenticated => "unauthenticated",
            Self::SchemaDrift { .. } => "schema_drift",
            Self::RuleCompile { .. } => "invalid_rule_expression",
            Self::Schema(_) => "bad_request",
            Self::UnsafeChanges { .. } => "conflict",
            Self::ChecksumMismatch { .. } => "internal",
            Self::UnknownDeployment { .. } => "not_found",
            Self::Internal { .. } => "internal",
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { collection, id } => {
                if id.is_empty() {
                    write!(f, "not found in '{collection}'")
                } else {
                    write!(f, "'{id}' not found in '{collection}'")
                }
            }
            Self::UnknownCollection { name } => {
                write!(f, "unknown collection '{name}'")
            }
            Self::ValidationFailed { fields } => {
                write!(f, "validation failed: ")?;
                for (i, (field, constraint)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}: {constraint}")?;
                }
                Ok(())
            }
            Self::UniqueViolation { collection, detail } => {
                write!(f, "unique constraint violated on '{collection}': {detail}")
            }
            Self::ForeignKeyRestrict { collection, referrer } => {
                write!(
                    f,
                    "delete from '{collection}' restricted by referring rows: {referrer}"
                )
            }
            Self::AccessDenied { collection, operation } => {
                write!(f, "policy denied {operation} on '{collection}'")
            }
            Self::Unauthenticated => write!(f, "authentication required"),
            Self::SchemaDrift { expected, actual } => {
                write!(
                    f,
                    "schema drift: expected hash {expected}, found {actual}"
                )
            }
            Self::RuleCompile { failures } => {
                write!(f, "rule compilation failed: ")?;
                for (i, failure) in failures.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{failure}")?;
                }
                Ok(())
            }
            Self::Schema(err) => write!(f, "{err}"),
            Self::UnsafeChanges { summary } => {
                write!(f, "unsafe schema changes require a migration file:\n{summary}")
            }
            Self::ChecksumMismatch { version, name } => {
                write!(
                    f,
                    "migration v{version} '{name}' does not match its recorded checksum"
                )
            }
            Self::UnknownDeployment { version } => {
                write!(f, "deployment '{version}' not found")
            }
            Self::Internal { message } => write!(f, "internal storage error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Schema(err) => Some(err),
            _ => None,
        }
    }
}

impl From<alyx_core::SchemaError> for StoreError {
    fn from(err: alyx_core::SchemaError) -> Self {
        Self::Schema(err)
    }
}
