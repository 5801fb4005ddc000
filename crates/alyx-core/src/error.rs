use std::fmt;

/// Errors that occur when constructing or validating schema types.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaError {
    /// Collection name failed snake_case validation.
    InvalidCollectionName(String),
    /// Field name failed snake_case validation.
    InvalidFieldName(String),
    /// Identifier uses the reserved `_alyx_` prefix.
    ReservedName(String),
    /// Schema version must be >= 1.
    InvalidSchemaVersion(u32),
    /// A collection declared more than one primary field.
    MultiplePrimaryFields { collection: String },
    /// A non-primary field is neither nullable nor defaulted nor supplied at create.
    /// (Shape-level: default value incompatible with the declared type.)
    DefaultTypeMismatch {
        collection: String,
        field: String,
        field_type: String,
    },
    /// A reference points at a collection that does not exist.
    UnknownReferenceCollection {
        collection: String,
        field: String,
        target: String,
    },
    /// A reference points at a field that is not unique (or missing).
    ReferenceNotUnique {
        collection: String,
        field: String,
        target: String,
    },
    /// `on_delete = set-null` on a non-nullable referring field.
    SetNullOnNonNullable { collection: String, field: String },
    /// `on_delete = cascade` edges form a cycle.
    CascadeCycle { collections: Vec<String> },
    /// Duplicate field name within a collection.
    DuplicateFieldName { collection: String, field: String },
    /// Duplicate index name within a collection.
    DuplicateIndexName { collection: String, index: String },
    /// An index names a field the collection does not declare.
    UnknownIndexField {
        collection: String,
        index: String,
        field: String,
    },
    /// An index has an empty field list.
    EmptyIndexFields { collection: String, index: String },
    /// A `file` field names a bucket that does not exist.
    UnknownBucket { collection: String, field: String, bucket: String },
    /// Validation constraints are incompatible with the field type.
    ConstraintTypeMismatch {
        collection: String,
        field: String,
        constraint: String,
    },
    /// Validation constraint range is inverted (min > max).
    InvalidConstraintRange { field: String },
    /// `on_update` is only meaningful for timestamp fields.
    OnUpdateNotTimestamp { collection: String, field: String },
    /// The schema document could not be parsed.
    ParseFailed(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCollectionName(s) => {
                write!(
                    f,
                    "invalid collection name '{s}': must be snake_case [a-z][a-z0-9_]*"
                )
            }
            Self::InvalidFieldName(s) => {
                write!(
                    f,
                    "invalid field name '{s}': must be snake_case [a-z][a-z0-9_]*"
                )
            }
            Self::ReservedName(s) => {
                write!(f, "'{s}' uses the reserved '_alyx_' prefix")
            }
            Self::InvalidSchemaVersion(v) => {
                write!(f, "invalid schema version {v}: must be >= 1")
            }
            Self::MultiplePrimaryFields { collection } => {
                write!(f, "collection '{collection}' declares more than one primary field")
            }
            Self::DefaultTypeMismatch {
                collection,
                field,
                field_type,
            } => {
                write!(
                    f,
                    "default for '{collection}.{field}' is incompatible with type {field_type}"
                )
            }
            Self::UnknownReferenceCollection {
                collection,
                field,
                target,
            } => {
                write!(
                    f,
                    "'{collection}.{field}' references unknown collection '{target}'"
                )
            }
            Self::ReferenceNotUnique {
                collection,
                field,
                target,
            } => {
                write!(
                    f,
                    "'{collection}.{field}' references '{target}', which is not a unique field"
                )
            }
            Self::SetNullOnNonNullable { collection, field } => {
                write!(
                    f,
                    "'{collection}.{field}' uses on_delete=set-null but is not nullable"
                )
            }
            Self::CascadeCycle { collections } => {
                write!(f, "cascade deletion cycle: {}", collections.join(" -> "))
            }
            Self::DuplicateFieldName { collection, field } => {
                write!(f, "duplicate field '{field}' in collection '{collection}'")
            }
            Self::DuplicateIndexName { collection, index } => {
                write!(f, "duplicate index '{index}' in collection '{collection}'")
            }
            Self::UnknownIndexField {
                collection,
                index,
                field,
            } => {
                write!(
                    f,
                    "index '{index}' on '{collection}' names unknown field '{field}'"
                )
            }
            Self::EmptyIndexFields { collection, index } => {
                write!(f, "index '{index}' on '{collection}' has no fields")
            }
            Self::UnknownBucket {
                collection,
                field,
                bucket,
            } => {
                write!(
                    f,
                    "'{collection}.{field}' names unknown bucket '{bucket}'"
                )
            }
            Self::ConstraintTypeMismatch {
                collection,
                field,
                constraint,
            } => {
                write!(
                    f,
                    "constraint '{constraint}' on '{collection}.{field}' does not apply to its type"
                )
            }
            Self::InvalidConstraintRange { field } => {
                write!(f, "constraint range on '{field}' is inverted (min > max)")
            }
            Self::OnUpdateNotTimestamp { collection, field } => {
                write!(
                    f,
                    "'{collection}.{field}' sets on_update but is not a timestamp field"
                )
            }
            Self::ParseFailed(msg) => write!(f, "schema parse failed: {msg}"),
        }
    }
}

impl std::error::Error for SchemaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let cases = vec![
            (
                SchemaError::InvalidCollectionName("Tasks".into()),
                "invalid collection name 'Tasks'",
            ),
            (
                SchemaError::InvalidFieldName("Title".into()),
                "invalid field name 'Title'",
            ),
            (
                SchemaError::ReservedName("_alyx_users".into()),
                "'_alyx_users' uses the reserved",
            ),
            (
                SchemaError::MultiplePrimaryFields {
                    collection: "tasks".into(),
                },
                "more than one primary field",
            ),
            (
                SchemaError::SetNullOnNonNullable {
                    collection: "tasks".into(),
                    field: "owner".into(),
                },
                "on_delete=set-null",
            ),
            (
                SchemaError::CascadeCycle {
                    collections: vec!["a".into(), "b".into(), "a".into()],
                },
                "cascade deletion cycle: a -> b -> a",
            ),
        ];

        for (error, expected_fragment) in cases {
            let msg = error.to_string();
            assert!(
                msg.contains(expected_fragment),
                "'{msg}' should contain '{expected_fragment}'"
            );
        }
    }

    #[test]
    fn error_is_std_error() {
        let err: Box<dyn std::error::Error> =
            Box::new(SchemaError::InvalidFieldName("X".into()));
        assert!(err.to_string().contains("'X'"));
    }
}
