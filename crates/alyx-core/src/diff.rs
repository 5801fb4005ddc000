use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{
    Collection, CollectionName, DefaultValue, FieldDefinition, FieldName, FieldType,
    IndexDefinition, OnDelete, Reference, Schema, Validation,
};

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

/// Whether a schema change may be applied automatically.
///
/// Unsafe changes never execute without an explicit migration file;
/// a deployment containing any rejects unless forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Safety {
    Safe,
    Unsafe,
}

impl fmt::Display for Safety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Unsafe => write!(f, "unsafe"),
        }
    }
}

// ---------------------------------------------------------------------------
// SchemaChange
// ---------------------------------------------------------------------------

/// A single, ordered schema change produced by diffing two schemas.
///
/// Renames are deliberately absent: the differ cannot tell a rename
/// from a drop-and-add, so renames must arrive as explicit migration
/// files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change")]
#[non_exhaustive]
pub enum SchemaChange {
    AddCollection {
        collection: Collection,
    },
    DropCollection {
        name: CollectionName,
    },
    AddField {
        collection: CollectionName,
        field: FieldDefinition,
    },
    DropField {
        collection: CollectionName,
        field: FieldName,
    },
    /// Lossless type widening (`int -> float`, `string -> text`).
    WidenType {
        collection: CollectionName,
        field: FieldName,
        from: FieldType,
        to: FieldType,
    },
    /// Any other type change; requires an explicit migration.
    ChangeType {
        collection: CollectionName,
        field: FieldName,
        from: FieldType,
        to: FieldType,
    },
    MakeNullable {
        collection: CollectionName,
        field: FieldName,
    },
    MakeRequired {
        collection: CollectionName,
        field: FieldName,
    },
    SetDefault {
        collection: CollectionName,
        field: FieldName,
        default: DefaultValue,
    },
    RemoveDefault {
        collection: CollectionName,
        field: FieldName,
    },
    TightenValidation {
        collection: CollectionName,
        field: FieldName,
        validate: Validation,
    },
    LoosenValidation {
        collection: CollectionName,
        field: FieldName,
        validate: Validation,
    },
    AddIndex {
        collection: CollectionName,
        index: IndexDefinition,
    },
    DropIndex {
        collection: CollectionName,
        index: String,
    },
    ChangeOnDelete {
        collection: CollectionName,
        field: FieldName,
        from: Option<OnDelete>,
        to: Option<OnDelete>,
    },
    ChangeReference {
        collection: CollectionName,
        field: FieldName,
        from: Option<Reference>,
        to: Option<Reference>,
    },
}

impl SchemaChange {
    /// Classifies this change per the migration safety table.
    pub fn safety(&self) -> Safety {
        match self {
            Self::AddCollection { .. }
            | Self::WidenType { .. }
            | Self::MakeNullable { .. }
            | Self::SetDefault { .. }
            | Self::RemoveDefault { .. }
            | Self::LoosenValidation { .. } => Safety::Safe,

            // A new field is only safe when existing rows can be
            // populated without guessing.
            Self::AddField { field, .. } => {
                if field.nullable || field.default.is_some() {
                    Safety::Safe
                } else {
                    Safety::Unsafe
                }
            }

            // A unique index over existing data needs pre-verification.
            Self::AddIndex { index, .. } => {
                if index.unique {
                    Safety::Unsafe
                } else {
                    Safety::Safe
                }
            }

            Self::DropCollection { .. }
            | Self::DropField { .. }
            | Self::ChangeType { .. }
            | Self::MakeRequired { .. }
            | Self::TightenValidation { .. }
            | Self::DropIndex { .. }
            | Self::ChangeOnDelete { .. }
            | Self::ChangeReference { .. } => Safety::Unsafe,
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(f)
    }
}

impl SchemaChange {
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddCollection { collection } => {
                write!(
                    f,
                    "ADD collection '{}' ({} fields)",
                    collection.name,
                    collection.fields.len()
                )
            }
            Self::DropCollection { name } => write!(f, "DROP collection '{name}'"),
            Self::AddField { collection, field } => {
                write!(f, "ADD field '{}.{}'", collection, field.name)
            }
            Self::DropField { collection, field } => {
                write!(f, "DROP field '{collection}.{field}'")
            }
            Self::WidenType {
                collection,
                field,
                from,
                to,
            } => {
                write!(f, "WIDEN '{collection}.{field}' {from} -> {to}")
            }
            Self::ChangeType {
                collection,
                field,
                from,
                to,
            } => {
                write!(f, "CHANGE TYPE '{collection}.{field}' {from} -> {to}")
            }
            Self::MakeNullable { collection, field } => {
                write!(f, "MAKE NULLABLE '{collection}.{field}'")
            }
            Self::MakeRequired { collection, field } => {
                write!(f, "MAKE REQUIRED '{collection}.{field}'")
            }
            Self::SetDefault {
                collection,
                field,
                default,
            } => {
                write!(f, "SET DEFAULT '{collection}.{field}' = {default}")
            }
            Self::RemoveDefault { collection, field } => {
                write!(f, "REMOVE DEFAULT '{collection}.{field}'")
            }
            Self::TightenValidation { collection, field, .. } => {
                write!(f, "TIGHTEN VALIDATION '{collection}.{field}'")
            }
            Self::LoosenValidation { collection, field, .. } => {
                write!(f, "LOOSEN VALIDATION '{collection}.{field}'")
            }
            Self::AddIndex { collection, index } => {
                write!(f, "ADD INDEX '{}' on '{collection}'", index.name)
            }
            Self::DropIndex { collection, index } => {
                write!(f, "DROP INDEX '{index}' on '{collection}'")
            }
            Self::ChangeOnDelete {
                collection, field, ..
            } => {
                write!(f, "CHANGE ON DELETE '{collection}.{field}'")
            }
            Self::ChangeReference {
                collection, field, ..
            } => {
                write!(f, "CHANGE REFERENCE '{collection}.{field}'")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// An ordered set of changes from one schema to another.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<SchemaChange>,
}

impl ChangeSet {
    /// Returns true if the schemas were identical.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if every change is safe.
    pub fn is_safe(&self) -> bool {
        self.changes.iter().all(|c| c.safety() == Safety::Safe)
    }

    /// Only the safe changes, in order.
    pub fn safe_changes(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(|c| c.safety() == Safety::Safe)
    }

    /// Only the unsafe changes, in order.
    pub fn unsafe_changes(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(|c| c.safety() == Safety::Unsafe)
    }

    /// Applies the safe subset to `base`, producing the schema the
    /// migrator would leave behind. Re-diffing the result against the
    /// target yields exactly the unsafe remainder (diff soundness).
    pub fn apply_safe(&self, base: &Schema) -> Schema {
        let mut schema = base.clone();
        for change in self.safe_changes() {
            apply_change(&mut schema, change);
        }
        schema
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} change(s)", self.changes.len())?;
        for (i, change) in self.changes.iter().enumerate() {
            write!(f, "  {}. ", i + 1)?;
            change.describe(f)?;
            writeln!(f, " [{}]", change.safety())?;
        }
        Ok(())
    }
}

fn apply_change(schema: &mut Schema, change: &SchemaChange) {
    match change {
        SchemaChange::AddCollection { collection } => {
            schema.collections.push(collection.clone());
        }
        SchemaChange::AddField { collection, field } => {
            if let Some(c) = collection_mut(schema, collection) {
                c.fields.push(field.clone());
            }
        }
        SchemaChange::WidenType {
            collection,
            field,
            to,
            ..
        } => {
            if let Some(fd) = field_mut(schema, collection, field) {
                fd.field_type = *to;
            }
        }
        SchemaChange::MakeNullable { collection, field } => {
            if let Some(fd) = field_mut(schema, collection, field) {
                fd.nullable = true;
            }
        }
        SchemaChange::SetDefault {
            collection,
            field,
            default,
        } => {
            if let Some(fd) = field_mut(schema, collection, field) {
                fd.default = Some(default.clone());
            }
        }
        SchemaChange::RemoveDefault { collection, field } => {
            if let Some(fd) = field_mut(schema, collection, field) {
                fd.default = None;
            }
        }
        SchemaChange::LoosenValidation {
            collection,
            field,
            validate,
        } => {
            if let Some(fd) = field_mut(schema, collection, field) {
                fd.validate = validate.clone();
            }
        }
        SchemaChange::AddIndex { collection, index } => {
            if let Some(c) = collection_mut(schema, collection) {
                c.indexes.push(index.clone());
            }
        }
        // Unsafe changes are never applied here.
        _ => {}
    }
}

fn collection_mut<'a>(schema: &'a mut Schema, name: &CollectionName) -> Option<&'a mut Collection> {
    schema
        .collections
        .iter_mut()
        .find(|c| c.name == *name)
}

fn field_mut<'a>(
    schema: &'a mut Schema,
    collection: &CollectionName,
    field: &FieldName,
) -> Option<&'a mut FieldDefinition> {
    collection_mut(schema, collection)?
        .fields
        .iter_mut()
        .find(|f| f.name == *field)
}

// ---------------------------------------------------------------------------
// SchemaDiff
// ---------------------------------------------------------------------------

/// Pure function module for computing schema diffs.
pub struct SchemaDiff;

impl SchemaDiff {
    /// Compare two schemas and produce an ordered change set.
    ///
    /// This is a pure function: no I/O, no side effects. Both inputs
    /// are expected to have passed `Schema::validate`.
    pub fn diff(old: &Schema, new: &Schema) -> ChangeSet {
        let mut changes = Vec::new();

        for collection in &new.collections {
            match old.collection(collection.name.as_str()) {
                None => changes.push(SchemaChange::AddCollection {
                    collection: collection.clone(),
                }),
                Some(old_collection) => {
                    Self::diff_collection(old_collection, collection, &mut changes);
                }
            }
        }

        for collection in &old.collections {
            if new.collection(collection.name.as_str()).is_none() {
                changes.push(SchemaChange::DropCollection {
                    name: collection.name.clone(),
                });
            }
        }

        ChangeSet { changes }
    }

    fn diff_collection(old: &Collection, new: &Collection, changes: &mut Vec<SchemaChange>) {
        let name = &new.name;

        for field in &new.fields {
            match old.field(field.name.as_str()) {
                None => changes.push(SchemaChange::AddField {
                    collection: name.clone(),
                    field: field.clone(),
                }),
                Some(old_field) => {
                    Self::diff_field(name, old_field, field, changes);
                }
            }
        }

        for field in &old.fields {
            if new.field(field.name.as_str()).is_none() {
                changes.push(SchemaChange::DropField {
                    collection: name.clone(),
                    field: field.name.clone(),
                });
            }
        }

        Self::diff_indexes(name, old, new, changes);
    }

    fn diff_field(
        collection: &CollectionName,
        old: &FieldDefinition,
        new: &FieldDefinition,
        changes: &mut Vec<SchemaChange>,
    ) {
        let field = &new.name;

        if old.field_type != new.field_type {
            if new.field_type.widens_from(old.field_type) {
                changes.push(SchemaChange::WidenType {
                    collection: collection.clone(),
                    field: field.clone(),
                    from: old.field_type,
                    to: new.field_type,
                });
            } else {
                changes.push(SchemaChange::ChangeType {
                    collection: collection.clone(),
                    field: field.clone(),
                    from: old.field_type,
                    to: new.field_type,
                });
            }
        }

        if !old.nullable && new.nullable {
            changes.push(SchemaChange::MakeNullable {
                collection: collection.clone(),
                field: field.clone(),
            });
        } else if old.nullable && !new.nullable {
            changes.push(SchemaChange::MakeRequired {
                collection: collection.clone(),
                field: field.clone(),
            });
        }

        match (&old.default, &new.default) {
            (None, Some(default)) => changes.push(SchemaChange::SetDefault {
                collection: collection.clone(),
                field: field.clone(),
                default: default.clone(),
            }),
            (Some(_), None) => changes.push(SchemaChange::RemoveDefault {
                collection: collection.clone(),
                field: field.clone(),
            }),
            (Some(old_default), Some(default)) if old_default != default => {
                changes.push(SchemaChange::SetDefault {
                    collection: collection.clone(),
                    field: field.clone(),
                    default: default.clone(),
                });
            }
            _ => {}
        }

        if old.validate != new.validate {
            if new.validate.tightens(&old.validate) {
                changes.push(SchemaChange::TightenValidation {
                    collection: collection.clone(),
                    field: field.clone(),
                    validate: new.validate.clone(),
                });
            } else {
                changes.push(SchemaChange::LoosenValidation {
                    collection: collection.clone(),
                    field: field.clone(),
                    validate: new.validate.clone(),
                });
            }
        }

        if old.on_delete != new.on_delete {
            changes.push(SchemaChange::ChangeOnDelete {
                collection: collection.clone(),
                field: field.clone(),
                from: old.on_delete,
                to: new.on_delete,
            });
        }

        if old.references != new.references {
            changes.push(SchemaChange::ChangeReference {
                collection: collection.clone(),
                field: field.clone(),
                from: old.references.clone(),
                to: new.references.clone(),
            });
        }
    }

    fn diff_indexes(
        name: &CollectionName,
        old: &Collection,
        new: &Collection,
        changes: &mut Vec<SchemaChange>,
    ) {
        for index in &new.indexes {
            match old.indexes.iter().find(|i| i.name == index.name) {
                None => changes.push(SchemaChange::AddIndex {
                    collection: name.clone(),
                    index: index.clone(),
                }),
                Some(old_index) if old_index != index => {
                    // A redefinition is a drop plus an add.
                    changes.push(SchemaChange::DropIndex {
                        collection: name.clone(),
                        index: index.name.clone(),
                    });
                    changes.push(SchemaChange::AddIndex {
                        collection: name.clone(),
                        index: index.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        for index in &old.indexes {
            if !new.indexes.iter().any(|i| i.name == index.name) {
                changes.push(SchemaChange::DropIndex {
                    collection: name.clone(),
                    index: index.name.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldName, FieldType};

    fn field(name: &str, ty: FieldType) -> FieldDefinition {
        FieldDefinition::new(FieldName::new(name).unwrap(), ty)
    }

    fn schema(collections: Vec<Collection>) -> Schema {
        let mut s = Schema {
            collections,
            ..Schema::default()
        };
        s.validate().unwrap();
        s
    }

    fn collection(name: &str, fields: Vec<FieldDefinition>) -> Collection {
        Collection::new(CollectionName::new(name).unwrap(), fields)
    }

    #[test]
    fn identical_schemas_diff_empty() {
        let s = schema(vec![collection("tasks", vec![field("title", FieldType::String)])]);
        let changes = SchemaDiff::diff(&s, &s);
        assert!(changes.is_empty());
    }

    #[test]
    fn added_collection_is_safe() {
        let old = schema(vec![]);
        let new = schema(vec![collection("tasks", vec![field("title", FieldType::String)])]);
        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.changes[0].safety(), Safety::Safe);
        assert!(matches!(
            &changes.changes[0],
            SchemaChange::AddCollection { collection } if collection.name.as_str() == "tasks"
        ));
    }

    #[test]
    fn dropped_collection_is_unsafe() {
        let old = schema(vec![collection("tasks", vec![field("title", FieldType::String)])]);
        let new = schema(vec![]);
        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.changes[0].safety(), Safety::Unsafe);
    }

    #[test]
    fn added_field_with_default_is_safe() {
        let old = schema(vec![collection("tasks", vec![field("title", FieldType::String)])]);
        let mut priority = field("priority", FieldType::Int);
        priority.default = Some(DefaultValue::Literal(serde_json::json!(0)));
        let new = schema(vec![collection(
            "tasks",
            vec![field("title", FieldType::String), priority],
        )]);
        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.changes[0].safety(), Safety::Safe);
    }

    #[test]
    fn added_required_field_without_default_is_unsafe() {
        let old = schema(vec![collection("tasks", vec![field("title", FieldType::String)])]);
        let new = schema(vec![collection(
            "tasks",
            vec![field("title", FieldType::String), field("owner", FieldType::String)],
        )]);
        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.changes[0].safety(), Safety::Unsafe);
    }

    #[test]
    fn widen_int_to_float_is_safe() {
        let old = schema(vec![collection("stats", vec![field("score", FieldType::Int)])]);
        let new = schema(vec![collection("stats", vec![field("score", FieldType::Float)])]);
        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes.changes[0],
            SchemaChange::WidenType { from: FieldType::Int, to: FieldType::Float, .. }
        ));
        assert_eq!(changes.changes[0].safety(), Safety::Safe);
    }

    #[test]
    fn narrow_float_to_int_is_unsafe() {
        let old = schema(vec![collection("stats", vec![field("score", FieldType::Float)])]);
        let new = schema(vec![collection("stats", vec![field("score", FieldType::Int)])]);
        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes.changes[0], SchemaChange::ChangeType { .. }));
        assert_eq!(changes.changes[0].safety(), Safety::Unsafe);
    }

    #[test]
    fn tighten_validation_is_unsafe_loosen_is_safe() {
        let mut strict = field("title", FieldType::String);
        strict.validate.min_length = Some(1);
        let old = schema(vec![collection("tasks", vec![field("title", FieldType::String)])]);
        let new = schema(vec![collection("tasks", vec![strict.clone()])]);

        let tighten = SchemaDiff::diff(&old, &new);
        assert_eq!(tighten.len(), 1);
        assert_eq!(tighten.changes[0].safety(), Safety::Unsafe);

        let loosen = SchemaDiff::diff(&new, &old);
        assert_eq!(loosen.len(), 1);
        assert_eq!(loosen.changes[0].safety(), Safety::Safe);
    }

    #[test]
    fn unique_index_is_unsafe_plain_index_is_safe() {
        let old = schema(vec![collection("users", vec![field("email", FieldType::String)])]);

        let mut with_plain = collection("users", vec![field("email", FieldType::String)]);
        with_plain
            .indexes
            .push(IndexDefinition::new("idx_email", vec![FieldName::new("email").unwrap()]));
        let new = schema(vec![with_plain]);
        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.changes[0].safety(), Safety::Safe);

        let mut with_unique = collection("users", vec![field("email", FieldType::String)]);
        let mut idx = IndexDefinition::new("idx_email", vec![FieldName::new("email").unwrap()]);
        idx.unique = true;
        with_unique.indexes.push(idx);
        let new = schema(vec![with_unique]);
        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.changes[0].safety(), Safety::Unsafe);
    }

    #[test]
    fn on_delete_change_is_unsafe() {
        let users = collection("users", vec![]);
        let mut owner = field("user_id", FieldType::Uuid);
        owner.references = Some(Reference::parse("users.id").unwrap());
        owner.on_delete = Some(OnDelete::Restrict);
        let old = schema(vec![users.clone(), collection("posts", vec![owner.clone()])]);

        owner.on_delete = Some(OnDelete::Cascade);
        let new = schema(vec![users, collection("posts", vec![owner])]);

        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes.changes[0], SchemaChange::ChangeOnDelete { .. }));
        assert_eq!(changes.changes[0].safety(), Safety::Unsafe);
    }

    #[test]
    fn apply_safe_then_rediff_leaves_exactly_unsafe_set() {
        // Mixed change set: one safe add, one unsafe type change.
        let old = schema(vec![collection(
            "tasks",
            vec![field("title", FieldType::String), field("score", FieldType::Float)],
        )]);
        let mut priority = field("priority", FieldType::Int);
        priority.default = Some(DefaultValue::Literal(serde_json::json!(0)));
        let new = schema(vec![collection(
            "tasks",
            vec![
                field("title", FieldType::String),
                field("score", FieldType::Int),
                priority,
            ],
        )]);

        let changes = SchemaDiff::diff(&old, &new);
        assert_eq!(changes.len(), 2);

        let applied = changes.apply_safe(&old);
        let remainder = SchemaDiff::diff(&applied, &new);
        let expected: Vec<&SchemaChange> = changes.unsafe_changes().collect();
        let actual: Vec<&SchemaChange> = remainder.changes.iter().collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn changeset_display_lists_changes() {
        let old = schema(vec![]);
        let new = schema(vec![collection("tasks", vec![field("title", FieldType::String)])]);
        let changes = SchemaDiff::diff(&old, &new);
        let text = changes.to_string();
        assert!(text.contains("1 change(s)"));
        assert!(text.contains("ADD collection 'tasks'"));
        assert!(text.contains("[safe]"));
    }

    #[test]
    fn serde_roundtrip() {
        let old = schema(vec![collection("tasks", vec![field("title", FieldType::String)])]);
        let new = schema(vec![collection(
            "tasks",
            vec![field("title", FieldType::Text)],
        )]);
        let changes = SchemaDiff::diff(&old, &new);
        let json = serde_json::to_string(&changes).unwrap();
        let back: ChangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(changes, back);
    }
}
