use alyx_core::diff::SchemaChange;
use alyx_core::types::{Collection, DefaultValue, FieldDefinition};
use alyx_core::value::Value;

/// Translates one safe schema change into SQLite DDL statements.
///
/// Unsafe changes have no translation here; they arrive as explicit
/// migration files. Type widening is a registry-level change only
/// (SQLite column affinity already accepts the wider values), so it
/// produces no DDL.
pub fn change_to_sql(change: &SchemaChange) -> Vec<String> {
    match change {
        SchemaChange::AddCollection { collection } => create_table(collection),
        SchemaChange::AddField { collection, field } => {
            vec![format!(
                "ALTER TABLE \"{}\" ADD COLUMN {}",
                collection,
                column_def(field)
            )]
        }
        SchemaChange::AddIndex { collection, index } => {
            let cols: Vec<String> = index
                .fields
                .iter()
                .map(|f| format!("\"{}\" {}", f, index.order))
                .collect();
            vec![format!(
                "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
                if index.unique { "UNIQUE " } else { "" },
                index.name,
                collection,
                cols.join(", ")
            )]
        }
        // Nullability, defaults, and validation are enforced by the
        // gateway, not by column constraints; loosening them needs no
        // DDL. Widening is affinity-compatible.
        SchemaChange::WidenType { .. }
        | SchemaChange::MakeNullable { .. }
        | SchemaChange::SetDefault { .. }
        | SchemaChange::RemoveDefault { .. }
        | SchemaChange::LoosenValidation { .. } => Vec::new(),
        // Unsafe: never translated automatically.
        _ => Vec::new(),
    }
}

/// Full CREATE TABLE plus per-field and declared indexes.
pub fn create_table(collection: &Collection) -> Vec<String> {
    let mut columns: Vec<String> = Vec::with_capacity(collection.fields.len());
    for field in &collection.fields {
        columns.push(column_def(field));
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        collection.name,
        columns.join(", ")
    )];

    for field in &collection.fields {
        if field.indexed && !field.primary && !field.unique {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{}_{}\" ON \"{}\" (\"{}\")",
                collection.name, field.name, collection.name, field.name
            ));
        }
    }

    for index in &collection.indexes {
        let cols: Vec<String> = index
            .fields
            .iter()
            .map(|f| format!("\"{}\" {}", f, index.order))
            .collect();
        statements.push(format!(
            "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
            if index.unique { "UNIQUE " } else { "" },
            index.name,
            collection.name,
            cols.join(", ")
        ));
    }

    statements
}

fn column_def(field: &FieldDefinition) -> String {
    let mut def = format!("\"{}\" {}", field.name, field.field_type.sql_type());
    if field.primary {
        def.push_str(" PRIMARY KEY");
    } else {
        if field.unique {
            def.push_str(" UNIQUE");
        }
        if !field.nullable {
            // Columns added to populated tables must carry a default
            // or the ALTER fails; the differ only marks those safe.
            def.push_str(" NOT NULL");
        }
    }
    if let Some(default) = &field.default {
        if let Some(literal) = default_literal(default, field) {
            def.push_str(&format!(" DEFAULT {literal}"));
        }
    }
    if let Some(reference) = &field.references {
        def.push_str(&format!(
            " REFERENCES \"{}\" (\"{}\")",
            reference.collection, reference.field
        ));
    }
    def
}

/// Renders a literal default for DDL. `auto` and `now` are generated
/// app-side per row; existing rows get backfilled by the migrator.
fn default_literal(default: &DefaultValue, field: &FieldDefinition) -> Option<String> {
    match default {
        DefaultValue::Literal(json) => {
            let value = Value::from_json(json, field.field_type)?;
            Some(match value {
                Value::Null => "NULL".to_string(),
                Value::Bool(b) => if b { "1" } else { "0" }.to_string(),
                Value::Int(i) => i.to_string(),
                Value::Float(v) => v.to_string(),
                Value::String(s) => quote(&s),
                Value::Timestamp(dt) => quote(&dt.to_rfc3339()),
                Value::Uuid(u) => quote(&u.to_string()),
                Value::Json(j) => quote(&j.to_string()),
                Value::Blob(_) => return None,
                _ => unreachable!("alyx_core::Value is non_exhaustive but all variants are handled"),
            })
        }
        DefaultValue::Auto | DefaultValue::Now => None,
        _ => unreachable!("DefaultValue is non_exhaustive but all variants are handled"),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alyx_core::types::{
        CollectionName, FieldName, FieldType, IndexDefinition, Reference, Schema,
    };

    fn validated(mut collection: Collection) -> Collection {
        let mut schema = Schema {
            collections: vec![collection.clone()],
            ..Schema::default()
        };
        schema.validate().unwrap();
        collection = schema.collections[0].clone();
        collection
    }

    fn field(name: &str, ty: FieldType) -> FieldDefinition {
        FieldDefinition::new(FieldName::new(name).unwrap(), ty)
    }

    #[test]
    fn create_table_shape() {
        let mut completed = field("completed", FieldType::Bool);
        completed.default = Some(DefaultValue::Literal(serde_json::json!(false)));
        let collection = validated(Collection::new(
            CollectionName::new("tasks").unwrap(),
            vec![field("title", FieldType::String), completed],
        ));
        let sql = create_table(&collection);
        assert_eq!(
            sql[0],
            "CREATE TABLE IF NOT EXISTS \"tasks\" (\"id\" TEXT PRIMARY KEY, \
             \"title\" TEXT NOT NULL, \"completed\" INTEGER NOT NULL DEFAULT 0)"
        );
    }

    #[test]
    fn nullable_column_has_no_not_null() {
        let mut note = field("note", FieldType::Text);
        note.nullable = true;
        let def = column_def(&note);
        assert_eq!(def, "\"note\" TEXT");
    }

    #[test]
    fn reference_rendered() {
        let mut owner = field("user_id", FieldType::Uuid);
        owner.references = Some(Reference::parse("users.id").unwrap());
        let def = column_def(&owner);
        assert!(def.ends_with("REFERENCES \"users\" (\"id\")"));
    }

    #[test]
    fn string_default_is_quoted_and_escaped() {
        let mut status = field("status", FieldType::String);
        status.default = Some(DefaultValue::Literal(serde_json::json!("it's new")));
        let def = column_def(&status);
        assert!(def.contains("DEFAULT 'it''s new'"));
    }

    #[test]
    fn auto_and_now_defaults_have_no_ddl_literal() {
        let mut created = field("created_at", FieldType::Timestamp);
        created.default = Some(DefaultValue::Now);
        assert!(!column_def(&created).contains("DEFAULT"));
    }

    #[test]
    fn add_index_sql() {
        let mut idx = IndexDefinition::new(
            "idx_tasks_title",
            vec![FieldName::new("title").unwrap()],
        );
        idx.unique = true;
        let change = SchemaChange::AddIndex {
            collection: CollectionName::new("tasks").unwrap(),
            index: idx,
        };
        let sql = change_to_sql(&change);
        assert_eq!(
            sql,
            vec![
                "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_tasks_title\" ON \"tasks\" (\"title\" ASC)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn widen_type_produces_no_ddl() {
        let change = SchemaChange::WidenType {
            collection: CollectionName::new("stats").unwrap(),
            field: FieldName::new("score").unwrap(),
            from: FieldType::Int,
            to: FieldType::Float,
        };
        assert!(change_to_sql(&change).is_empty());
    }

    #[test]
    fn unsafe_changes_produce_no_ddl() {
        let change = SchemaChange::DropCollection {
            name: CollectionName::new("tasks").unwrap(),
        };
        assert!(change_to_sql(&change).is_empty());
    }

    #[test]
    fn indexed_field_gets_secondary_index() {
        let mut channel = field("channel", FieldType::String);
        channel.indexed = true;
        let collection = validated(Collection::new(
            CollectionName::new("messages").unwrap(),
            vec![channel],
        ));
        let sql = create_table(&collection);
        assert!(sql
            .iter()
            .any(|s| s.contains("CREATE INDEX IF NOT EXISTS \"idx_messages_channel\"")));
    }
}
