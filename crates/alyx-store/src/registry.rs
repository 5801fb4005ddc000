use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use alyx_core::hash::schema_hash;
use alyx_core::types::{FieldType, Schema};
use alyx_rules::RuleSet;

use crate::error::StoreError;

/// One column of a compiled table plan.
#[derive(Debug, Clone)]
pub struct ColumnPlan {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub internal: bool,
}

/// Precompiled access artifacts for one collection.
///
/// Built once per schema load so the gateway never re-derives column
/// lists or SQL text per request.
#[derive(Debug, Clone)]
pub struct TablePlan {
    pub collection: String,
    pub primary: String,
    pub columns: Vec<ColumnPlan>,
    /// `SELECT <cols> FROM <table>`
    pub select_sql: String,
    /// `INSERT INTO <table> (<cols>) VALUES (?1, ...)`
    pub insert_sql: String,
}

impl TablePlan {
    fn build(collection: &alyx_core::types::Collection) -> Self {
        let columns: Vec<ColumnPlan> = collection
            .fields
            .iter()
            .map(|f| ColumnPlan {
                name: f.name.as_str().to_string(),
                field_type: f.field_type,
                nullable: f.nullable,
                internal: f.internal,
            })
            .collect();

        let name = collection.name.as_str();
        let column_list: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let placeholders: Vec<String> =
            (1..=column_list.len()).map(|i| format!("?{i}")).collect();

        let select_sql = format!("SELECT {} FROM \"{}\"", column_list.join(", "), name);
        let insert_sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            name,
            column_list.join(", "),
            placeholders.join(", ")
        );

        let primary = collection
            .primary_field()
            .map(|f| f.name.as_str().to_string())
            .unwrap_or_else(|| "id".to_string());

        Self {
            collection: name.to_string(),
            primary,
            columns,
            select_sql,
            insert_sql,
        }
    }

    /// Index of a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnPlan> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// An immutable compiled view of one schema version.
pub struct RegistrySnapshot {
    pub schema: Schema,
    pub hash: String,
    pub rules: Arc<RuleSet>,
    plans: HashMap<String, TablePlan>,
}

impl RegistrySnapshot {
    /// Compiles a validated schema into a snapshot. Rule compilation
    /// failures prevent the snapshot from existing at all.
    pub fn compile(schema: Schema) -> Result<Self, StoreError> {
        let rules = RuleSet::compile(&schema)
            .map_err(|failures| StoreError::RuleCompile { failures })?;
        let hash = schema_hash(&schema);
        let plans = schema
            .collections
            .iter()
            .map(|c| (c.name.as_str().to_string(), TablePlan::build(c)))
            .collect();
        Ok(Self {
            schema,
            hash,
            rules: Arc::new(rules),
            plans,
        })
    }

    /// The table plan for a collection.
    pub fn plan(&self, collection: &str) -> Result<&TablePlan, StoreError> {
        self.plans.get(collection).ok_or_else(|| StoreError::UnknownCollection {
            name: collection.to_string(),
        })
    }

    /// Collections that declare a reference to `target`, with the
    /// referring field. Used to walk `on_delete` edges.
    pub fn referrers(&self, target: &str) -> Vec<(&alyx_core::types::Collection, &alyx_core::types::FieldDefinition)> {
        self.schema
            .collections
            .iter()
            .flat_map(|c| {
                c.fields
                    .iter()
                    .filter(|f| {
                        f.references
                            .as_ref()
                            .is_some_and(|r| r.collection.as_str() == target)
                    })
                    .map(move |f| (c, f))
            })
            .collect()
    }
}

/// Atomically swappable schema registry.
///
/// Readers take a cheap snapshot pointer; the migrator swaps in a new
/// snapshot after its transaction commits. Readers never block and
/// always see one consistent schema version.
pub struct SchemaRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl SchemaRegistry {
    /// Creates a registry over an initial compiled snapshot.
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// An empty registry (no collections); the state before any schema
    /// has been loaded.
    pub fn empty() -> Self {
        let snapshot = RegistrySnapshot::compile(Schema::default())
            .expect("empty schema always compiles");
        Self::new(snapshot)
    }

    /// The current snapshot. Cheap; hold it for the whole request so
    /// every step sees the same schema version.
    pub fn load(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Atomically replaces the snapshot.
    pub fn swap(&self, next: RegistrySnapshot) {
        self.snapshot.store(Arc::new(next));
    }
}
