use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

use super::bucket::Bucket;
use super::field_definition::{FieldDefinition, OnDelete};
use super::field_type::FieldType;
use super::index_definition::IndexDefinition;
use super::name::CollectionName;
use super::rules::Rules;

/// A typed table of documents with a declared shape and per-operation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: CollectionName,
    /// Declaration order is preserved; it is the column order.
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default, skip_serializing_if = "Rules::is_empty")]
    pub rules: Rules,
}

impl Collection {
    /// Creates a collection with the given fields and no indexes or rules.
    pub fn new(name: CollectionName, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name,
            fields,
            indexes: Vec::new(),
            rules: Rules::default(),
        }
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name.as_str() == name)
    }

    /// The primary field. Guaranteed present after `Schema::validate`.
    pub fn primary_field(&self) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.primary)
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// The versioned schema document: ordered collections plus buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<Collection>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub buckets: IndexMap<String, Bucket>,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            version: 1,
            collections: Vec::new(),
            buckets: IndexMap::new(),
        }
    }
}

fn default_version() -> u32 {
    1
}

impl Schema {
    /// Parses a schema document from YAML text.
    ///
    /// Parsing alone does not make a schema usable; call [`Schema::validate`].
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        serde_yaml::from_str(text).map_err(|e| SchemaError::ParseFailed(e.to_string()))
    }

    /// Serializes back to YAML. `parse(serialize(s)) == s` (field order canonical).
    pub fn serialize(&self) -> String {
        serde_yaml::to_string(self).expect("schema serializes")
    }

    /// Looks up a collection by name.
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.name.as_str() == name)
    }

    /// Looks up a bucket by name.
    pub fn bucket(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    /// Validates the whole document and normalizes it:
    ///
    /// - synthesizes the `id` primary where a collection omits one
    /// - exactly one primary per collection
    /// - duplicate field/index detection
    /// - default/type compatibility, `on_update` on timestamps only
    /// - references resolve to a unique field of an existing collection
    /// - `set-null` requires a nullable referrer
    /// - the `cascade` edge graph is acyclic
    /// - `file` fields name a declared bucket
    ///
    /// Rule compilation is the policy engine's concern; callers compile
    /// after structural validation succeeds.
    pub fn validate(&mut self) -> Result<(), SchemaError> {
        if self.version == 0 {
            return Err(SchemaError::InvalidSchemaVersion(self.version));
        }

        for collection in &mut self.collections {
            normalize_collection(collection)?;
        }

        // Cross-collection checks need the normalized shape.
        let snapshot = self.clone();
        for collection in &self.collections {
            check_references(collection, &snapshot)?;
            check_buckets(collection, &snapshot)?;
        }
        check_cascade_cycles(&snapshot)?;

        Ok(())
    }
}

fn normalize_collection(collection: &mut Collection) -> Result<(), SchemaError> {
    let mut seen = std::collections::HashSet::new();
    for field in &collection.fields {
        if !seen.insert(field.name.as_str().to_string()) {
            return Err(SchemaError::DuplicateFieldName {
                collection: collection.name.as_str().to_string(),
                field: field.name.as_str().to_string(),
            });
        }
    }

    let primaries = collection.fields.iter().filter(|f| f.primary).count();
    match primaries {
        0 => {
            if collection.field("id").is_some() {
                return Err(SchemaError::DuplicateFieldName {
                    collection: collection.name.as_str().to_string(),
                    field: "id".to_string(),
                });
            }
            collection
                .fields
                .insert(0, FieldDefinition::synthetic_primary());
        }
        1 => {}
        _ => {
            return Err(SchemaError::MultiplePrimaryFields {
                collection: collection.name.as_str().to_string(),
            })
        }
    }

    for field in &collection.fields {
        if let Some(default) = &field.default {
            if !default.compatible_with(field.field_type) {
                return Err(SchemaError::DefaultTypeMismatch {
                    collection: collection.name.as_str().to_string(),
                    field: field.name.as_str().to_string(),
                    field_type: field.field_type.to_string(),
                });
            }
        }
        if field.on_update && field.field_type != FieldType::Timestamp {
            return Err(SchemaError::OnUpdateNotTimestamp {
                collection: collection.name.as_str().to_string(),
                field: field.name.as_str().to_string(),
            });
        }
        if let (Some(min), Some(max)) = (field.validate.min, field.validate.max) {
            if min > max {
                return Err(SchemaError::InvalidConstraintRange {
                    field: field.name.as_str().to_string(),
                });
            }
        }
        if let (Some(min), Some(max)) = (field.validate.min_length, field.validate.max_length) {
            if min > max {
                return Err(SchemaError::InvalidConstraintRange {
                    field: field.name.as_str().to_string(),
                });
            }
        }
    }

    let mut seen_indexes = std::collections::HashSet::new();
    for index in &collection.indexes {
        if !seen_indexes.insert(index.name.clone()) {
            return Err(SchemaError::DuplicateIndexName {
                collection: collection.name.as_str().to_string(),
                index: index.name.clone(),
            });
        }
        if index.fields.is_empty() {
            return Err(SchemaError::EmptyIndexFields {
                collection: collection.name.as_str().to_string(),
                index: index.name.clone(),
            });
        }
        for field in &index.fields {
            if collection.field(field.as_str()).is_none() {
                return Err(SchemaError::UnknownIndexField {
                    collection: collection.name.as_str().to_string(),
                    index: index.name.clone(),
                    field: field.as_str().to_string(),
                });
            }
        }
    }

    Ok(())
}

fn check_references(collection: &Collection, schema: &Schema) -> Result<(), SchemaError> {
    for field in &collection.fields {
        let Some(reference) = &field.references else {
            continue;
        };
        let target = schema
            .collection(reference.collection.as_str())
            .ok_or_else(|| SchemaError::UnknownReferenceCollection {
                collection: collection.name.as_str().to_string(),
                field: field.name.as_str().to_string(),
                target: reference.collection.as_str().to_string(),
            })?;
        let target_field = target.field(reference.field.as_str());
        let unique = target_field.is_some_and(|f| f.primary || f.unique);
        if !unique {
            return Err(SchemaError::ReferenceNotUnique {
                collection: collection.name.as_str().to_string(),
                field: field.name.as_str().to_string(),
                target: reference.to_string(),
            });
        }
        if field.on_delete == Some(OnDelete::SetNull) && !field.nullable {
            return Err(SchemaError::SetNullOnNonNullable {
                collection: collection.name.as_str().to_string(),
                field: field.name.as_str().to_string(),
            });
        }
    }
    Ok(())
}

fn check_buckets(collection: &Collection, schema: &Schema) -> Result<(), SchemaError> {
    for field in &collection.fields {
        if field.field_type != FieldType::File {
            continue;
        }
        let bucket = field.bucket.as_deref().unwrap_or("");
        if schema.bucket(bucket).is_none() {
            return Err(SchemaError::UnknownBucket {
                collection: collection.name.as_str().to_string(),
                field: field.name.as_str().to_string(),
                bucket: bucket.to_string(),
            });
        }
    }
    Ok(())
}

/// DFS over `cascade` edges; any back edge is a deletion cycle.
fn check_cascade_cycles(schema: &Schema) -> Result<(), SchemaError> {
    // Edge: referenced collection -> referring collection (the direction
    // a delete propagates).
    let mut edges: std::collections::HashMap<&str, Vec<&str>> = std::collections::HashMap::new();
    for collection in &schema.collections {
        for field in &collection.fields {
            if field.on_delete == Some(OnDelete::Cascade) {
                if let Some(reference) = &field.references {
                    edges
                        .entry(reference.collection.as_str())
                        .or_default()
                        .push(collection.name.as_str());
                }
            }
        }
    }

    let mut visiting = Vec::new();
    let mut done = std::collections::HashSet::new();
    for collection in &schema.collections {
        visit(collection.name.as_str(), &edges, &mut visiting, &mut done)?;
    }
    Ok(())
}

fn visit<'a>(
    node: &'a str,
    edges: &std::collections::HashMap<&str, Vec<&'a str>>,
    visiting: &mut Vec<&'a str>,
    done: &mut std::collections::HashSet<&'a str>,
) -> Result<(), SchemaError> {
    if done.contains(node) {
        return Ok(());
    }
    if let Some(pos) = visiting.iter().position(|n| *n == node) {
        let mut cycle: Vec<String> = visiting[pos..].iter().map(|s| s.to_string()).collect();
        cycle.push(node.to_string());
        return Err(SchemaError::CascadeCycle { collections: cycle });
    }
    visiting.push(node);
    if let Some(next) = edges.get(node) {
        for n in next {
            visit(n, edges, visiting, done)?;
        }
    }
    visiting.pop();
    done.insert(node);
    Ok(())
}
