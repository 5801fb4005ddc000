use sha2::{Digest, Sha256};

use crate::types::Schema;

/// Hex SHA-256 over a canonical JSON rendering.
///
/// serde_json serializes struct fields in declaration order and the
/// schema's maps are order-preserving, so equal schemas hash equally
/// regardless of the YAML text they were parsed from.
pub fn schema_hash(schema: &Schema) -> String {
    let canonical = serde_json::to_vec(schema).expect("schema serializes");
    digest_hex(&canonical)
}

/// Hex SHA-256 of arbitrary bytes (migration files, function bundles).
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Collection, CollectionName, FieldDefinition, FieldName, FieldType};

    fn schema_with_field(field: &str) -> Schema {
        let mut schema = Schema {
            collections: vec![Collection::new(
                CollectionName::new("tasks").unwrap(),
                vec![FieldDefinition::new(
                    FieldName::new(field).unwrap(),
                    FieldType::String,
                )],
            )],
            ..Schema::default()
        };
        schema.validate().unwrap();
        schema
    }

    #[test]
    fn equal_schemas_hash_equal() {
        assert_eq!(
            schema_hash(&schema_with_field("title")),
            schema_hash(&schema_with_field("title"))
        );
    }

    #[test]
    fn different_schemas_hash_differently() {
        assert_ne!(
            schema_hash(&schema_with_field("title")),
            schema_hash(&schema_with_field("name"))
        );
    }

    #[test]
    fn digest_is_hex_sha256() {
        let d = digest_hex(b"hello");
        assert_eq!(d.len(), 64);
        assert_eq!(
            d,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
