mod bucket;
mod default_value;
mod field_definition;
mod field_type;
mod index_definition;
mod name;
mod rules;
mod schema;
mod validation;

pub use bucket::Bucket;
pub use default_value::DefaultValue;
pub use field_definition::{FieldDefinition, OnDelete, Reference};
pub use field_type::FieldType;
pub use name::{CollectionName, FieldName};
pub use index_definition::{IndexDefinition, IndexOrder};
pub use rules::{BucketRules, Operation, Rules};
pub use schema::{Collection, Schema};
pub use validation::{Format, Validation};
