use std::fmt;

use serde::{Deserialize, Serialize};

use super::default_value::DefaultValue;
use super::field_type::FieldType;
use super::name::{CollectionName, FieldName};
use super::validation::Validation;

/// What happens to referring rows when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum OnDelete {
    /// Abort the delete while referring rows exist.
    Restrict,
    /// Delete referring rows too (recursively).
    Cascade,
    /// Null out the referring field; requires it to be nullable.
    SetNull,
}

impl fmt::Display for OnDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restrict => write!(f, "restrict"),
            Self::Cascade => write!(f, "cascade"),
            Self::SetNull => write!(f, "set-null"),
        }
    }
}

/// A foreign key target: `<collection>.<field>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference {
    pub collection: CollectionName,
    pub field: FieldName,
}

impl Reference {
    /// Parses `"posts.id"` into a reference.
    pub fn parse(s: &str) -> Result<Self, crate::error::SchemaError> {
        let (coll, field) = s.split_once('.').ok_or_else(|| {
            crate::error::SchemaError::ParseFailed(format!(
                "reference '{s}' must be '<collection>.<field>'"
            ))
        })?;
        Ok(Self {
            collection: CollectionName::new(coll)?,
            field: FieldName::new(field)?,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.collection, self.field)
    }
}

impl From<Reference> for String {
    fn from(r: Reference) -> String {
        r.to_string()
    }
}

impl TryFrom<String> for Reference {
    type Error = crate::error::SchemaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

/// A complete field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: FieldName,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub indexed: bool,
    /// Internal fields are stored but never surfaced over the API.
    #[serde(default, skip_serializing_if = "is_false")]
    pub internal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    /// `now` refresh on update; timestamps only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub on_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<OnDelete>,
    /// Bucket backing a `file` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Validation::is_empty")]
    pub validate: Validation,
}

impl FieldDefinition {
    /// Creates a plain field with the given name and type.
    pub fn new(name: FieldName, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            primary: false,
            unique: false,
            nullable: false,
            indexed: false,
            internal: false,
            default: None,
            on_update: false,
            references: None,
            on_delete: None,
            bucket: None,
            validate: Validation::default(),
        }
    }

    /// The synthesized `id: uuid primary default=auto` field.
    pub fn synthetic_primary() -> Self {
        let mut field = Self::new(FieldName::new("id").expect("static name"), FieldType::Uuid);
        field.primary = true;
        field.unique = true;
        field.default = Some(DefaultValue::Auto);
        field
    }

    /// Returns true if a create without this field is acceptable:
    /// the field is primary (generated), nullable, or defaulted.
    pub fn optional_at_create(&self) -> bool {
        self.primary || self.nullable || self.default.is_some()
    }
}

impl fmt::Display for FieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.field_type)?;
        if self.primary {
            write!(f, " primary")?;
        }
        if self.unique {
            write!(f, " unique")?;
        }
        if self.nullable {
            write!(f, " nullable")?;
        }
        if let Some(d) = &self.default {
            write!(f, " default={d}")?;
        }
        if let Some(r) = &self.references {
            write!(f, " -> {r}")?;
        }
        Ok(())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}
