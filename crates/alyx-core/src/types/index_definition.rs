use std::fmt;

use serde::{Deserialize, Serialize};

use super::name::FieldName;

/// Sort direction for an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOrder {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for IndexOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "ASC"),
            Self::Desc => write!(f, "DESC"),
        }
    }
}

/// A secondary index over one or more fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    /// Ordered, non-empty; validated by `Schema::validate`.
    pub fields: Vec<FieldName>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_default_order")]
    pub order: IndexOrder,
}

impl IndexDefinition {
    /// Creates a non-unique ascending index.
    pub fn new(name: impl Into<String>, fields: Vec<FieldName>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
            order: IndexOrder::Asc,
        }
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} ({}) {}",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.fields
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            self.order
        )
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_default_order(order: &IndexOrder) -> bool {
    *order == IndexOrder::Asc
}
