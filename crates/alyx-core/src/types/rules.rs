use serde::{Deserialize, Serialize};

/// The guarded operations on a collection or bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    /// Bucket-only: gates file content, while `read` gates metadata.
    Download,
}

impl Operation {
    /// The wire name, as used in rule blocks and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Download => "download",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-operation policy expression sources for a collection.
///
/// A missing rule means the operation is open at the policy level;
/// the data gateway still requires authentication for mutations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
}

impl Rules {
    /// Returns the rule source for an operation, if declared.
    pub fn get(&self, op: Operation) -> Option<&str> {
        match op {
            Operation::Create => self.create.as_deref(),
            Operation::Read => self.read.as_deref(),
            Operation::Update => self.update.as_deref(),
            Operation::Delete => self.delete.as_deref(),
            Operation::Download => None,
        }
    }

    /// Iterates declared (operation, source) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Operation, &str)> {
        [
            (Operation::Create, self.create.as_deref()),
            (Operation::Read, self.read.as_deref()),
            (Operation::Update, self.update.as_deref()),
            (Operation::Delete, self.delete.as_deref()),
        ]
        .into_iter()
        .filter_map(|(op, src)| src.map(|s| (op, s)))
    }

    /// Returns true if no rule is declared.
    pub fn is_empty(&self) -> bool {
        self.create.is_none()
            && self.read.is_none()
            && self.update.is_none()
            && self.delete.is_none()
    }
}

/// Bucket rules add `download` on top of the collection set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<String>,
}

impl BucketRules {
    /// Returns the rule source for an operation, if declared.
    pub fn get(&self, op: Operation) -> Option<&str> {
        match op {
            Operation::Create => self.create.as_deref(),
            Operation::Read => self.read.as_deref(),
            Operation::Update => self.update.as_deref(),
            Operation::Delete => self.delete.as_deref(),
            Operation::Download => self.download.as_deref(),
        }
    }

    /// Iterates declared (operation, source) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Operation, &str)> {
        [
            (Operation::Create, self.create.as_deref()),
            (Operation::Read, self.read.as_deref()),
            (Operation::Update, self.update.as_deref()),
            (Operation::Delete, self.delete.as_deref()),
            (Operation::Download, self.download.as_deref()),
        ]
        .into_iter()
        .filter_map(|(op, src)| src.map(|s| (op, s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_wire_names() {
        assert_eq!(Operation::Create.as_str(), "create");
        assert_eq!(Operation::Download.as_str(), "download");
    }

    #[test]
    fn rules_get_by_operation() {
        let rules = Rules {
            read: Some("doc.published == true".into()),
            ..Rules::default()
        };
        assert_eq!(rules.get(Operation::Read), Some("doc.published == true"));
        assert_eq!(rules.get(Operation::Create), None);
        assert_eq!(rules.get(Operation::Download), None);
    }

    #[test]
    fn rules_iter_only_declared() {
        let rules = Rules {
            create: Some("has(auth.id)".into()),
            delete: Some("auth.role == \"admin\"".into()),
            ..Rules::default()
        };
        let ops: Vec<Operation> = rules.iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec![Operation::Create, Operation::Delete]);
    }

    #[test]
    fn bucket_rules_include_download() {
        let rules = BucketRules {
            download: Some("has(auth.id)".into()),
            ..BucketRules::default()
        };
        assert_eq!(rules.get(Operation::Download), Some("has(auth.id)"));
    }

    #[test]
    fn serde_skips_missing() {
        let rules = Rules::default();
        assert_eq!(serde_json::to_string(&rules).unwrap(), "{}");
    }
}
