use serde::{Deserialize, Serialize};

use super::rules::BucketRules;

/// A named file-object store.
///
/// The storage backend string selects the collaborator that holds the
/// bytes ("local", "s3", ...); the core only enforces size/type limits
/// and bucket policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub name: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_types: Vec<String>,
    #[serde(default, skip_serializing_if = "is_empty_rules")]
    pub rules: BucketRules,
}

impl Bucket {
    /// Creates a local-backend bucket with no limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: default_backend(),
            max_file_size: None,
            allowed_types: Vec::new(),
            rules: BucketRules::default(),
        }
    }

    /// Checks an upload's declared content type against the allow list.
    ///
    /// An empty list allows everything. Entries may end in `/*` to
    /// allow a whole top-level type (`image/*`).
    pub fn allows_type(&self, content_type: &str) -> bool {
        if self.allowed_types.is_empty() {
            return true;
        }
        self.allowed_types.iter().any(|allowed| {
            if let Some(prefix) = allowed.strip_suffix("/*") {
                content_type
                    .split_once('/')
                    .is_some_and(|(top, _)| top == prefix)
            } else {
                allowed == content_type
            }
        })
    }

    /// Checks an upload's size against the limit, if any.
    pub fn allows_size(&self, size: u64) -> bool {
        self.max_file_size.is_none_or(|max| size <= max)
    }
}

fn default_backend() -> String {
    "local".to_string()
}

fn is_empty_rules(rules: &BucketRules) -> bool {
    *rules == BucketRules::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_allows_everything() {
        let bucket = Bucket::new("avatars");
        assert!(bucket.allows_type("image/png"));
        assert!(bucket.allows_type("application/zip"));
    }

    #[test]
    fn exact_type_match() {
        let mut bucket = Bucket::new("avatars");
        bucket.allowed_types = vec!["image/png".into()];
        assert!(bucket.allows_type("image/png"));
        assert!(!bucket.allows_type("image/jpeg"));
    }

    #[test]
    fn wildcard_subtype_match() {
        let mut bucket = Bucket::new("avatars");
        bucket.allowed_types = vec!["image/*".into()];
        assert!(bucket.allows_type("image/png"));
        assert!(bucket.allows_type("image/jpeg"));
        assert!(!bucket.allows_type("video/mp4"));
    }

    #[test]
    fn size_limit() {
        let mut bucket = Bucket::new("avatars");
        assert!(bucket.allows_size(u64::MAX));
        bucket.max_file_size = Some(1024);
        assert!(bucket.allows_size(1024));
        assert!(!bucket.allows_size(1025));
    }

    #[test]
    fn serde_roundtrip() {
        let mut bucket = Bucket::new("avatars");
        bucket.max_file_size = Some(5 * 1024 * 1024);
        bucket.allowed_types = vec!["image/*".into()];
        let json = serde_json::to_string(&bucket).unwrap();
        let back: Bucket = serde_json::from_str(&json).unwrap();
        assert_eq!(bucket, back);
    }

    #[test]
    fn backend_defaults_to_local() {
        let bucket: Bucket = serde_json::from_str(r#"{"name":"files"}"#).unwrap();
        assert_eq!(bucket.backend, "local");
    }
}
