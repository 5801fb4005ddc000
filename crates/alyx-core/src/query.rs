use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// The hard ceiling on list page size.
pub const MAX_LIMIT: u32 = 1000;

/// The default list page size when the caller names none.
pub const DEFAULT_LIMIT: u32 = 30;

// ---------------------------------------------------------------------------
// FilterOp
// ---------------------------------------------------------------------------

/// Comparison operators of the list filter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FilterOp {
    #[serde(rename = "$eq")]
    Eq,
    #[serde(rename = "$ne")]
    Ne,
    #[serde(rename = "$gt")]
    Gt,
    #[serde(rename = "$gte")]
    Gte,
    #[serde(rename = "$lt")]
    Lt,
    #[serde(rename = "$lte")]
    Lte,
    #[serde(rename = "$in")]
    In,
    #[serde(rename = "$like")]
    Like,
    #[serde(rename = "$contains")]
    Contains,
}

impl FilterOp {
    /// Parses the `$op` wire form (`"eq"` and `"$eq"` both accepted).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('$').unwrap_or(s);
        match s {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            "like" => Some(Self::Like),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::In => "$in",
            Self::Like => "$like",
            Self::Contains => "$contains",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// One field comparison. A list of filters combines with implicit AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    /// `$in` carries a list; everything else a single value.
    pub values: Vec<Value>,
}

impl Filter {
    /// Builds a single-value filter.
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            values: vec![value],
        }
    }

    /// Builds an `$in` filter over a value set.
    pub fn in_set(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In,
            values,
        }
    }

    /// The single comparison value (first, for non-`$in` filters).
    pub fn value(&self) -> Option<&Value> {
        self.values.first()
    }

    /// Evaluates this filter against an in-memory document.
    ///
    /// Used by the change router to match events without touching the
    /// database; semantics mirror the SQL translation.
    pub fn matches(&self, doc: &crate::value::Document) -> bool {
        let actual = doc.get(&self.field).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => self.value().is_some_and(|v| values_equal(actual, v)),
            FilterOp::Ne => self.value().is_some_and(|v| !values_equal(actual, v)),
            FilterOp::Gt => compare(actual, self.value()).is_some_and(|o| o.is_gt()),
            FilterOp::Gte => compare(actual, self.value()).is_some_and(|o| o.is_ge()),
            FilterOp::Lt => compare(actual, self.value()).is_some_and(|o| o.is_lt()),
            FilterOp::Lte => compare(actual, self.value()).is_some_and(|o| o.is_le()),
            FilterOp::In => self.values.iter().any(|v| values_equal(actual, v)),
            FilterOp::Like => match (actual, self.value()) {
                (Value::String(s), Some(Value::String(pattern))) => like_match(s, pattern),
                _ => false,
            },
            FilterOp::Contains => match (actual, self.value()) {
                (Value::String(s), Some(Value::String(needle))) => s.contains(needle.as_str()),
                _ => false,
            },
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => *i as f64 == *f,
        _ => a == b,
    }
}

fn compare(a: &Value, b: Option<&Value>) -> Option<std::cmp::Ordering> {
    let b = b?;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL LIKE semantics: `%` any run, `_` any single char.
fn like_match(s: &str, pattern: &str) -> bool {
    fn inner(s: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some(('%', rest)) => {
                (0..=s.len()).any(|skip| inner(&s[skip..], rest))
            }
            Some(('_', rest)) => match s.split_first() {
                Some((_, s_rest)) => inner(s_rest, rest),
                None => false,
            },
            Some((c, rest)) => match s.split_first() {
                Some((sc, s_rest)) => {
                    sc.eq_ignore_ascii_case(c) && inner(s_rest, rest)
                }
                None => false,
            },
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&s, &p)
}

// ---------------------------------------------------------------------------
// Sort
// ---------------------------------------------------------------------------

/// A sort key: field name, `-` prefix on the wire for descending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

impl Sort {
    /// Parses `"created_at"` or `"-created_at"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (descending, field) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if field.is_empty() {
            return None;
        }
        Some(Self {
            field: field.to_string(),
            descending,
        })
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-{}", self.field)
        } else {
            write!(f, "{}", self.field)
        }
    }
}

// ---------------------------------------------------------------------------
// ListQuery
// ---------------------------------------------------------------------------

/// A parsed list request: filters (implicit AND), sort, pagination,
/// and foreign-key expansion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    /// Field names whose references should be dereferenced in bulk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expand: Vec<String>,
    /// Free-text sweep over string/text fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl ListQuery {
    /// The effective page size, clamped to [`MAX_LIMIT`].
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }

    /// The effective offset.
    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Document;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn filter_op_parse() {
        assert_eq!(FilterOp::parse("eq"), Some(FilterOp::Eq));
        assert_eq!(FilterOp::parse("$gte"), Some(FilterOp::Gte));
        assert_eq!(FilterOp::parse("bogus"), None);
    }

    #[test]
    fn eq_matches() {
        let f = Filter::new("channel", FilterOp::Eq, Value::String("general".into()));
        assert!(f.matches(&doc(&[("channel", Value::String("general".into()))])));
        assert!(!f.matches(&doc(&[("channel", Value::String("random".into()))])));
        assert!(!f.matches(&doc(&[])));
    }

    #[test]
    fn numeric_comparisons_cross_type() {
        let f = Filter::new("score", FilterOp::Gt, Value::Int(5));
        assert!(f.matches(&doc(&[("score", Value::Float(5.5))])));
        assert!(!f.matches(&doc(&[("score", Value::Int(5))])));
    }

    #[test]
    fn in_set_matches_any() {
        let f = Filter::in_set(
            "status",
            vec![Value::String("open".into()), Value::String("hold".into())],
        );
        assert!(f.matches(&doc(&[("status", Value::String("hold".into()))])));
        assert!(!f.matches(&doc(&[("status", Value::String("done".into()))])));
    }

    #[test]
    fn like_percent_and_underscore() {
        let f = Filter::new("title", FilterOp::Like, Value::String("le%n_".into()));
        assert!(f.matches(&doc(&[("title", Value::String("learns".into()))])));
        assert!(!f.matches(&doc(&[("title", Value::String("learn".into()))])));
    }

    #[test]
    fn like_is_case_insensitive() {
        let f = Filter::new("title", FilterOp::Like, Value::String("LEARN".into()));
        assert!(f.matches(&doc(&[("title", Value::String("learn".into()))])));
    }

    #[test]
    fn contains_substring() {
        let f = Filter::new("title", FilterOp::Contains, Value::String("arn".into()));
        assert!(f.matches(&doc(&[("title", Value::String("learn".into()))])));
        assert!(!f.matches(&doc(&[("title", Value::String("teach".into()))])));
    }

    #[test]
    fn type_confused_comparison_is_false() {
        let f = Filter::new("title", FilterOp::Gt, Value::String("a".into()));
        assert!(!f.matches(&doc(&[("title", Value::Int(3))])));
    }

    #[test]
    fn sort_parse() {
        let s = Sort::parse("-created_at").unwrap();
        assert_eq!(s.field, "created_at");
        assert!(s.descending);
        assert_eq!(s.to_string(), "-created_at");

        let s = Sort::parse("title").unwrap();
        assert!(!s.descending);

        assert!(Sort::parse("-").is_none());
        assert!(Sort::parse("").is_none());
    }

    #[test]
    fn limit_clamped() {
        let q = ListQuery {
            limit: Some(5000),
            ..ListQuery::default()
        };
        assert_eq!(q.effective_limit(), MAX_LIMIT);
        let q = ListQuery::default();
        assert_eq!(q.effective_limit(), DEFAULT_LIMIT);
    }
}
