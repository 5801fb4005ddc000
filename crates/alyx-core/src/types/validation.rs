use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Well-known string formats a field may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Format {
    Email,
    Url,
    Uuid,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Url => write!(f, "url"),
            Self::Uuid => write!(f, "uuid"),
        }
    }
}

/// Optional per-field validation constraints.
///
/// A failed check reports the constraint in `name:threshold` form
/// (`"minLength:1"`), which is what the REST layer surfaces in the
/// `validation_failed` details map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Validation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
}

impl Validation {
    /// Returns true if no constraint is set.
    pub fn is_empty(&self) -> bool {
        self.min_length.is_none()
            && self.max_length.is_none()
            && self.min.is_none()
            && self.max.is_none()
            && self.pattern.is_none()
            && self.one_of.is_none()
            && self.format.is_none()
    }

    /// Checks a value against every set constraint.
    ///
    /// Null passes: nullability is decided by the field definition,
    /// not by constraints. Returns the first violated constraint as a
    /// `name:threshold` string.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if value.is_null() {
            return Ok(());
        }

        if let Value::String(s) = value {
            let len = s.chars().count();
            if let Some(min) = self.min_length {
                if len < min {
                    return Err(format!("minLength:{min}"));
                }
            }
            if let Some(max) = self.max_length {
                if len > max {
                    return Err(format!("maxLength:{max}"));
                }
            }
            if let Some(pattern) = &self.pattern {
                match regex::Regex::new(pattern) {
                    Ok(re) if re.is_match(s) => {}
                    Ok(_) => return Err(format!("pattern:{pattern}")),
                    // Pattern syntax is verified at schema load; an
                    // unparseable pattern here cannot pass anything.
                    Err(_) => return Err(format!("pattern:{pattern}")),
                }
            }
            if let Some(format) = self.format {
                if !check_format(s, format) {
                    return Err(format!("format:{format}"));
                }
            }
        }

        if let Some(n) = numeric(value) {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("min:{min}"));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("max:{max}"));
                }
            }
        }

        if let Some(allowed) = &self.one_of {
            let json = value.to_json();
            if !allowed.contains(&json) {
                return Err("enum".to_string());
            }
        }

        Ok(())
    }

    /// Returns true if `self` adds or strengthens any constraint
    /// relative to `old`. Tightening is an unsafe schema change.
    pub fn tightens(&self, old: &Validation) -> bool {
        tightened_min(self.min_length.map(|v| v as f64), old.min_length.map(|v| v as f64))
            || tightened_max(self.max_length.map(|v| v as f64), old.max_length.map(|v| v as f64))
            || tightened_min(self.min, old.min)
            || tightened_max(self.max, old.max)
            || added_or_changed(&self.pattern, &old.pattern)
            || shrunk_enum(&self.one_of, &old.one_of)
            || (self.format.is_some() && self.format != old.format)
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(v) => Some(*v),
        _ => None,
    }
}

fn check_format(s: &str, format: Format) -> bool {
    match format {
        Format::Email => {
            let mut parts = s.splitn(2, '@');
            let local = parts.next().unwrap_or("");
            match parts.next() {
                Some(domain) => {
                    !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
                }
                None => false,
            }
        }
        Format::Url => s.starts_with("http://") || s.starts_with("https://"),
        Format::Uuid => uuid::Uuid::parse_str(s).is_ok(),
    }
}

fn tightened_min(new: Option<f64>, old: Option<f64>) -> bool {
    match (new, old) {
        (Some(n), Some(o)) => n > o,
        (Some(_), None) => true,
        _ => false,
    }
}

fn tightened_max(new: Option<f64>, old: Option<f64>) -> bool {
    match (new, old) {
        (Some(n), Some(o)) => n < o,
        (Some(_), None) => true,
        _ => false,
    }
}

fn added_or_changed(new: &Option<String>, old: &Option<String>) -> bool {
    match (new, old) {
        (Some(n), Some(o)) => n != o,
        (Some(_), None) => true,
        _ => false,
    }
}

fn shrunk_enum(
    new: &Option<Vec<serde_json::Value>>,
    old: &Option<Vec<serde_json::Value>>,
) -> bool {
    match (new, old) {
        (Some(n), Some(o)) => o.iter().any(|v| !n.contains(v)),
        (Some(_), None) => true,
        _ => false,
    }
}
