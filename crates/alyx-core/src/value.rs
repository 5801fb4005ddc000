use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::FieldType;

/// Runtime value for any field type.
///
/// The schema fixes which variant a given field may hold; the codec
/// layer converts to and from wire JSON and SQL without reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    Blob(Vec<u8>),
}

/// A document: field name to value, deterministically ordered.
pub type Document = BTreeMap<String, Value>;

impl Value {
    /// Returns true if this is `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts a wire JSON value into a typed `Value` for the given field type.
    ///
    /// Returns `None` when the JSON value cannot represent the declared type.
    pub fn from_json(json: &serde_json::Value, ty: FieldType) -> Option<Value> {
        if json.is_null() {
            return Some(Value::Null);
        }
        match ty {
            FieldType::Uuid => json
                .as_str()
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
                .map(Value::Uuid),
            FieldType::String | FieldType::Text | FieldType::File => {
                json.as_str().map(|s| Value::String(s.to_string()))
            }
            FieldType::Int => json.as_i64().map(Value::Int),
            FieldType::Float => json.as_f64().map(Value::Float),
            FieldType::Bool => json.as_bool().map(Value::Bool),
            FieldType::Timestamp => json
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| Value::Timestamp(dt.with_timezone(&Utc))),
            FieldType::Json => Some(Value::Json(json.clone())),
            FieldType::Blob => json
                .as_str()
                .map(|s| Value::Blob(s.as_bytes().to_vec())),
        }
    }

    /// Renders this value as wire JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Timestamp(dt) => {
                serde_json::Value::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
            }
            Self::Uuid(u) => serde_json::Value::String(u.to_string()),
            Self::Json(v) => v.clone(),
            Self::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }

    /// Returns the string content, if this value carries one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this value carries one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Timestamp(dt) => write!(f, "{dt}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(v) => write!(f, "{v}"),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Renders a document as a JSON object in field order.
pub fn document_to_json(doc: &Document) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = doc
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_null() {
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn display_string_quoted() {
        assert_eq!(Value::String("hi".into()).to_string(), "\"hi\"");
    }

    #[test]
    fn from_json_uuid() {
        let id = uuid::Uuid::new_v4();
        let json = serde_json::Value::String(id.to_string());
        assert_eq!(Value::from_json(&json, FieldType::Uuid), Some(Value::Uuid(id)));
    }

    #[test]
    fn from_json_rejects_type_confusion() {
        let json = serde_json::json!("not a number");
        assert_eq!(Value::from_json(&json, FieldType::Int), None);
        let json = serde_json::json!(12);
        assert_eq!(Value::from_json(&json, FieldType::Bool), None);
    }

    #[test]
    fn from_json_null_is_null_for_any_type() {
        for ty in [FieldType::Uuid, FieldType::Int, FieldType::Json] {
            assert_eq!(Value::from_json(&serde_json::Value::Null, ty), Some(Value::Null));
        }
    }

    #[test]
    fn json_roundtrip_timestamp() {
        let dt = Utc::now();
        let v = Value::Timestamp(dt);
        let json = v.to_json();
        let back = Value::from_json(&json, FieldType::Timestamp).unwrap();
        match back {
            Value::Timestamp(parsed) => {
                assert_eq!(parsed.timestamp_micros(), dt.timestamp_micros())
            }
            other => panic!("expected timestamp, got {other}"),
        }
    }

    #[test]
    fn document_to_json_preserves_fields() {
        let mut doc = Document::new();
        doc.insert("title".into(), Value::String("Learn".into()));
        doc.insert("completed".into(), Value::Bool(false));
        let json = document_to_json(&doc);
        assert_eq!(json["title"], "Learn");
        assert_eq!(json["completed"], false);
    }
}
