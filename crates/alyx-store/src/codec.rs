use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::Row;

use alyx_core::types::FieldType;
use alyx_core::value::{Document, Value};

use crate::error::StoreError;
use crate::registry::TablePlan;

/// Converts a typed value into its SQL representation.
///
/// Timestamps are stored as RFC 3339 text, uuids as hyphenated text,
/// json as serialized text, bools as 0/1.
pub fn value_to_sql(value: &Value) -> ToSqlOutput<'static> {
    let owned = match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(v) => SqlValue::Real(*v),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Timestamp(dt) => {
            SqlValue::Text(dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        }
        Value::Uuid(u) => SqlValue::Text(u.to_string()),
        Value::Json(json) => SqlValue::Text(json.to_string()),
        Value::Blob(bytes) => SqlValue::Blob(bytes.clone()),
        _ => unreachable!("alyx_core::Value is non_exhaustive but all variants are handled"),
    };
    ToSqlOutput::Owned(owned)
}

/// Reads one column back into a typed value, driven by the schema.
pub fn sql_to_value(raw: ValueRef<'_>, ty: FieldType) -> Result<Value, StoreError> {
    if matches!(raw, ValueRef::Null) {
        return Ok(Value::Null);
    }
    let value = match ty {
        FieldType::Uuid => Value::Uuid(
            uuid::Uuid::parse_str(text(raw)?)
                .map_err(|e| internal(format!("bad uuid in database: {e}")))?,
        ),
        FieldType::String | FieldType::Text | FieldType::File => {
            Value::String(text(raw)?.to_string())
        }
        FieldType::Int => match raw {
            ValueRef::Integer(i) => Value::Int(i),
            _ => return Err(internal("expected integer column".into())),
        },
        FieldType::Float => match raw {
            ValueRef::Real(v) => Value::Float(v),
            ValueRef::Integer(i) => Value::Float(i as f64),
            _ => return Err(internal("expected real column".into())),
        },
        FieldType::Bool => match raw {
            ValueRef::Integer(i) => Value::Bool(i != 0),
            _ => return Err(internal("expected boolean column".into())),
        },
        FieldType::Timestamp => {
            let parsed = DateTime::parse_from_rfc3339(text(raw)?)
                .map_err(|e| internal(format!("bad timestamp in database: {e}")))?;
            Value::Timestamp(parsed.with_timezone(&Utc))
        }
        FieldType::Json => {
            let parsed: serde_json::Value = serde_json::from_str(text(raw)?)
                .map_err(|e| internal(format!("bad json in database: {e}")))?;
            Value::Json(parsed)
        }
        FieldType::Blob => match raw {
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
            ValueRef::Text(bytes) => Value::Blob(bytes.to_vec()),
            _ => return Err(internal("expected blob column".into())),
        },
        _ => unreachable!("alyx_core::types::FieldType is non_exhaustive but all variants are handled"),
    };
    Ok(value)
}

/// Decodes a full row into a document using the table plan's column order.
pub fn row_to_document(row: &Row<'_>, plan: &TablePlan) -> Result<Document, StoreError> {
    let mut doc = Document::new();
    for (idx, column) in plan.columns.iter().enumerate() {
        let raw = row
            .get_ref(idx)
            .map_err(|e| internal(e.to_string()))?;
        doc.insert(column.name.clone(), sql_to_value(raw, column.field_type)?);
    }
    Ok(doc)
}

fn text(raw: ValueRef<'_>) -> Result<&str, StoreError> {
    raw.as_str()
        .map_err(|e| internal(format!("expected text column: {e}")))
}

fn internal(message: String) -> StoreError {
    StoreError::Internal { message }
}
