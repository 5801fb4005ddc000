use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wire envelope both directions share: `{id?, type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            id: None,
            kind: kind.to_string(),
            payload,
        }
    }

    pub fn reply(id: Option<String>, kind: &str, payload: Value) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            payload,
        }
    }
}

/// Client -> server `subscribe` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribePayload {
    pub collection: String,
    /// `{field: {"$op": value}}` shorthand, or `{field: value}` for
    /// equality.
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Client -> server `unsubscribe` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribePayload {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
}

/// Per-category delta lists, each in sequence order.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DeltaChanges {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inserts: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deletes: Vec<Value>,
}

impl DeltaChanges {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let text = r#"{"id":"1","type":"subscribe","payload":{"collection":"messages"}}"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("1"));
        assert_eq!(envelope.kind, "subscribe");

        let payload: SubscribePayload =
            serde_json::from_value(envelope.payload.clone()).unwrap();
        assert_eq!(payload.collection, "messages");
        assert!(payload.filter.is_none());
    }

    #[test]
    fn envelope_without_id_serializes_without_id() {
        let envelope = Envelope::new("connected", serde_json::json!({"clientId": "c1"}));
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(!text.contains("\"id\""));
        assert!(text.contains("\"connected\""));
    }

    #[test]
    fn subscribe_payload_full() {
        let payload: SubscribePayload = serde_json::from_value(serde_json::json!({
            "collection": "messages",
            "filter": {"channel": {"$eq": "general"}},
            "sort": "-created_at",
            "limit": 50,
        }))
        .unwrap();
        assert_eq!(payload.sort.as_deref(), Some("-created_at"));
        assert_eq!(payload.limit, Some(50));
    }

    #[test]
    fn empty_delta_detected() {
        assert!(DeltaChanges::default().is_empty());
        let with_insert = DeltaChanges {
            inserts: vec![serde_json::json!({"id": 1})],
            ..DeltaChanges::default()
        };
        assert!(!with_insert.is_empty());
    }
}
