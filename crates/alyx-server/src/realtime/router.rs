use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use alyx_core::query::Filter;
use alyx_core::types::Operation;
use alyx_core::value::{document_to_json, Document};
use alyx_rules::EvalContext;
use alyx_store::{SchemaRegistry, SequencedEvent};

use crate::config::RealtimeConfig;
use crate::realtime::protocol::{DeltaChanges, Envelope};

const SHARDS: usize = 16;

/// One registered live filter.
///
/// The delivery queue is the bounded channel behind `queue`; overflow
/// marks the subscription stale and tears it down: the producer side
/// never blocks.
pub struct Subscription {
    pub id: String,
    pub client_id: String,
    pub collection: String,
    pub filters: Vec<Filter>,
    /// Subscriber claims; the `read` rule runs against these for every
    /// delivered document.
    pub auth: Option<serde_json::Value>,
    pub ip: String,
    queue: mpsc::Sender<(u64, Envelope)>,
    client_tx: mpsc::Sender<Envelope>,
    stale: AtomicBool,
}

/// Filtered fan-out of committed change events to WebSocket
/// subscribers, sharded by collection.
pub struct ChangeRouter {
    registry: Arc<SchemaRegistry>,
    config: RealtimeConfig,
    shards: Vec<RwLock<HashMap<String, Vec<Arc<Subscription>>>>>,
    /// client id -> subscription count, for the per-client cap.
    clients: RwLock<HashMap<String, usize>>,
    delivered: AtomicU64,
    dropped_stale: AtomicU64,
}

impl ChangeRouter {
    pub fn new(registry: Arc<SchemaRegistry>, config: RealtimeConfig) -> Self {
        Self {
            registry,
            config,
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            clients: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped_stale: AtomicU64::new(0),
        }
    }

    fn shard(&self, collection: &str) -> &RwLock<HashMap<String, Vec<Arc<Subscription>>>> {
        let mut hasher = DefaultHasher::new();
        collection.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Registers a connection; fails when the connection cap is hit.
    pub fn register_client(&self, client_id: &str) -> Result<(), &'static str> {
        let mut clients = self.clients.write();
        if clients.len() >= self.config.max_connections
            && !clients.contains_key(client_id)
        {
            return Err("connection limit reached");
        }
        clients.entry(client_id.to_string()).or_insert(0);
        Ok(())
    }

    /// Registers a subscription and returns it. The caller takes the
    /// snapshot cursor *after* this returns, so nothing can fall into
    /// the gap between registration and snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &self,
        client_id: &str,
        collection: &str,
        filters: Vec<Filter>,
        auth: Option<serde_json::Value>,
        ip: &str,
        client_tx: mpsc::Sender<Envelope>,
    ) -> Result<(Arc<Subscription>, mpsc::Receiver<(u64, Envelope)>), &'static str> {
        {
            let mut clients = self.clients.write();
            let count = clients
                .entry(client_id.to_string())
                .or_insert(0);
            if *count >= self.config.max_subscriptions_per_client {
                return Err("subscription limit reached");
            }
            *count += 1;
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.config.change_buffer_size);
        let subscription = Arc::new(Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            collection: collection.to_string(),
            filters,
            auth,
            ip: ip.to_string(),
            queue: queue_tx,
            client_tx,
            stale: AtomicBool::new(false),
        });

        self.shard(collection)
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(Arc::clone(&subscription));

        debug!(
            subscription = %subscription.id,
            client = client_id,
            collection,
            "subscribed"
        );
        Ok((subscription, queue_rx))
    }

    /// Removes one subscription.
    pub fn unsubscribe(&self, client_id: &str, subscription_id: &str) {
        for shard in &self.shards {
            let mut shard = shard.write();
            for subs in shard.values_mut() {
                let before = subs.len();
                subs.retain(|s| !(s.id == subscription_id && s.client_id == client_id));
                if subs.len() != before {
                    if let Some(count) = self.clients.write().get_mut(client_id) {
                        *count = count.saturating_sub(before - subs.len());
                    }
                    return;
                }
            }
        }
    }

    /// Removes a client and every subscription it holds.
    pub fn remove_client(&self, client_id: &str) {
        for shard in &self.shards {
            let mut shard = shard.write();
            for subs in shard.values_mut() {
                subs.retain(|s| s.client_id != client_id);
            }
            shard.retain(|_, subs| !subs.is_empty());
        }
        self.clients.write().remove(client_id);
        debug!(client = client_id, "client removed");
    }

    /// Fan-out entry point: one committed batch in, at most one
    /// coalesced delta per matching subscription out.
    pub fn publish(&self, events: &[SequencedEvent]) {
        if events.is_empty() {
            return;
        }
        let snap = self.registry.load();
        let now = Utc::now();

        // Collections touched by this batch, deduped.
        let mut collections: Vec<&str> = events
            .iter()
            .map(|e| e.event.collection.as_str())
            .collect();
        collections.sort_unstable();
        collections.dedup();

        for collection in collections {
            let subscribers: Vec<Arc<Subscription>> = {
                let shard = self.shard(collection).read();
                match shard.get(collection) {
                    Some(subs) => subs.clone(),
                    None => continue,
                }
            };

            for subscription in subscribers {
                if subscription.stale.load(Ordering::Acquire) {
                    continue;
                }

                let mut changes = DeltaChanges::default();
                let mut last_seq = 0;
                for event in events.iter().filter(|e| e.event.collection == collection) {
                    if !self.event_matches(&snap, &subscription, event, now) {
                        continue;
                    }
                    let doc = document_to_json(&event.event.document);
                    match event.event.op {
                        alyx_store::ChangeOp::Insert => changes.inserts.push(doc),
                        alyx_store::ChangeOp::Update => changes.updates.push(doc),
                        alyx_store::ChangeOp::Delete => changes.deletes.push(doc),
                    }
                    last_seq = event.seq;
                }
                if changes.is_empty() {
                    continue;
                }

                let envelope = Envelope::new(
                    "delta",
                    serde_json::json!({
                        "subscriptionId": subscription.id,
                        "cursor": last_seq,
                        "changes": changes,
                    }),
                );

                match subscription.queue.try_send((last_seq, envelope)) {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.mark_stale(&subscription);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.unsubscribe(&subscription.client_id, &subscription.id);
                    }
                }
            }
        }
    }

    /// In-memory filter match plus the subscriber's `read` policy.
    fn event_matches(
        &self,
        snap: &alyx_store::RegistrySnapshot,
        subscription: &Subscription,
        event: &SequencedEvent,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        // Deletes match against the deleted document; updates against
        // the new state.
        let doc: &Document = &event.event.document;
        if !subscription.filters.iter().all(|f| f.matches(doc)) {
            return false;
        }

        let mut ctx = EvalContext::new()
            .with_doc(doc)
            .with_request("SUBSCRIPTION", &subscription.ip, now);
        if let Some(auth) = &subscription.auth {
            ctx = ctx.with_auth(auth);
        }
        snap.rules
            .check_collection(&subscription.collection, Operation::Read, &ctx)
    }

    /// Queue overflow: the subscription is beyond repair, tell the
    /// client to resubscribe and drop it. Never blocks the producer.
    fn mark_stale(&self, subscription: &Subscription) {
        if subscription.stale.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dropped_stale.fetch_add(1, Ordering::Relaxed);
        warn!(
            subscription = %subscription.id,
            client = %subscription.client_id,
            "delivery queue overflow, marking stale"
        );
        let _ = subscription.client_tx.try_send(Envelope::new(
            "error",
            serde_json::json!({
                "subscriptionId": subscription.id,
                "code": "stale_subscription",
                "message": "delivery queue overflowed; unsubscribe and resubscribe to resync",
            }),
        ));
        self.unsubscribe(&subscription.client_id, &subscription.id);
    }

    /// (active connections, active subscriptions, delivered, stale-dropped)
    pub fn stats(&self) -> (usize, usize, u64, u64) {
        let connections = self.clients.read().len();
        let subscriptions = self
            .shards
            .iter()
            .map(|s| s.read().values().map(Vec::len).sum::<usize>())
            .sum();
        (
            connections,
            subscriptions,
            self.delivered.load(Ordering::Relaxed),
            self.dropped_stale.load(Ordering::Relaxed),
        )
    }
}

/// Parses the subscribe payload's filter JSON into typed filters.
///
/// `{field: value}` means equality; `{field: {"$op": value}}` selects
/// an operator; multiple fields AND together.
pub fn parse_filter_json(
    snap: &alyx_store::RegistrySnapshot,
    collection: &str,
    json: &serde_json::Value,
) -> Result<Vec<Filter>, String> {
    use alyx_core::query::FilterOp;
    use alyx_core::value::Value;

    let Some(object) = json.as_object() else {
        return Err("filter must be an object".to_string());
    };
    let definition = snap
        .schema
        .collection(collection)
        .ok_or_else(|| format!("unknown collection '{collection}'"))?;

    let mut filters = Vec::new();
    for (field, spec) in object {
        let Some(field_def) = definition.field(field) else {
            return Err(format!("unknown filter field '{field}'"));
        };
        let ty = field_def.field_type;

        match spec.as_object().filter(|o| o.keys().any(|k| k.starts_with('$'))) {
            Some(ops) => {
                for (op_name, raw) in ops {
                    let op = FilterOp::parse(op_name)
                        .ok_or_else(|| format!("unknown operator '{op_name}'"))?;
                    if op == FilterOp::In {
                        let items = raw
                            .as_array()
                            .ok_or_else(|| "$in takes an array".to_string())?;
                        let values: Option<Vec<Value>> =
                            items.iter().map(|v| Value::from_json(v, ty)).collect();
                        let values = values
                            .ok_or_else(|| format!("bad value type for '{field}'"))?;
                        filters.push(Filter::in_set(field.clone(), values));
                    } else {
                        let value = Value::from_json(raw, ty)
                            .ok_or_else(|| format!("bad value type for '{field}'"))?;
                        filters.push(Filter::new(field.clone(), op, value));
                    }
                }
            }
            None => {
                let value = Value::from_json(spec, ty)
                    .ok_or_else(|| format!("bad value type for '{field}'"))?;
                filters.push(Filter::new(field.clone(), FilterOp::Eq, value));
            }
        }
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alyx_core::types::{
        Collection, CollectionName, FieldDefinition, FieldName, FieldType, Schema,
    };
    use alyx_core::value::Value;
    use alyx_store::{ChangeEvent, ChangeOp, RegistrySnapshot, Sequencer};

    fn registry() -> Arc<SchemaRegistry> {
        let mut schema = Schema {
            collections: vec![Collection::new(
                CollectionName::new("messages").unwrap(),
                vec![
                    FieldDefinition::new(FieldName::new("channel").unwrap(), FieldType::String),
                    FieldDefinition::new(FieldName::new("content").unwrap(), FieldType::String),
                ],
            )],
            ..Schema::default()
        };
        schema.validate().unwrap();
        Arc::new(SchemaRegistry::new(
            RegistrySnapshot::compile(schema).unwrap(),
        ))
    }

    fn router() -> ChangeRouter {
        ChangeRouter::new(registry(), RealtimeConfig::default())
    }

    fn small_router(buffer: usize) -> ChangeRouter {
        ChangeRouter::new(
            registry(),
            RealtimeConfig {
                change_buffer_size: buffer,
                ..RealtimeConfig::default()
            },
        )
    }

    fn message_event(seq_gen: &Sequencer, channel: &str) -> Vec<SequencedEvent> {
        let mut doc = Document::new();
        doc.insert("channel".into(), Value::String(channel.into()));
        doc.insert("content".into(), Value::String("hi".into()));
        seq_gen.stamp(vec![ChangeEvent {
            collection: "messages".into(),
            op: ChangeOp::Insert,
            document: doc,
            previous_document: None,
            at: Utc::now(),
        }])
    }

    fn eq_filter(field: &str, value: &str) -> Filter {
        Filter::new(field, alyx_core::query::FilterOp::Eq, Value::String(value.into()))
    }

    #[tokio::test]
    async fn matching_event_delivered_with_increasing_seq() {
        let router = router();
        let (client_tx, _client_rx) = mpsc::channel(8);
        router.register_client("c1").unwrap();
        let (_sub, mut queue) = router
            .subscribe(
                "c1",
                "messages",
                vec![eq_filter("channel", "general")],
                None,
                "127.0.0.1",
                client_tx,
            )
            .unwrap();

        let sequencer = Sequencer::new();
        router.publish(&message_event(&sequencer, "general"));
        router.publish(&message_event(&sequencer, "general"));

        let (seq1, delta1) = queue.recv().await.unwrap();
        let (seq2, _delta2) = queue.recv().await.unwrap();
        assert!(seq2 > seq1);
        assert_eq!(delta1.kind, "delta");
        assert_eq!(
            delta1.payload["changes"]["inserts"][0]["content"],
            "hi"
        );
    }

    #[tokio::test]
    async fn non_matching_event_not_delivered() {
        let router = router();
        let (client_tx, _client_rx) = mpsc::channel(8);
        router.register_client("c1").unwrap();
        let (_sub, mut queue) = router
            .subscribe(
                "c1",
                "messages",
                vec![eq_filter("channel", "general")],
                None,
                "127.0.0.1",
                client_tx,
            )
            .unwrap();

        let sequencer = Sequencer::new();
        router.publish(&message_event(&sequencer, "random"));
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_marks_stale_and_notifies_client() {
        let router = small_router(1);
        let (client_tx, mut client_rx) = mpsc::channel(8);
        router.register_client("c1").unwrap();
        let (_sub, _queue) = router
            .subscribe("c1", "messages", vec![], None, "127.0.0.1", client_tx)
            .unwrap();

        let sequencer = Sequencer::new();
        // First fills the queue; second overflows it.
        router.publish(&message_event(&sequencer, "general"));
        router.publish(&message_event(&sequencer, "general"));

        let error = client_rx.recv().await.unwrap();
        assert_eq!(error.kind, "error");
        assert_eq!(error.payload["code"], "stale_subscription");

        // The subscription is gone; nothing further is delivered.
        let (_, subs, _, stale) = router.stats();
        assert_eq!(subs, 0);
        assert_eq!(stale, 1);
        router.publish(&message_event(&sequencer, "general"));
    }

    #[tokio::test]
    async fn publish_never_blocks_on_full_queue() {
        let router = small_router(1);
        let (client_tx, _client_rx) = mpsc::channel(1);
        router.register_client("c1").unwrap();
        let (_sub, _queue) = router
            .subscribe("c1", "messages", vec![], None, "127.0.0.1", client_tx)
            .unwrap();

        let sequencer = Sequencer::new();
        // No reader anywhere; publish must return regardless.
        for _ in 0..50 {
            router.publish(&message_event(&sequencer, "general"));
        }
    }

    #[tokio::test]
    async fn coalesces_batch_into_one_delta() {
        let router = router();
        let (client_tx, _client_rx) = mpsc::channel(8);
        router.register_client("c1").unwrap();
        let (_sub, mut queue) = router
            .subscribe("c1", "messages", vec![], None, "127.0.0.1", client_tx)
            .unwrap();

        let sequencer = Sequencer::new();
        let mut batch = message_event(&sequencer, "general");
        batch.extend(message_event(&sequencer, "general"));
        router.publish(&batch);

        let (_, delta) = queue.recv().await.unwrap();
        assert_eq!(
            delta.payload["changes"]["inserts"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
        // One delta for the whole batch.
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_cap_enforced() {
        let router = ChangeRouter::new(
            registry(),
            RealtimeConfig {
                max_subscriptions_per_client: 1,
                ..RealtimeConfig::default()
            },
        );
        let (client_tx, _rx) = mpsc::channel(8);
        router.register_client("c1").unwrap();
        assert!(router
            .subscribe("c1", "messages", vec![], None, "ip", client_tx.clone())
            .is_ok());
        assert!(router
            .subscribe("c1", "messages", vec![], None, "ip", client_tx)
            .is_err());
    }

    #[tokio::test]
    async fn remove_client_clears_subscriptions() {
        let router = router();
        let (client_tx, _rx) = mpsc::channel(8);
        router.register_client("c1").unwrap();
        router
            .subscribe("c1", "messages", vec![], None, "ip", client_tx)
            .unwrap();
        router.remove_client("c1");
        let (clients, subs, _, _) = router.stats();
        assert_eq!(clients, 0);
        assert_eq!(subs, 0);
    }

    #[test]
    fn parse_filter_shorthand_and_operators() {
        let registry = registry();
        let snap = registry.load();

        let filters = parse_filter_json(
            &snap,
            "messages",
            &serde_json::json!({"channel": "general"}),
        )
        .unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].op, alyx_core::query::FilterOp::Eq);

        let filters = parse_filter_json(
            &snap,
            "messages",
            &serde_json::json!({"channel": {"$in": ["a", "b"]}}),
        )
        .unwrap();
        assert_eq!(filters[0].op, alyx_core::query::FilterOp::In);
        assert_eq!(filters[0].values.len(), 2);

        assert!(parse_filter_json(
            &snap,
            "messages",
            &serde_json::json!({"bogus": 1})
        )
        .is_err());
        assert!(parse_filter_json(
            &snap,
            "messages",
            &serde_json::json!({"channel": {"$frob": 1}})
        )
        .is_err());
    }
}
