use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::Connection;
use tracing::debug;

use alyx_core::query::{Filter, FilterOp, ListQuery, Sort};
use alyx_core::types::{FieldType, OnDelete, Operation};
use alyx_core::value::{Document, Value};
use alyx_rules::EvalContext;

use crate::codec::{row_to_document, value_to_sql};
use crate::error::StoreError;
use crate::events::{
    ChangeEvent, ChangeOp, EventSink, NullSink, SequencedEvent, Sequencer, SharedSink,
};
use crate::pool::StorePool;
use crate::registry::{RegistrySnapshot, SchemaRegistry, TablePlan};

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Everything a policy check can observe about the calling request.
///
/// The instant is captured once when the request enters the system, so
/// every rule evaluated for it sees the same `request.time`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Verified claims (`{id, email, verified, role, metadata}`), or
    /// `None` for anonymous callers.
    pub auth: Option<serde_json::Value>,
    pub method: String,
    pub ip: String,
    pub time: DateTime<Utc>,
}

impl RequestContext {
    /// An anonymous context.
    pub fn anonymous(method: &str, ip: &str) -> Self {
        Self {
            auth: None,
            method: method.to_string(),
            ip: ip.to_string(),
            time: Utc::now(),
        }
    }

    /// The context function-runtime DB calls evaluate under when the
    /// invocation carried no caller auth.
    pub fn internal() -> Self {
        Self::anonymous("INTERNAL", "127.0.0.1")
    }

    /// Builds the rule evaluation context for a document.
    pub fn eval_ctx(&self, doc: &Document) -> EvalContext {
        self.base_ctx().with_doc(doc)
    }

    /// Like [`Self::eval_ctx`], with the pre-update document nested
    /// under `doc.previous`.
    pub fn eval_ctx_with_previous(&self, doc: &Document, previous: &Document) -> EvalContext {
        self.base_ctx().with_doc(doc).with_previous(previous)
    }

    fn base_ctx(&self) -> EvalContext {
        let mut ctx = EvalContext::new().with_request(&self.method, &self.ip, self.time);
        if let Some(auth) = &self.auth {
            ctx = ctx.with_auth(auth);
        }
        ctx
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A document plus its requested foreign-key expansions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedDocument {
    pub document: Document,
    /// Expand field name to the referenced document.
    pub expand: BTreeMap<String, Document>,
}

/// The result of a list query after policy filtering.
#[derive(Debug, Clone)]
pub struct ListResult {
    pub docs: Vec<ExpandedDocument>,
    /// Total matching rows the caller may read; policy-filtered rows
    /// do not count.
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

// ---------------------------------------------------------------------------
// DataGateway
// ---------------------------------------------------------------------------

/// The only writer to user data.
///
/// Every mutation validates, consults the policy engine, executes on
/// the single write connection, and buffers its change events until
/// the transaction commits. Events are dropped on rollback; sequence
/// numbers are assigned while the writer lock is still held, so stamp
/// order always equals commit order.
pub struct DataGateway {
    pool: Arc<StorePool>,
    registry: Arc<SchemaRegistry>,
    sequencer: Sequencer,
    sink: RwLock<SharedSink>,
}

impl DataGateway {
    pub fn new(pool: Arc<StorePool>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            pool,
            registry,
            sequencer: Sequencer::new(),
            sink: RwLock::new(Arc::new(NullSink)),
        }
    }

    /// Wires the post-commit event sink (the change router).
    pub fn set_sink(&self, sink: SharedSink) {
        *self.sink.write() = sink;
    }

    /// The event sequencer; the router reads the cursor for snapshots.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// The registry this gateway serves.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    // -- Create ------------------------------------------------------------

    /// Apply defaults, validate, check the `create` policy with the
    /// incoming document, insert, and emit `insert`.
    pub fn create(
        &self,
        collection: &str,
        input: &serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<Document, StoreError> {
        let snap = self.registry.load();
        let plan = snap.plan(collection)?;

        let doc = self.build_document(&snap, plan, input, ctx.time)?;

        if !snap
            .rules
            .check_collection(collection, Operation::Create, &ctx.eval_ctx(&doc))
        {
            return Err(StoreError::AccessDenied {
                collection: collection.to_string(),
                operation: Operation::Create.as_str().to_string(),
            });
        }

        let stamped = {
            let conn = self.pool.write();
            let params: Vec<_> = plan
                .columns
                .iter()
                .map(|c| value_to_sql(doc.get(&c.name).unwrap_or(&Value::Null)))
                .collect();
            conn.execute(
                &plan.insert_sql,
                rusqlite::params_from_iter(params.iter()),
            )
            .map_err(|e| StoreError::classify(collection, e))?;
            // Stamp before the writer guard drops: sequence order is
            // commit order.
            self.sequencer.stamp(vec![ChangeEvent {
                collection: collection.to_string(),
                op: ChangeOp::Insert,
                document: doc.clone(),
                previous_document: None,
                at: ctx.time,
            }])
        };

        self.dispatch(stamped);
        Ok(doc)
    }

    // -- Read --------------------------------------------------------------

    /// Fetch one document by primary key, gated by the `read` policy.
    pub fn get(
        &self,
        collection: &str,
        id: &str,
        ctx: &RequestContext,
    ) -> Result<Document, StoreError> {
        let snap = self.registry.load();
        let plan = snap.plan(collection)?;
        let doc = self.fetch_by_id(&self.pool.read(), plan, collection, id)?;

        if !snap
            .rules
            .check_collection(collection, Operation::Read, &ctx.eval_ctx(&doc))
        {
            return Err(StoreError::AccessDenied {
                collection: collection.to_string(),
                operation: Operation::Read.as_str().to_string(),
            });
        }
        Ok(doc)
    }

    /// List documents: filter, search, sort, paginate, expand.
    ///
    /// The `read` policy runs per row; rows it rejects are invisible
    /// and do not count toward `total`.
    pub fn list(
        &self,
        collection: &str,
        query: &ListQuery,
        ctx: &RequestContext,
    ) -> Result<ListResult, StoreError> {
        let snap = self.registry.load();
        let plan = snap.plan(collection)?;

        let (sql, params) = build_list_sql(&snap, plan, collection, query)?;
        let rows = {
            let conn = self.pool.read();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::classify(collection, e))?;
            let mapped = stmt
                .query_map(
                    rusqlite::params_from_iter(params.iter().map(value_to_sql)),
                    |row| {
                        // Defer typed decoding; rusqlite errors here
                        // abort the whole query.
                        row_to_document(row, plan).map_err(|e| {
                            rusqlite::Error::UserFunctionError(Box::new(e))
                        })
                    },
                )
                .map_err(|e| StoreError::classify(collection, e))?;
            mapped
                .collect::<Result<Vec<Document>, _>>()
                .map_err(|e| StoreError::classify(collection, e))?
        };

        // Policy filter in memory; pagination applies to what the
        // caller is allowed to see.
        let readable: Vec<Document> = rows
            .into_iter()
            .filter(|doc| {
                snap.rules
                    .check_collection(collection, Operation::Read, &ctx.eval_ctx(doc))
            })
            .collect();

        let total = readable.len() as u64;
        let limit = query.effective_limit();
        let offset = query.effective_offset();
        let page: Vec<Document> = readable
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();

        let docs = self.expand(&snap, collection, page, &query.expand, ctx)?;

        Ok(ListResult {
            docs,
            total,
            limit,
            offset,
        })
    }

    // -- Update ------------------------------------------------------------

    /// Merge the patch over the current document, validate, check the
    /// `update` policy with the next document (previous values under
    /// `doc.previous`), write, and emit `update`.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<Document, StoreError> {
        let snap = self.registry.load();
        let plan = snap.plan(collection)?;
        let definition = snap
            .schema
            .collection(collection)
            .ok_or_else(|| StoreError::UnknownCollection {
                name: collection.to_string(),
            })?;

        let previous = self.fetch_by_id(&self.pool.read(), plan, collection, id)?;

        // Merge patch field-by-field; unknown and internal fields are
        // rejected as validation failures.
        let mut next = previous.clone();
        let mut failures = BTreeMap::new();
        let patch_map = patch.as_object().ok_or_else(|| StoreError::ValidationFailed {
            fields: BTreeMap::from([("body".to_string(), "object".to_string())]),
        })?;
        for (key, json) in patch_map {
            let Some(field) = definition.field(key) else {
                failures.insert(key.clone(), "unknown".to_string());
                continue;
            };
            if field.internal || field.primary {
                failures.insert(key.clone(), "readonly".to_string());
                continue;
            }
            match Value::from_json(json, field.field_type) {
                Some(Value::Null) if !field.nullable => {
                    failures.insert(key.clone(), "required".to_string());
                }
                Some(value) => {
                    next.insert(key.clone(), value);
                }
                None => {
                    failures.insert(key.clone(), format!("type:{}", field.field_type));
                }
            }
        }
        if !failures.is_empty() {
            return Err(StoreError::ValidationFailed { fields: failures });
        }

        // Refresh on_update timestamps.
        for field in &definition.fields {
            if field.on_update {
                next.insert(
                    field.name.as_str().to_string(),
                    Value::Timestamp(ctx.time),
                );
            }
        }

        self.validate_document(definition, &next)?;

        if !snap.rules.check_collection(
            collection,
            Operation::Update,
            &ctx.eval_ctx_with_previous(&next, &previous),
        ) {
            return Err(StoreError::AccessDenied {
                collection: collection.to_string(),
                operation: Operation::Update.as_str().to_string(),
            });
        }

        let stamped = {
            let conn = self.pool.write();
            let assignments: Vec<String> = plan
                .columns
                .iter()
                .filter(|c| c.name != plan.primary)
                .enumerate()
                .map(|(i, c)| format!("\"{}\" = ?{}", c.name, i + 2))
                .collect();
            let sql = format!(
                "UPDATE \"{}\" SET {} WHERE \"{}\" = ?1",
                collection,
                assignments.join(", "),
                plan.primary
            );
            let mut params: Vec<Value> = vec![primary_value(&previous, &plan.primary)];
            for column in plan.columns.iter().filter(|c| c.name != plan.primary) {
                params.push(next.get(&column.name).cloned().unwrap_or(Value::Null));
            }
            let changed = conn
                .execute(&sql, rusqlite::params_from_iter(params.iter().map(value_to_sql)))
                .map_err(|e| StoreError::classify(collection, e))?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            // Stamp under the same writer guard as the commit.
            self.sequencer.stamp(vec![ChangeEvent {
                collection: collection.to_string(),
                op: ChangeOp::Update,
                document: next.clone(),
                previous_document: Some(previous),
                at: ctx.time,
            }])
        };

        self.dispatch(stamped);
        Ok(next)
    }

    // -- Delete ------------------------------------------------------------

    /// Check the `delete` policy with the current document, honor the
    /// `on_delete` edges, and emit `delete` (cascades and set-null
    /// writes emit their own events, all in one transaction).
    pub fn delete(
        &self,
        collection: &str,
        id: &str,
        ctx: &RequestContext,
    ) -> Result<(), StoreError> {
        let snap = self.registry.load();
        let plan = snap.plan(collection)?;
        let doc = self.fetch_by_id(&self.pool.read(), plan, collection, id)?;

        if !snap
            .rules
            .check_collection(collection, Operation::Delete, &ctx.eval_ctx(&doc))
        {
            return Err(StoreError::AccessDenied {
                collection: collection.to_string(),
                operation: Operation::Delete.as_str().to_string(),
            });
        }

        let mut events = Vec::new();
        let stamped = {
            let conn = self.pool.write();
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| StoreError::classify(collection, e))?;
            let result =
                self.delete_tree(&conn, &snap, collection, &doc, ctx.time, &mut events);
            match result {
                Ok(()) => {
                    if let Err(e) = conn.execute_batch("COMMIT") {
                        let _ = conn.execute_batch("ROLLBACK");
                        return Err(StoreError::classify(collection, e));
                    }
                }
                Err(err) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    // Buffered events die with the transaction.
                    return Err(err);
                }
            }
            // The whole batch is stamped inside the writer critical
            // section, so no later commit can interleave its numbers.
            self.sequencer.stamp(events)
        };

        self.dispatch(stamped);
        Ok(())
    }

    /// Depth-first referential walk. Children are handled before the
    /// row itself so the FK constraints hold at every statement.
    fn delete_tree(
        &self,
        conn: &Connection,
        snap: &RegistrySnapshot,
        collection: &str,
        doc: &Document,
        at: DateTime<Utc>,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<(), StoreError> {
        let plan = snap.plan(collection)?;
        let pk = primary_value(doc, &plan.primary);

        for (referrer, field) in snap.referrers(collection) {
            let referrer_name = referrer.name.as_str();
            let referrer_plan = snap.plan(referrer_name)?;
            let reference = field.references.as_ref().expect("referrer has reference");
            let target_value = doc
                .get(reference.field.as_str())
                .cloned()
                .unwrap_or(Value::Null);

            let sql = format!(
                "{} WHERE \"{}\" = ?1",
                referrer_plan.select_sql, field.name
            );
            let children: Vec<Document> = {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| StoreError::classify(referrer_name, e))?;
                let mapped = stmt
                    .query_map([value_to_sql(&target_value)], |row| {
                        row_to_document(row, referrer_plan)
                            .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
                    })
                    .map_err(|e| StoreError::classify(referrer_name, e))?;
                mapped
                    .collect::<Result<_, _>>()
                    .map_err(|e| StoreError::classify(referrer_name, e))?
            };

            if children.is_empty() {
                continue;
            }

            match field.on_delete.unwrap_or(OnDelete::Restrict) {
                OnDelete::Restrict => {
                    return Err(StoreError::ForeignKeyRestrict {
                        collection: collection.to_string(),
                        referrer: format!("{referrer_name}.{}", field.name),
                    });
                }
                OnDelete::Cascade => {
                    for child in children {
                        self.delete_tree(conn, snap, referrer_name, &child, at, events)?;
                    }
                }
                OnDelete::SetNull => {
                    for child in children {
                        let mut nulled = child.clone();
                        nulled.insert(field.name.as_str().to_string(), Value::Null);
                        let child_pk = primary_value(&child, &referrer_plan.primary);
                        conn.execute(
                            &format!(
                                "UPDATE \"{}\" SET \"{}\" = NULL WHERE \"{}\" = ?1",
                                referrer_name, field.name, referrer_plan.primary
                            ),
                            [value_to_sql(&child_pk)],
                        )
                        .map_err(|e| StoreError::classify(referrer_name, e))?;
                        events.push(ChangeEvent {
                            collection: referrer_name.to_string(),
                            op: ChangeOp::Update,
                            document: nulled,
                            previous_document: Some(child),
                            at,
                        });
                    }
                }
                _ => unreachable!("OnDelete is non_exhaustive but all variants are handled"),
            }
        }

        conn.execute(
            &format!(
                "DELETE FROM \"{}\" WHERE \"{}\" = ?1",
                collection, plan.primary
            ),
            [value_to_sql(&pk)],
        )
        .map_err(|e| StoreError::classify(collection, e))?;

        events.push(ChangeEvent {
            collection: collection.to_string(),
            op: ChangeOp::Delete,
            document: doc.clone(),
            previous_document: None,
            at,
        });
        Ok(())
    }

    // -- Raw escape hatch --------------------------------------------------

    /// Read-only raw SQL for function runtime contexts. Not guarded by
    /// policy; never exposed over REST.
    pub fn raw_query(
        &self,
        sql: &str,
        args: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, StoreError> {
        let conn = self.pool.read();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StoreError::classify("raw", e))?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let params: Vec<_> = args.iter().map(json_to_sql).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let mut obj = serde_json::Map::new();
                for (i, name) in names.iter().enumerate() {
                    obj.insert(name.clone(), raw_column_json(row, i)?);
                }
                Ok(obj)
            })
            .map_err(|e| StoreError::classify("raw", e))?;
        rows.collect::<Result<_, _>>()
            .map_err(|e| StoreError::classify("raw", e))
    }

    /// Raw write for function runtime contexts; returns affected rows.
    /// No change events are emitted for raw writes.
    pub fn raw_exec(&self, sql: &str, args: &[serde_json::Value]) -> Result<u64, StoreError> {
        let conn = self.pool.write();
        let params: Vec<_> = args.iter().map(json_to_sql).collect();
        let changed = conn
            .execute(sql, rusqlite::params_from_iter(params.iter()))
            .map_err(|e| StoreError::classify("raw", e))?;
        Ok(changed as u64)
    }

    // -- Internals ---------------------------------------------------------

    fn fetch_by_id(
        &self,
        conn: &Connection,
        plan: &TablePlan,
        collection: &str,
        id: &str,
    ) -> Result<Document, StoreError> {
        let primary_type = plan
            .column(&plan.primary)
            .map(|c| c.field_type)
            .unwrap_or(FieldType::Uuid);
        let key = Value::from_json(&serde_json::Value::String(id.to_string()), primary_type)
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        let sql = format!("{} WHERE \"{}\" = ?1", plan.select_sql, plan.primary);
        conn.query_row(&sql, [value_to_sql(&key)], |row| {
            row_to_document(row, plan).map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            },
            other => StoreError::classify(collection, other),
        })
    }

    /// Applies defaults and validation to an incoming create body.
    fn build_document(
        &self,
        snap: &RegistrySnapshot,
        plan: &TablePlan,
        input: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError> {
        let definition = snap
            .schema
            .collection(&plan.collection)
            .ok_or_else(|| StoreError::UnknownCollection {
                name: plan.collection.clone(),
            })?;
        let body = input.as_object();

        let mut doc = Document::new();
        let mut failures = BTreeMap::new();

        for field in &definition.fields {
            let name = field.name.as_str();
            let supplied = if field.internal {
                None
            } else {
                body.and_then(|b| b.get(name))
            };

            let value = match supplied {
                Some(json) if !json.is_null() => {
                    match Value::from_json(json, field.field_type) {
                        Some(v) => v,
                        None => {
                            failures
                                .insert(name.to_string(), format!("type:{}", field.field_type));
                            continue;
                        }
                    }
                }
                _ => {
                    if field.on_update && field.field_type == FieldType::Timestamp {
                        Value::Timestamp(now)
                    } else if let Some(default) = &field.default {
                        match default.materialize(field.field_type, now) {
                            Some(v) => v,
                            None => {
                                failures.insert(name.to_string(), "default".to_string());
                                continue;
                            }
                        }
                    } else if field.nullable {
                        Value::Null
                    } else {
                        failures.insert(name.to_string(), "required".to_string());
                        continue;
                    }
                }
            };
            doc.insert(name.to_string(), value);
        }

        if let Some(body) = body {
            for key in body.keys() {
                if definition.field(key).is_none() {
                    failures.insert(key.clone(), "unknown".to_string());
                }
            }
        }

        if !failures.is_empty() {
            return Err(StoreError::ValidationFailed { fields: failures });
        }

        self.validate_document(definition, &doc)?;
        Ok(doc)
    }

    /// Runs field constraints over a complete document.
    fn validate_document(
        &self,
        definition: &alyx_core::types::Collection,
        doc: &Document,
    ) -> Result<(), StoreError> {
        let mut failures = BTreeMap::new();
        for field in &definition.fields {
            let value = doc
                .get(field.name.as_str())
                .cloned()
                .unwrap_or(Value::Null);
            if value.is_null() && !field.nullable && field.default.is_none() && !field.primary {
                failures.insert(field.name.as_str().to_string(), "required".to_string());
                continue;
            }
            if let Err(constraint) = field.validate.check(&value) {
                failures.insert(field.name.as_str().to_string(), constraint);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::ValidationFailed { fields: failures })
        }
    }

    /// Bulk foreign-key dereference: one grouped lookup per expand
    /// field, then attach per document.
    fn expand(
        &self,
        snap: &RegistrySnapshot,
        collection: &str,
        docs: Vec<Document>,
        expand_fields: &[String],
        _ctx: &RequestContext,
    ) -> Result<Vec<ExpandedDocument>, StoreError> {
        if expand_fields.is_empty() {
            return Ok(docs
                .into_iter()
                .map(|document| ExpandedDocument {
                    document,
                    expand: BTreeMap::new(),
                })
                .collect());
        }

        let definition = snap
            .schema
            .collection(collection)
            .ok_or_else(|| StoreError::UnknownCollection {
                name: collection.to_string(),
            })?;

        // field -> (target collection, target field, key -> document)
        let mut lookups: BTreeMap<String, (String, String, BTreeMap<String, Document>)> =
            BTreeMap::new();

        for expand_field in expand_fields {
            let Some(field) = definition.field(expand_field) else {
                continue;
            };
            let Some(reference) = &field.references else {
                continue;
            };
            let target = reference.collection.as_str();
            let target_plan = snap.plan(target)?;

            let mut keys: Vec<Value> = Vec::new();
            for doc in &docs {
                if let Some(v) = doc.get(expand_field) {
                    if !v.is_null() && !keys.contains(v) {
                        keys.push(v.clone());
                    }
                }
            }
            if keys.is_empty() {
                lookups.insert(
                    expand_field.clone(),
                    (
                        target.to_string(),
                        reference.field.as_str().to_string(),
                        BTreeMap::new(),
                    ),
                );
                continue;
            }

            let placeholders: Vec<String> =
                (1..=keys.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "{} WHERE \"{}\" IN ({})",
                target_plan.select_sql,
                reference.field,
                placeholders.join(", ")
            );
            let conn = self.pool.read();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::classify(target, e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(keys.iter().map(value_to_sql)),
                    |row| {
                        row_to_document(row, target_plan)
                            .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
                    },
                )
                .map_err(|e| StoreError::classify(target, e))?;

            let mut by_key = BTreeMap::new();
            for row in rows {
                let row = row.map_err(|e| StoreError::classify(target, e))?;
                if let Some(key) = row.get(reference.field.as_str()) {
                    by_key.insert(key.to_json().to_string(), row.clone());
                }
            }
            lookups.insert(
                expand_field.clone(),
                (
                    target.to_string(),
                    reference.field.as_str().to_string(),
                    by_key,
                ),
            );
        }

        Ok(docs
            .into_iter()
            .map(|document| {
                let mut expand = BTreeMap::new();
                for (field, (_, _, by_key)) in &lookups {
                    if let Some(value) = document.get(field) {
                        if let Some(target_doc) = by_key.get(&value.to_json().to_string()) {
                            expand.insert(field.clone(), target_doc.clone());
                        }
                    }
                }
                ExpandedDocument { document, expand }
            })
            .collect())
    }

    /// Hands a committed, already-stamped batch to the sink. Stamping
    /// happens inside the writer critical section; delivery does not
    /// need the lock and never blocks.
    fn dispatch(&self, events: Vec<SequencedEvent>) {
        if events.is_empty() {
            return;
        }
        debug!(count = events.len(), "publishing change events");
        self.sink.read().publish(events);
    }
}

fn primary_value(doc: &Document, primary: &str) -> Value {
    doc.get(primary).cloned().unwrap_or(Value::Null)
}

fn json_to_sql(json: &serde_json::Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match json {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn raw_column_json(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> Result<serde_json::Value, rusqlite::Error> {
    use rusqlite::types::ValueRef;
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(v) => serde_json::Value::from(v),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    })
}

/// Builds the filtered/sorted list SQL with positional params.
fn build_list_sql(
    snap: &RegistrySnapshot,
    plan: &TablePlan,
    collection: &str,
    query: &ListQuery,
) -> Result<(String, Vec<Value>), StoreError> {
    let definition = snap
        .schema
        .collection(collection)
        .ok_or_else(|| StoreError::UnknownCollection {
            name: collection.to_string(),
        })?;

    let mut sql = plan.select_sql.clone();
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    for filter in &query.filters {
        if plan.column(&filter.field).is_none() {
            return Err(StoreError::ValidationFailed {
                fields: BTreeMap::from([(filter.field.clone(), "unknown".to_string())]),
            });
        }
        clauses.push(filter_clause(filter, &mut params));
    }

    if let Some(needle) = &query.search {
        let text_columns: Vec<&str> = definition
            .fields
            .iter()
            .filter(|f| {
                matches!(f.field_type, FieldType::String | FieldType::Text) && !f.internal
            })
            .map(|f| f.name.as_str())
            .collect();
        if !text_columns.is_empty() {
            let like = format!("%{needle}%");
            let ors: Vec<String> = text_columns
                .iter()
                .map(|c| {
                    params.push(Value::String(like.clone()));
                    format!("\"{}\" LIKE ?{}", c, params.len())
                })
                .collect();
            clauses.push(format!("({})", ors.join(" OR ")));
        }
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    let sort = query.sort.clone().unwrap_or(Sort {
        field: plan.primary.clone(),
        descending: false,
    });
    if plan.column(&sort.field).is_none() {
        return Err(StoreError::ValidationFailed {
            fields: BTreeMap::from([(sort.field.clone(), "unknown".to_string())]),
        });
    }
    sql.push_str(&format!(
        " ORDER BY \"{}\" {}",
        sort.field,
        if sort.descending { "DESC" } else { "ASC" }
    ));

    Ok((sql, params))
}

fn filter_clause(filter: &Filter, params: &mut Vec<Value>) -> String {
    match filter.op {
        FilterOp::Eq
        | FilterOp::Ne
        | FilterOp::Gt
        | FilterOp::Gte
        | FilterOp::Lt
        | FilterOp::Lte => {
            let value = filter.values.first().cloned().unwrap_or(Value::Null);
            // `= NULL` never matches; spell out IS NULL.
            if value.is_null() && filter.op == FilterOp::Eq {
                return format!("\"{}\" IS NULL", filter.field);
            }
            if value.is_null() && filter.op == FilterOp::Ne {
                return format!("\"{}\" IS NOT NULL", filter.field);
            }
            params.push(value);
            let op = match filter.op {
                FilterOp::Eq => "=",
                FilterOp::Ne => "!=",
                FilterOp::Gt => ">",
                FilterOp::Gte => ">=",
                FilterOp::Lt => "<",
                FilterOp::Lte => "<=",
                _ => unreachable!(),
            };
            format!("\"{}\" {} ?{}", filter.field, op, params.len())
        }
        FilterOp::In => {
            if filter.values.is_empty() {
                return "0 = 1".to_string();
            }
            let placeholders: Vec<String> = filter
                .values
                .iter()
                .map(|v| {
                    params.push(v.clone());
                    format!("?{}", params.len())
                })
                .collect();
            format!("\"{}\" IN ({})", filter.field, placeholders.join(", "))
        }
        FilterOp::Like => {
            let value = filter.values.first().cloned().unwrap_or(Value::Null);
            params.push(value);
            format!("\"{}\" LIKE ?{}", filter.field, params.len())
        }
        FilterOp::Contains => {
            let needle = match filter.values.first() {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_json().to_string(),
                None => String::new(),
            };
            params.push(Value::String(format!("%{needle}%")));
            format!("\"{}\" LIKE ?{}", filter.field, params.len())
        }
        _ => unreachable!("FilterOp is non_exhaustive but all variants are handled"),
    }
}
