use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use alyx_core::query::ListQuery;
use alyx_core::value::document_to_json;
use alyx_store::executions::{ExecutionStatus, ExecutionStore};
use alyx_store::{DataGateway, RequestContext, StoreError};

use crate::config::FunctionsConfig;
use crate::functions::discovery::{discover, FunctionDef, Runtime};
use crate::functions::pool::{AcquireError, SpawnSpec, WorkerPool};
use crate::functions::worker::WorkerFailure;
use crate::metrics::Metrics;

/// Pools are per runtime; Go workers are additionally pinned to one
/// function source, so their pools key on the function name too.
type PoolKey = (Runtime, Option<String>);

/// The outcome of one invocation, whatever its terminal state.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub duration_ms: u64,
}

/// Errors raised before an invocation could run to a terminal state.
#[derive(Debug)]
pub enum InvokeError {
    UnknownFunction(String),
    PoolExhausted,
    Internal(String),
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFunction(name) => write!(f, "function '{name}' not found"),
            Self::PoolExhausted => write!(f, "no worker available within the deadline"),
            Self::Internal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for InvokeError {}

/// Routes invocations to warm workers, enforces per-call deadlines,
/// persists the execution ledger, and keeps pools warm.
pub struct FunctionExecutor {
    config: FunctionsConfig,
    functions: RwLock<HashMap<String, FunctionDef>>,
    pools: Mutex<HashMap<PoolKey, Arc<WorkerPool>>>,
    gateway: Arc<DataGateway>,
    executions: Arc<ExecutionStore>,
    metrics: Arc<Metrics>,
}

impl FunctionExecutor {
    pub fn new(
        config: FunctionsConfig,
        gateway: Arc<DataGateway>,
        executions: Arc<ExecutionStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let functions = discover(&config.dir)
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        Self {
            config,
            functions: RwLock::new(functions),
            pools: Mutex::new(HashMap::new()),
            gateway,
            executions,
            metrics,
        }
    }

    /// Re-scans the functions directory (after a deployment).
    pub fn reload(&self) {
        let functions: HashMap<String, FunctionDef> = discover(&self.config.dir)
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        info!(count = functions.len(), "functions reloaded");
        *self.functions.write() = functions;
    }

    /// The discovered functions, sorted by name.
    pub fn list(&self) -> Vec<FunctionDef> {
        let mut functions: Vec<FunctionDef> = self.functions.read().values().cloned().collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        functions
    }

    /// Brings every known runtime's pool up to `min_warm`.
    pub async fn warm_up(&self) {
        let defs = self.list();
        for def in defs {
            let pool = self.pool_for(&def).await;
            pool.refill().await;
        }
    }

    /// One pass of the background maintenance cycle: reap idle
    /// workers, refill to `min_warm`, sweep old ledger rows. Failures
    /// are logged and retried next cycle.
    pub async fn maintain(&self) {
        let pools: Vec<Arc<WorkerPool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.reap_idle().await;
            pool.refill().await;
        }
        let retain = chrono::Duration::days(i64::from(self.config.retention_days));
        match self.executions.sweep(retain) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "execution ledger swept"),
            Err(e) => warn!(error = %e, "execution sweep failed"),
        }
    }

    /// Kills every worker; used at shutdown.
    pub async fn drain(&self) {
        let pools: Vec<Arc<WorkerPool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.drain().await;
        }
    }

    /// Aggregate (ready, total) across all pools.
    pub async fn pool_stats(&self) -> (usize, usize) {
        let pools: Vec<Arc<WorkerPool>> = self.pools.lock().await.values().cloned().collect();
        let mut ready = 0;
        let mut total = 0;
        for pool in pools {
            let (r, t) = pool.stats().await;
            ready += r;
            total += t;
        }
        (ready, total)
    }

    /// Dispatches one invocation.
    ///
    /// Phases: acquire → per-call deadline → request over the RPC pipe
    /// → release. A timed-out worker is killed and never returned; the
    /// pool refills on the next maintenance pass.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
        auth: Option<serde_json::Value>,
        trigger_type: &str,
        trigger_id: Option<&str>,
        request_id: Option<&str>,
        timeout_override: Option<u64>,
    ) -> Result<InvocationOutcome, InvokeError> {
        let def = self
            .functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| InvokeError::UnknownFunction(name.to_string()))?;

        self.metrics
            .function_invocations
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let execution_id = self
            .executions
            .begin(&def.id(), request_id, trigger_type, trigger_id, Some(&input))
            .map_err(|e| InvokeError::Internal(e.to_string()))?;

        let pool = self.pool_for(&def).await;
        let started = Instant::now();

        let acquire_deadline = Duration::from_secs(self.config.pool.acquire_timeout);
        let mut worker = match pool.acquire(acquire_deadline).await {
            Ok(worker) => worker,
            Err(AcquireError::Exhausted) => {
                let _ = self.executions.finish(
                    &execution_id,
                    ExecutionStatus::Failed,
                    elapsed_ms(started),
                    None,
                    Some("pool_exhausted"),
                    &[],
                );
                return Err(InvokeError::PoolExhausted);
            }
            Err(AcquireError::Spawn(message)) => {
                let _ = self.executions.finish(
                    &execution_id,
                    ExecutionStatus::Failed,
                    elapsed_ms(started),
                    None,
                    Some(&message),
                    &[],
                );
                return Err(InvokeError::Internal(message));
            }
        };

        let timeout = Duration::from_millis(
            timeout_override
                .or(def.manifest.timeout)
                .unwrap_or(self.config.timeout),
        );
        let ctx = serde_json::json!({
            "auth": auth.clone(),
            "env": def.manifest.env,
        });

        let db_ctx = RequestContext {
            auth: auth.clone(),
            method: "FUNCTION".to_string(),
            ip: "127.0.0.1".to_string(),
            time: chrono::Utc::now(),
        };
        let gateway = Arc::clone(&self.gateway);

        let (logs, result) = worker
            .invoke(&def.path, &input, &ctx, timeout, |request| {
                handle_db_request(&gateway, &db_ctx, request)
            })
            .await;

        let duration_ms = elapsed_ms(started);
        match result {
            Ok(output) => {
                pool.release(worker).await;
                let _ = self.executions.finish(
                    &execution_id,
                    ExecutionStatus::Success,
                    duration_ms,
                    Some(&output),
                    None,
                    &logs,
                );
                Ok(InvocationOutcome {
                    execution_id,
                    status: ExecutionStatus::Success,
                    output: Some(output),
                    error: None,
                    logs,
                    duration_ms,
                })
            }
            Err(WorkerFailure::TimedOut) => {
                // The worker may be wedged mid-call; it never returns
                // to the pool.
                worker.kill().await;
                pool.discard().await;
                pool.refill().await;
                self.metrics
                    .function_timeouts
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let _ = self.executions.finish(
                    &execution_id,
                    ExecutionStatus::TimedOut,
                    duration_ms,
                    None,
                    Some("deadline exceeded"),
                    &logs,
                );
                Ok(InvocationOutcome {
                    execution_id,
                    status: ExecutionStatus::TimedOut,
                    output: None,
                    error: Some("deadline exceeded".to_string()),
                    logs,
                    duration_ms,
                })
            }
            Err(WorkerFailure::Crashed(message)) => {
                worker.kill().await;
                pool.discard().await;
                let _ = self.executions.finish(
                    &execution_id,
                    ExecutionStatus::Failed,
                    duration_ms,
                    None,
                    Some(&message),
                    &logs,
                );
                Ok(InvocationOutcome {
                    execution_id,
                    status: ExecutionStatus::Failed,
                    output: None,
                    error: Some(message),
                    logs,
                    duration_ms,
                })
            }
        }
    }

    async fn pool_for(&self, def: &FunctionDef) -> Arc<WorkerPool> {
        let key: PoolKey = match def.runtime {
            Runtime::Go => (Runtime::Go, Some(def.name.clone())),
            runtime => (runtime, None),
        };
        let mut pools = self.pools.lock().await;
        Arc::clone(pools.entry(key).or_insert_with(|| {
            Arc::new(WorkerPool::new(
                SpawnSpec {
                    runtime: def.runtime,
                    preload: (def.runtime == Runtime::Go).then(|| def.path.clone()),
                    env: def.manifest.env.clone(),
                    memory_limit_mb: def.manifest.memory.unwrap_or(self.config.pool.memory_limit),
                },
                self.config.pool.clone(),
            ))
        }))
    }
}

/// Answers a worker's mid-call data request through the gateway: the
/// same policy engine every external caller goes through. `query` and
/// `exec` are the raw escape hatch, reachable only from here.
fn handle_db_request(
    gateway: &DataGateway,
    ctx: &RequestContext,
    request: &serde_json::Value,
) -> serde_json::Value {
    let op = request.get("op").and_then(|v| v.as_str()).unwrap_or("");
    let collection = request
        .get("collection")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let result: Result<serde_json::Value, StoreError> = match op {
        "get" => {
            let id = request.get("id").and_then(|v| v.as_str()).unwrap_or("");
            gateway
                .get(collection, id, ctx)
                .map(|doc| serde_json::json!({"doc": document_to_json(&doc)}))
        }
        "list" => {
            let mut query = ListQuery::default();
            if let Some(limit) = request.get("limit").and_then(|v| v.as_u64()) {
                query.limit = Some(limit as u32);
            }
            gateway.list(collection, &query, ctx).map(|result| {
                serde_json::json!({
                    "docs": result
                        .docs
                        .iter()
                        .map(|d| document_to_json(&d.document))
                        .collect::<Vec<_>>(),
                    "total": result.total,
                })
            })
        }
        "create" => {
            let data = request.get("data").cloned().unwrap_or(serde_json::json!({}));
            gateway
                .create(collection, &data, ctx)
                .map(|doc| serde_json::json!({"doc": document_to_json(&doc)}))
        }
        "update" => {
            let id = request.get("id").and_then(|v| v.as_str()).unwrap_or("");
            let data = request.get("data").cloned().unwrap_or(serde_json::json!({}));
            gateway
                .update(collection, id, &data, ctx)
                .map(|doc| serde_json::json!({"doc": document_to_json(&doc)}))
        }
        "delete" => {
            let id = request.get("id").and_then(|v| v.as_str()).unwrap_or("");
            gateway
                .delete(collection, id, ctx)
                .map(|()| serde_json::json!({"deleted": true}))
        }
        "query" => {
            let sql = request.get("sql").and_then(|v| v.as_str()).unwrap_or("");
            let args = request
                .get("args")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            gateway
                .raw_query(sql, &args)
                .map(|rows| serde_json::json!({ "rows": rows }))
        }
        "exec" => {
            let sql = request.get("sql").and_then(|v| v.as_str()).unwrap_or("");
            let args = request
                .get("args")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            gateway
                .raw_exec(sql, &args)
                .map(|changed| serde_json::json!({ "changed": changed }))
        }
        other => Err(StoreError::Internal {
            message: format!("unknown db op '{other}'"),
        }),
    };

    match result {
        Ok(mut body) => {
            body["type"] = serde_json::json!("db_result");
            body
        }
        Err(err) => serde_json::json!({
            "type": "db_result",
            "error": {"code": err.code(), "message": err.to_string()},
        }),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use alyx_store::{SchemaRegistry, StorePool};

    fn executor(dir: &std::path::Path) -> FunctionExecutor {
        let pool = StorePool::open_in_memory().unwrap();
        alyx_store::system::bootstrap(&pool.write()).unwrap();
        let registry = Arc::new(SchemaRegistry::empty());
        let gateway = Arc::new(DataGateway::new(Arc::clone(&pool), registry));
        let executions = Arc::new(ExecutionStore::new(pool));
        FunctionExecutor::new(
            FunctionsConfig {
                dir: dir.to_path_buf(),
                ..FunctionsConfig::default()
            },
            gateway,
            executions,
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn unknown_function_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let result = exec
            .invoke("nope", serde_json::json!({}), None, "http", None, None, None)
            .await;
        assert!(matches!(result, Err(InvokeError::UnknownFunction(_))));
    }

    #[tokio::test]
    async fn discovery_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        assert!(exec.list().is_empty());

        std::fs::write(dir.path().join("hello.js"), "module.exports = () => 1").unwrap();
        exec.reload();
        let functions = exec.list();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].id(), "hello:node");
    }

    #[test]
    fn db_handler_unknown_op_is_error() {
        let pool = StorePool::open_in_memory().unwrap();
        alyx_store::system::bootstrap(&pool.write()).unwrap();
        let registry = Arc::new(SchemaRegistry::empty());
        let gateway = DataGateway::new(pool, registry);
        let ctx = RequestContext::internal();

        let reply = handle_db_request(&gateway, &ctx, &serde_json::json!({"op": "frobnicate"}));
        assert_eq!(reply["type"], "db_result");
        assert_eq!(reply["error"]["code"], "internal");
    }

    #[test]
    fn db_handler_raw_query() {
        let pool = StorePool::open_in_memory().unwrap();
        alyx_store::system::bootstrap(&pool.write()).unwrap();
        let registry = Arc::new(SchemaRegistry::empty());
        let gateway = DataGateway::new(pool, registry);
        let ctx = RequestContext::internal();

        let reply = handle_db_request(
            &gateway,
            &ctx,
            &serde_json::json!({"op": "query", "sql": "SELECT 1 AS one"}),
        );
        assert_eq!(reply["rows"][0]["one"], 1);
    }
}
