use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use alyx_core::hash::schema_hash;
use alyx_core::types::Schema;
use alyx_store::executions::ExecutionStore;
use alyx_store::sessions::SessionStore;
use alyx_store::users::UserStore;
use alyx_store::{
    migrate, DataGateway, DeployBundle, Deployer, EventSink, Migrator, SchemaRegistry,
    SequencedEvent, StorePool,
};

use crate::auth::{JwtKeys, OpenSignup, RateLimiter, SignupGate};
use crate::config::AlyxConfig;
use crate::error::ServerError;
use crate::functions::FunctionExecutor;
use crate::metrics::Metrics;
use crate::realtime::ChangeRouter;

/// Everything the request layer needs, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AlyxConfig>,
    pub pool: Arc<StorePool>,
    pub registry: Arc<SchemaRegistry>,
    pub gateway: Arc<DataGateway>,
    pub migrator: Arc<Migrator>,
    pub deployer: Arc<Deployer>,
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionStore>,
    pub executions: Arc<ExecutionStore>,
    pub jwt: Arc<JwtKeys>,
    pub limiter: Arc<RateLimiter>,
    pub router: Arc<ChangeRouter>,
    pub executor: Arc<FunctionExecutor>,
    pub metrics: Arc<Metrics>,
    pub signup_gate: Arc<dyn SignupGate>,
    pub started_at: Instant,
}

/// Bridges the gateway's post-commit batches into the change router.
struct RouterSink {
    router: Arc<ChangeRouter>,
}

impl EventSink for RouterSink {
    fn publish(&self, events: Vec<SequencedEvent>) {
        self.router.publish(&events);
    }
}

impl AppState {
    /// Startup, in the required order: open the store, bootstrap
    /// system tables, load the schema and compile its rules, apply
    /// pending file migrations (after verifying checksums), wire the
    /// router, warm the pools. The caller opens the listening socket
    /// last.
    pub async fn build(
        config: AlyxConfig,
        schema_path: Option<&Path>,
        migrations_dir: &Path,
    ) -> Result<Self, ServerError> {
        let pool = StorePool::open(&config.database.path)?;
        alyx_store::system::bootstrap(&pool.write())?;

        // Migration ledger first: refuse to serve on checksum drift.
        let migration_files = migrate::MigrationFile::load_dir(migrations_dir)?;
        migrate::verify_checksums(&pool.read(), &migration_files)?;
        let applied = migrate::apply_pending(&pool.write(), &migration_files)?;
        if applied > 0 {
            info!(applied, "file migrations applied");
        }

        let registry = Arc::new(SchemaRegistry::empty());
        let deployer = Arc::new(Deployer::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Some(config.functions.dir.clone()),
        ));

        // The active deployment's snapshot is the live schema. A schema
        // file on disk becomes a new deployment when it differs.
        if let Some(record) = deployer.active()? {
            let mut schema =
                Schema::parse(&record.schema_snapshot).map_err(alyx_store::StoreError::from)?;
            schema.validate().map_err(alyx_store::StoreError::from)?;
            let snapshot = alyx_store::RegistrySnapshot::compile(schema)?;
            registry.swap(snapshot);
            info!(version = record.version, "active deployment loaded");
        }

        if let Some(path) = schema_path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ServerError::Config(format!("read {}: {e}", path.display())))?;
            let mut schema = Schema::parse(&text).map_err(alyx_store::StoreError::from)?;
            schema.validate().map_err(alyx_store::StoreError::from)?;
            let hash = schema_hash(&schema);
            if registry.load().hash != hash {
                let record = deployer.execute(
                    &DeployBundle {
                        schema_text: text,
                        schema_hash: hash,
                        functions: Default::default(),
                        description: format!("schema file {}", path.display()),
                    },
                    false,
                    "startup",
                )?;
                info!(version = record.version, "schema file deployed");
            }
        }

        let gateway = Arc::new(DataGateway::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
        ));
        let router = Arc::new(ChangeRouter::new(
            Arc::clone(&registry),
            config.realtime.clone(),
        ));
        gateway.set_sink(Arc::new(RouterSink {
            router: Arc::clone(&router),
        }));

        let metrics = Arc::new(Metrics::new());
        let executions = Arc::new(ExecutionStore::new(Arc::clone(&pool)));
        let executor = Arc::new(FunctionExecutor::new(
            config.functions.clone(),
            Arc::clone(&gateway),
            Arc::clone(&executions),
            Arc::clone(&metrics),
        ));
        if config.functions.enabled {
            executor.warm_up().await;
        }

        if config.auth.jwt.secret.is_empty() {
            warn!("auth.jwt.secret is empty; tokens are forgeable: set ALYX_AUTH_JWT_SECRET");
        }

        let state = Self {
            jwt: Arc::new(JwtKeys::new(&config.auth.jwt)),
            limiter: Arc::new(RateLimiter::new(
                config
                    .auth
                    .rate_limit
                    .iter()
                    .map(|(k, v)| (k.clone(), *v)),
            )),
            users: Arc::new(UserStore::new(Arc::clone(&pool))),
            sessions: Arc::new(SessionStore::new(Arc::clone(&pool))),
            migrator: Arc::new(Migrator::new(Arc::clone(&pool))),
            signup_gate: Arc::new(OpenSignup),
            config: Arc::new(config),
            pool,
            registry,
            gateway,
            deployer,
            executions,
            router,
            executor,
            metrics,
            started_at: Instant::now(),
        };
        Ok(state)
    }

    /// Spawns the background maintenance loop: pool reaping and
    /// refill plus execution-ledger retention, on a fixed cadence.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tick.tick().await;
                executor.maintain().await;
                limiter.sweep(std::time::Duration::from_secs(600));
            }
        })
    }

    /// Shutdown, in the required order: the caller has already stopped
    /// accepting connections and drained WebSocket clients; here the
    /// pools drain and the store closes with the last Arc drop.
    pub async fn shutdown(&self) {
        self.executor.drain().await;
        info!("worker pools drained");
    }
}
