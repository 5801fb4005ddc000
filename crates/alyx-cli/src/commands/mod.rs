pub mod deploy;
pub mod diff;
pub mod migrate;
pub mod rollback;
pub mod serve;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use alyx_core::types::Schema;
use alyx_server::config::AlyxConfig;
use alyx_store::{Deployer, SchemaRegistry, StorePool};

use crate::error::CliError;

/// Reads and structurally validates a schema file.
pub fn load_schema(path: &Path) -> Result<Schema, CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::Io(format!("read {}: {e}", path.display())))?;
    let mut schema = Schema::parse(&text)?;
    schema.validate()?;
    Ok(schema)
}

/// The store stack the offline commands (deploy, rollback, migrate)
/// share: pool, bootstrap, registry primed from the active deployment.
pub struct OfflineStore {
    pub pool: Arc<StorePool>,
    pub deployer: Deployer,
}

pub fn open_store(config: &AlyxConfig) -> Result<OfflineStore, CliError> {
    let pool = StorePool::open(&config.database.path).map_err(CliError::Store)?;
    alyx_store::system::bootstrap(&pool.write()).map_err(CliError::Store)?;
    let registry = Arc::new(SchemaRegistry::empty());
    let deployer = Deployer::new(
        Arc::clone(&pool),
        Arc::clone(&registry),
        Some(config.functions.dir.clone()),
    );
    if let Some(active) = deployer.active().map_err(CliError::Store)? {
        let mut schema = Schema::parse(&active.schema_snapshot)?;
        schema.validate()?;
        let snapshot =
            alyx_store::RegistrySnapshot::compile(schema).map_err(CliError::Store)?;
        registry.swap(snapshot);
    }
    Ok(OfflineStore { pool, deployer })
}
