//! SQLite persistence layer for the Alyx runtime.
//!
//! Single write connection + read pool (WAL mode). The data gateway is
//! the only writer to user data; every mutation validates, consults
//! the policy engine, and buffers change events until commit.

pub mod admin;
pub mod codec;
pub mod ddl;
pub mod deploy;
pub mod error;
pub mod events;
pub mod executions;
pub mod gateway;
pub mod migrate;
pub mod pool;
pub mod registry;
pub mod sessions;
pub mod system;
pub mod users;

pub use deploy::{DeployBundle, Deployer, DeploymentRecord, DeploymentStatus};
pub use error::StoreError;
pub use events::{ChangeEvent, ChangeOp, EventSink, SequencedEvent, Sequencer, SharedSink};
pub use gateway::{DataGateway, ExpandedDocument, ListResult, RequestContext};
pub use migrate::{MigrationFile, Migrator};
pub use pool::StorePool;
pub use registry::{RegistrySnapshot, SchemaRegistry};
