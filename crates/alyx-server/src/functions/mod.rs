pub mod discovery;
pub mod executor;
pub mod pool;
pub mod worker;

pub use discovery::{discover, FunctionDef, FunctionManifest, Runtime};
pub use executor::{FunctionExecutor, InvocationOutcome, InvokeError};
pub use pool::{AcquireError, SpawnSpec, WorkerPool};
