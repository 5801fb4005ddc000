use alyx_server::error::ServerError;
use alyx_store::StoreError;

/// CLI-level failures, each with a distinct exit code so scripts can
/// branch on outcomes.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Schema(#[from] alyx_core::SchemaError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Server(#[from] ServerError),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Usage(String),
}

impl CliError {
    /// Exit codes: 1 generic, 2 usage, 3 validation/schema, 4 store.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Schema(_) => 3,
            Self::Store(_) => 4,
            Self::Server(_) | Self::Io(_) => 1,
        }
    }
}
