use alyx_server::config::AlyxConfig;

use crate::cli::{GlobalOpts, RollbackArgs};
use crate::error::CliError;
use crate::output::OutputContext;

pub async fn run(
    args: RollbackArgs,
    global: &GlobalOpts,
    output: &OutputContext,
) -> Result<(), CliError> {
    let config = AlyxConfig::load(Some(&global.config))?;
    let store = super::open_store(&config)?;

    let record = store
        .deployer
        .rollback(args.version, "cli")
        .map_err(CliError::Store)?;

    output.result(
        &format!(
            "rolled back to v{}: new active deployment {}",
            args.version,
            record.version_label(),
        ),
        serde_json::to_value(&record).unwrap_or_default(),
    );
    Ok(())
}
