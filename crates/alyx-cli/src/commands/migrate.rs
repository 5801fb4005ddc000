use alyx_server::config::AlyxConfig;
use alyx_store::migrate::{apply_pending, verify_checksums, MigrationFile};

use crate::cli::{GlobalOpts, MigrateArgs};
use crate::error::CliError;
use crate::output::OutputContext;

pub async fn run(
    args: MigrateArgs,
    global: &GlobalOpts,
    output: &OutputContext,
) -> Result<(), CliError> {
    let config = AlyxConfig::load(Some(&global.config))?;
    let store = super::open_store(&config)?;

    let files = MigrationFile::load_dir(&args.migrations_dir).map_err(CliError::Store)?;
    verify_checksums(&store.pool.read(), &files).map_err(CliError::Store)?;
    let applied = apply_pending(&store.pool.write(), &files).map_err(CliError::Store)?;

    output.result(
        &format!("{applied} migration(s) applied ({} on disk)", files.len()),
        serde_json::json!({"applied": applied, "known": files.len()}),
    );
    Ok(())
}
