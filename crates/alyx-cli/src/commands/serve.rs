use alyx_server::config::AlyxConfig;
use alyx_server::state::AppState;

use crate::cli::{GlobalOpts, ServeArgs};
use crate::error::CliError;
use crate::output::OutputContext;

pub async fn run(
    args: ServeArgs,
    global: &GlobalOpts,
    output: &OutputContext,
) -> Result<(), CliError> {
    let config = AlyxConfig::load(Some(&global.config))?;
    crate::logging::init(&config.logging);

    output.line(&format!("alyx serving on {}", config.bind_addr()));
    let state = AppState::build(config, args.schema.as_deref(), &args.migrations_dir).await?;
    alyx_server::serve(state).await?;
    Ok(())
}
