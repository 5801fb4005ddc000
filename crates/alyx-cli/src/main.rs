mod cli;
mod commands;
mod error;
mod logging;
mod output;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    let output = output::OutputContext::from_global(&cli.global);

    let result = match cli.command {
        cli::Commands::Serve(args) => commands::serve::run(args, &cli.global, &output).await,
        cli::Commands::Validate(args) => commands::validate::run(args, &cli.global, &output).await,
        cli::Commands::Diff(args) => commands::diff::run(args, &cli.global, &output).await,
        cli::Commands::Deploy(args) => commands::deploy::run(args, &cli.global, &output).await,
        cli::Commands::Rollback(args) => commands::rollback::run(args, &cli.global, &output).await,
        cli::Commands::Migrate(args) => commands::migrate::run(args, &cli.global, &output).await,
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            output.print_error(&e);
            std::process::exit(i32::from(e.exit_code()));
        }
    }
}
