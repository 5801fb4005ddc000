use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Alyx: a schema-driven backend in one binary.
#[derive(Debug, Parser)]
#[command(name = "alyx", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args, Clone)]
pub struct GlobalOpts {
    /// Configuration file.
    #[arg(long, global = true, env = "ALYX_CONFIG", default_value = "alyx.toml")]
    pub config: PathBuf,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the server.
    Serve(ServeArgs),
    /// Parse and validate a schema file, compiling every rule.
    Validate(ValidateArgs),
    /// Show the change set between two schema files.
    Diff(DiffArgs),
    /// Deploy a schema (and function files) as a new active version.
    Deploy(DeployArgs),
    /// Roll back to a prior deployment version.
    Rollback(RollbackArgs),
    /// Apply pending file-based migrations.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Schema file deployed at startup when it differs from the
    /// active deployment.
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Directory of `NNNN_name.sql` migration files.
    #[arg(long, default_value = "migrations")]
    pub migrations_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Schema file to check.
    pub schema: PathBuf,
}

#[derive(Debug, Args)]
pub struct DiffArgs {
    /// The currently live schema file.
    pub old: PathBuf,
    /// The target schema file.
    pub new: PathBuf,
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Schema file to deploy.
    pub schema: PathBuf,

    /// Directory of function sources to bundle.
    #[arg(long)]
    pub functions: Option<PathBuf>,

    /// Deploy even when the change set contains unsafe changes
    /// (the unsafe changes still do not execute; supply migration
    /// files for those).
    #[arg(long)]
    pub force: bool,

    /// Free-form description recorded on the deployment.
    #[arg(long, default_value = "")]
    pub description: String,
}

#[derive(Debug, Args)]
pub struct RollbackArgs {
    /// Target version number (the `3` in `v3`).
    pub version: u64,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Directory of `NNNN_name.sql` migration files.
    #[arg(long, default_value = "migrations")]
    pub migrations_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_schema() {
        let cli = Cli::try_parse_from(["alyx", "serve", "--schema", "schema.yaml"]).unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.schema.unwrap(), PathBuf::from("schema.yaml"));
                assert_eq!(args.migrations_dir, PathBuf::from("migrations"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_deploy_with_force() {
        let cli = Cli::try_parse_from([
            "alyx", "deploy", "schema.yaml", "--force", "--description", "big bang",
        ])
        .unwrap();
        match cli.command {
            Commands::Deploy(args) => {
                assert!(args.force);
                assert_eq!(args.description, "big bang");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_json_flag_anywhere() {
        let cli = Cli::try_parse_from(["alyx", "validate", "s.yaml", "--json"]).unwrap();
        assert!(cli.global.json);
    }

    #[test]
    fn rollback_takes_numeric_version() {
        let cli = Cli::try_parse_from(["alyx", "rollback", "3"]).unwrap();
        match cli.command {
            Commands::Rollback(args) => assert_eq!(args.version, 3),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
