use std::collections::BTreeMap;

use alyx_server::config::AlyxConfig;
use alyx_store::DeployBundle;

use crate::cli::{DeployArgs, GlobalOpts};
use crate::error::CliError;
use crate::output::OutputContext;

pub async fn run(
    args: DeployArgs,
    global: &GlobalOpts,
    output: &OutputContext,
) -> Result<(), CliError> {
    let config = AlyxConfig::load(Some(&global.config))?;
    let schema = super::load_schema(&args.schema)?;
    let schema_text = std::fs::read_to_string(&args.schema)
        .map_err(|e| CliError::Io(format!("read {}: {e}", args.schema.display())))?;

    let mut functions = BTreeMap::new();
    if let Some(dir) = &args.functions {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CliError::Io(format!("read {}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| CliError::Io(e.to_string()))?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let source = std::fs::read_to_string(entry.path())
                .map_err(|e| CliError::Io(format!("read {name}: {e}")))?;
            functions.insert(name, source);
        }
    }

    let bundle = DeployBundle {
        schema_hash: alyx_core::hash::schema_hash(&schema),
        schema_text,
        functions,
        description: args.description.clone(),
    };

    let store = super::open_store(&config)?;
    let record = store
        .deployer
        .execute(&bundle, args.force, "cli")
        .map_err(CliError::Store)?;

    output.result(
        &format!(
            "deployed {} ({} function file(s)), schema {}",
            record.version_label(),
            record.functions_snapshot.len(),
            &record.schema_hash[..12],
        ),
        serde_json::to_value(&record).unwrap_or_default(),
    );
    Ok(())
}
