use alyx_core::diff::SchemaDiff;

use crate::cli::{DiffArgs, GlobalOpts};
use crate::error::CliError;
use crate::output::OutputContext;

pub async fn run(
    args: DiffArgs,
    _global: &GlobalOpts,
    output: &OutputContext,
) -> Result<(), CliError> {
    let old = super::load_schema(&args.old)?;
    let new = super::load_schema(&args.new)?;

    let changes = SchemaDiff::diff(&old, &new);
    if changes.is_empty() {
        output.result("schemas are identical", serde_json::json!({"changes": []}));
        return Ok(());
    }

    output.result(
        &changes.to_string(),
        serde_json::to_value(&changes).unwrap_or_default(),
    );
    if !changes.is_safe() {
        output.line("unsafe changes require a migration file before deploy");
    }
    Ok(())
}
