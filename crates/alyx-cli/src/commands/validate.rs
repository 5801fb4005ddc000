use alyx_rules::RuleSet;

use crate::cli::{GlobalOpts, ValidateArgs};
use crate::error::CliError;
use crate::output::OutputContext;

pub async fn run(
    args: ValidateArgs,
    _global: &GlobalOpts,
    output: &OutputContext,
) -> Result<(), CliError> {
    let schema = super::load_schema(&args.schema)?;

    let rules = RuleSet::compile(&schema).map_err(|failures| {
        let summary: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
        CliError::Usage(summary.join("\n"))
    })?;

    output.result(
        &format!(
            "{}: {} collection(s), {} bucket(s), {} rule(s) compiled",
            args.schema.display(),
            schema.collections.len(),
            schema.buckets.len(),
            rules.len(),
        ),
        serde_json::json!({
            "valid": true,
            "collections": schema.collections.len(),
            "buckets": schema.buckets.len(),
            "rules": rules.len(),
            "hash": alyx_core::hash::schema_hash(&schema),
        }),
    );
    Ok(())
}
