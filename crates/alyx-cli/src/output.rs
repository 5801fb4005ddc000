use crate::cli::GlobalOpts;

/// Text or JSON output, selected by `--json`.
pub struct OutputContext {
    json: bool,
}

impl OutputContext {
    pub fn from_global(global: &GlobalOpts) -> Self {
        Self { json: global.json }
    }

    /// Human line in text mode, swallowed in JSON mode.
    pub fn line(&self, text: &str) {
        if !self.json {
            println!("{text}");
        }
    }

    /// The machine payload; pretty text falls back to the `text` form.
    pub fn result(&self, text: &str, json: serde_json::Value) {
        if self.json {
            println!("{json}");
        } else {
            println!("{text}");
        }
    }

    pub fn print_error(&self, error: &crate::error::CliError) {
        if self.json {
            eprintln!(
                "{}",
                serde_json::json!({"error": error.to_string(), "exit_code": error.exit_code()})
            );
        } else {
            eprintln!("error: {error}");
        }
    }
}
