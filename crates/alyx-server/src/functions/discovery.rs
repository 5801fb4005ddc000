use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The language runtimes the executor can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Python,
    Go,
}

impl Runtime {
    /// Maps a source file extension to its runtime.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "js" | "mjs" | "cjs" => Some(Self::Node),
            "py" => Some(Self::Python),
            "go" => Some(Self::Go),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python",
            Self::Go => "go",
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optional per-function manifest, from a `<name>.manifest.json`
/// sidecar next to the source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FunctionManifest {
    /// Per-call timeout in milliseconds; overrides the global default.
    pub timeout: Option<u64>,
    /// Memory cap in MiB; overrides the pool default.
    pub memory: Option<u64>,
    /// Extra environment exposed to the function.
    pub env: BTreeMap<String, String>,
    /// Declared input JSON schema (advisory; surfaced to tooling).
    pub input_schema: Option<serde_json::Value>,
    /// Declared output JSON schema (advisory).
    pub output_schema: Option<serde_json::Value>,
}

/// A discovered function: `(name, runtime)` plus its source path.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub runtime: Runtime,
    pub path: PathBuf,
    pub manifest: FunctionManifest,
}

impl FunctionDef {
    /// The ledger identity: `"<name>:<runtime>"`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.name, self.runtime)
    }
}

/// Scans the functions directory. File stem is the function name,
/// extension selects the runtime; unknown extensions and manifest
/// sidecars are skipped.
pub fn discover(dir: &Path) -> Vec<FunctionDef> {
    let mut functions = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            debug!(dir = %dir.display(), "functions directory missing, none discovered");
            return functions;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if name.ends_with(".manifest") {
            continue;
        }
        let Some(runtime) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Runtime::from_extension)
        else {
            continue;
        };

        let manifest_path = dir.join(format!("{name}.manifest.json"));
        let manifest = if manifest_path.exists() {
            match std::fs::read_to_string(&manifest_path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
            {
                Some(manifest) => manifest,
                None => {
                    warn!(function = name, "unreadable manifest, using defaults");
                    FunctionManifest::default()
                }
            }
        } else {
            FunctionManifest::default()
        };

        functions.push(FunctionDef {
            name: name.to_string(),
            runtime,
            path,
            manifest,
        });
    }

    functions.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(count = functions.len(), "functions discovered");
    functions
}
