//! Pipeline configuration, read from the `[pipeline]` table of a TOML file.
//!
//! ```toml
//! [pipeline]
//! follow_imports = true
//! module_mode = "main"
//! max_restarts = 500
//! expected_missing_modules = ["_winapi"]
//! ```

use super::fixpoint::DEFAULT_MAX_RESTARTS;
use crate::CompileError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum_macros::Display;

/// How the module being compiled will be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModuleMode {
    /// Imported by other code.
    #[default]
    Module,
    /// Executed as `__main__`.
    Main,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Check that imported modules can be located.
    pub follow_imports: bool,
    pub module_mode: ModuleMode,
    /// Walks a rewriting pass may restart before giving up.
    pub max_restarts: usize,
    /// Imports that are allowed to be missing without a warning.
    pub expected_missing_modules: BTreeSet<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            follow_imports: false,
            module_mode: ModuleMode::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            expected_missing_modules: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PipelineFile {
    #[serde(default)]
    pipeline: PipelineOptions,
}

impl PipelineOptions {
    /// Parse the `[pipeline]` table of a TOML document. A document without
    /// one yields the defaults; unknown keys elsewhere are ignored.
    pub fn from_toml_str(content: &str) -> Result<Self, CompileError> {
        let file: PipelineFile = toml::from_str(content)?;
        Ok(file.pipeline)
    }
}
