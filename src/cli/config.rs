//! Optional per-tree configuration.
//!
//! A `.bdx.toml` at the binary-directory root supplies defaults for
//! indexing options. Precedence, lowest to highest: built-in
//! defaults, config file, `-o key=value` command-line overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::index::IndexingOptions;

/// File name looked up in the binary directory.
pub const CONFIG_FILENAME: &str = ".bdx.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub index: IndexSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexSection {
    pub min_symbol_size: Option<u64>,
    pub index_relocations: Option<bool>,
    pub use_compilation_database: Option<bool>,
    pub use_dwarfdump: Option<bool>,
    pub num_processes: Option<usize>,
}

/// Load the config file from `directory`, if present.
pub fn load(directory: &Path) -> Result<Option<FileConfig>> {
    let path = directory.join(CONFIG_FILENAME);
    if !path.is_file() {
        return Ok(None);
    }

    let body = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: FileConfig = toml::from_str(&body)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(config))
}

/// Overlay config-file values onto `options`.
pub fn apply(options: &mut IndexingOptions, config: &FileConfig) {
    let section = &config.index;

    if let Some(value) = section.min_symbol_size {
        options.min_symbol_size = value;
    }
    if let Some(value) = section.index_relocations {
        options.index_relocations = value;
    }
    if let Some(value) = section.use_compilation_database {
        options.use_compilation_database = value;
    }
    if let Some(value) = section.use_dwarfdump {
        options.use_dwarfdump = value;
    }
    if let Some(value) = section.num_processes {
        options.num_processes = value;
    }
}
