use std::fs;
use std::path::Path;

use electra_engine::ElectraConfig;
use tracing::debug;

use crate::error::{AppError, Result};

/// Loads the pipeline configuration, falling back to defaults without a file.
///
/// Missing keys take their default values, so a file may override a single
/// section such as `[demux]`.
pub fn load(path: Option<&Path>) -> Result<ElectraConfig> {
    let Some(path) = path else {
        return Ok(ElectraConfig::default());
    };
    let text = fs::read_to_string(path).map_err(|source| AppError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse(&text)?;
    debug!(path = %path.display(), ?config, "Loaded configuration");
    Ok(config)
}

fn parse(text: &str) -> Result<ElectraConfig> {
    Ok(toml::from_str(text)?)
}
