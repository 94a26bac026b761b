//! YAML configuration file loading.

use std::path::Path;

use anyhow::{Context, Result};

use super::types::Config;

/// Load, default-fill, and validate the configuration at `path`.
pub async fn load_config(path: &Path) -> Result<Config> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    config.validate().context("config validation failed")?;

    Ok(config)
}
