//! Config file location, load, and save.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::types::ChassisConfig;

/// `config.json` next to the executable, unless overridden.
pub fn config_path(path: Option<&str>) -> Result<PathBuf> {
    if let Some(p) = path {
        return Ok(PathBuf::from(p));
    }

    let exe_dir = std::env::current_exe()?
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine executable directory"))?
        .to_path_buf();
    Ok(exe_dir.join("config.json"))
}

/// Load and validate the configuration. A missing file yields defaults.
pub async fn load_config(path: Option<&str>) -> Result<ChassisConfig> {
    let config_path = config_path(path)?;

    let config = if config_path.exists() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read config: {:?}", config_path))?;
        let config: ChassisConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON: {:?}", config_path))?;
        info!("Loaded configuration from: {:?}", config_path);
        config
    } else {
        warn!(
            "Config file not found at {:?}; using built-in defaults. Run with --init-config to create one.",
            config_path
        );
        ChassisConfig::default()
    };

    for warning in config.validate()? {
        warn!("Config: {}", warning);
    }

    Ok(config)
}

pub async fn save_config(config: &ChassisConfig, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write config: {:?}", path))?;
    info!("Configuration saved to: {:?}", path);
    Ok(())
}
