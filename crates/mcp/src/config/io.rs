//! Configuration file loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dirs_next::{config_dir, home_dir};

use crate::config::{ConfigError, ToolmuxConfig, interpolate_config, validate_config};

/// Returns the default path for the configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var("TOOLMUX_CONFIG")
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("toolmux").join("mcp.json")
}

/// Loads and parses configuration from the default path.
pub fn load_config() -> Result<ToolmuxConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

/// Loads, interpolates and validates configuration from a specific path.
///
/// A missing file yields the default (empty) configuration.
pub fn load_config_from_path(path: &Path) -> Result<ToolmuxConfig, ConfigError> {
    if !path.exists() {
        return Ok(ToolmuxConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let mut config: ToolmuxConfig = serde_json::from_str(&content)?;
    interpolate_config(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    if p == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(p)
}
