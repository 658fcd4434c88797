//! `${env:NAME}` interpolation for server configuration values.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ServerConfig, ToolmuxConfig};

static ENV_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{env:([A-Za-z0-9_]+)\}").expect("env interpolation regex should compile"));

/// Interpolate every server of a configuration file.
///
/// A server whose placeholders cannot be resolved is disabled rather than failing the whole
/// file, so the remaining servers still load.
pub fn interpolate_config(config: &mut ToolmuxConfig) {
    for (name, server) in config.mcp_servers.iter_mut() {
        match interpolate_server(server) {
            Ok(()) => debug!("Interpolated configuration for server: {}", name),
            Err(error) => {
                warn!(server = %name, "disabling server: {error}");
                server.enabled = false;
            }
        }
    }
}

/// Resolve placeholders in the command, args, env values, url and header values.
pub fn interpolate_server(server: &mut ServerConfig) -> Result<(), InterpolationError> {
    if let Some(command) = &mut server.command {
        *command = interpolate_string(command)?;
    }
    for arg in server.args.iter_mut() {
        *arg = interpolate_string(arg)?;
    }
    for value in server.env.values_mut() {
        *value = interpolate_string(value)?;
    }
    if let Some(url) = &mut server.url {
        *url = interpolate_string(url)?;
    }
    for value in server.headers.values_mut() {
        *value = interpolate_string(value)?;
    }
    Ok(())
}

/// Replace every `${env:NAME}` occurrence with the variable's value.
pub fn interpolate_string(value: &str) -> Result<String, InterpolationError> {
    let mut result = String::with_capacity(value.len());
    let mut last = 0;
    for cap in ENV_PATTERN.captures_iter(value) {
        let (Some(whole), Some(var)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let env_value = std::env::var(var.as_str()).map_err(|_| InterpolationError::MissingEnvVar {
            name: var.as_str().to_string(),
        })?;
        debug!("Interpolated env var: {} -> [REDACTED]", var.as_str());
        result.push_str(&value[last..whole.start()]);
        result.push_str(&env_value);
        last = whole.end();
    }
    result.push_str(&value[last..]);
    Ok(result)
}

/// Errors that can occur during interpolation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("Missing environment variable: {name}")]
    MissingEnvVar { name: String },
}
