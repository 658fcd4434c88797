//! Configuration validation for servers.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderName;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::{ServerConfig, ToolmuxConfig, TransportKind};

static SERVER_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("server name regex should compile"));

static ENV_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key regex should compile"));

/// Validate every server of a configuration file.
pub fn validate_config(config: &ToolmuxConfig) -> Result<(), ValidationError> {
    for server in config.servers() {
        validate_server(&server)?;
        debug!("Validated server configuration: {}", server.name);
    }
    Ok(())
}

/// Validate a server name.
pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidServerName {
            name: name.to_string(),
            reason: "Server name cannot be empty".to_string(),
        });
    }

    if !SERVER_NAME_REGEX.is_match(name) {
        return Err(ValidationError::InvalidServerName {
            name: name.to_string(),
            reason: "Server name must contain only letters, numbers, dots, underscores, and hyphens".to_string(),
        });
    }

    Ok(())
}

/// Validate a single server configuration, including its name.
pub fn validate_server(server: &ServerConfig) -> Result<(), ValidationError> {
    validate_server_name(&server.name)?;
    match server.transport {
        TransportKind::Stdio => validate_stdio_server(server),
        TransportKind::Http | TransportKind::Sse => validate_remote_server(server),
    }
}

fn validate_stdio_server(server: &ServerConfig) -> Result<(), ValidationError> {
    if server.command.as_deref().is_none_or(|command| command.trim().is_empty()) {
        return Err(ValidationError::MissingRequiredField {
            field: "command".to_string(),
            transport: TransportKind::Stdio,
        });
    }

    for key in server.env.keys() {
        validate_env_key(key)?;
    }

    Ok(())
}

fn validate_remote_server(server: &ServerConfig) -> Result<(), ValidationError> {
    let Some(raw) = server.url.as_deref().filter(|url| !url.trim().is_empty()) else {
        return Err(ValidationError::MissingRequiredField {
            field: "url".to_string(),
            transport: server.transport,
        });
    };

    let url = Url::parse(raw).map_err(|error| ValidationError::InvalidUrl {
        url: raw.to_string(),
        reason: error.to_string(),
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(ValidationError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{scheme}' (expected http/https)"),
        });
    }

    for name in server.headers.keys() {
        validate_header_name(name)?;
    }

    Ok(())
}

fn validate_env_key(key: &str) -> Result<(), ValidationError> {
    if !ENV_KEY_REGEX.is_match(key) {
        return Err(ValidationError::InvalidEnvKey {
            key: key.to_string(),
            reason: "Environment variable keys must start with a letter or underscore, followed by letters, numbers, or underscores".to_string(),
        });
    }

    Ok(())
}

fn validate_header_name(name: &str) -> Result<(), ValidationError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|error| ValidationError::InvalidHeaderName {
        name: name.to_string(),
        reason: error.to_string(),
    })?;
    Ok(())
}

/// Errors that can occur during validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid server name '{name}': {reason}")]
    InvalidServerName { name: String, reason: String },

    #[error("Missing required field '{field}' for {transport} transport")]
    MissingRequiredField { field: String, transport: TransportKind },

    #[error("Invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid environment variable key '{key}': {reason}")]
    InvalidEnvKey { key: String, reason: String },

    #[error("Invalid HTTP header name '{name}': {reason}")]
    InvalidHeaderName { name: String, reason: String },
}
