//! Stdio transport: a child process speaking newline-delimited JSON-RPC, driven by `rmcp`.

use std::process::Stdio;
use std::time::Duration;

use rmcp::transport::TokioChildProcess;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::transport::service::ServiceTransport;
use crate::types::ConnectError;

/// Build a configured `tokio::process::Command` for stdio transport.
pub(crate) fn build_stdio_command(server: &ServerConfig) -> Result<Command, ConnectError> {
    let command = server
        .command
        .as_deref()
        .filter(|command| !command.trim().is_empty())
        .ok_or(ConnectError::MissingCommand)?;

    let mut cmd = Command::new(command);
    cmd.args(&server.args);
    for (key, value) in &server.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &server.cwd {
        cmd.current_dir(cwd);
    }
    Ok(cmd)
}

/// Spawn the configured command and complete the handshake within `timeout`.
///
/// The child is killed when the session is closed or dropped.
pub(crate) async fn connect(config: &ServerConfig, timeout: Duration) -> Result<ServiceTransport, ConnectError> {
    let command = build_stdio_command(config)?;
    let (transport, stderr) = TokioChildProcess::builder(command)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ConnectError::Spawn {
            command: config.command.clone().unwrap_or_default(),
            source,
        })?;
    debug!(server = %config.name, pid = ?transport.id(), "spawned stdio server");
    if let Some(stderr) = stderr {
        spawn_stderr_logger(config.name.clone(), stderr);
    }

    ServiceTransport::handshake(&config.name, transport, timeout).await
}

/// Spawn a background task that forwards stderr lines to the log.
fn spawn_stderr_logger(server: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "toolmux_mcp::stderr", server = %server, "{line}");
        }
    });
}
