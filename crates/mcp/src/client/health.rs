//! Outcome of a single liveness check.

use serde::Serialize;

/// Represents the result of a single health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    /// Whether the server answered the ping.
    pub healthy: bool,

    /// The latency of the health check in milliseconds, if successful.
    pub latency_ms: Option<u64>,

    /// An error message if the server is unhealthy.
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}
