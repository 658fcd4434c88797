//! Server clients and the manager that multiplexes them.
//!
//! [`ClientManager`] is the entry point: it owns one [`ServerClient`] per configured server,
//! routes qualified tool names, aggregates statistics and runs the heartbeat.

mod circuit;
mod health;
mod heartbeat;
mod manager;
mod retry;
mod server_client;

pub use circuit::{CircuitBreaker, CircuitState, CircuitStatus};
pub use health::HealthCheckResult;
pub use manager::{ClientManager, ManagerEvent, qualified_name};
pub use retry::RetryPolicy;
pub use server_client::ServerClient;
