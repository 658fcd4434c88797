//! Configuration for the client manager and its servers.
//! This module handles parsing, interpolation and validation of the
//! `~/.config/toolmux/mcp.json` configuration file.

mod interpolation;
mod io;
mod model;
mod validation;

pub use interpolation::{InterpolationError, interpolate_config, interpolate_server, interpolate_string};
pub use io::{default_config_path, load_config, load_config_from_path};
pub use model::{CircuitBreakerOptions, ConfigError, ManagerOptions, ServerConfig, ToolmuxConfig, TransportKind};
pub use validation::{ValidationError, validate_config, validate_server, validate_server_name};
