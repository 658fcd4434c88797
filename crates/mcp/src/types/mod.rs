pub mod catalog;
pub mod errors;
pub mod stats;
pub mod status;
pub mod tools;

pub use catalog::{PromptArgument, PromptMetadata, ResourceMetadata, RoutedPrompt, RoutedResource};
pub use errors::{ConnectError, RegistryError, ToolCallError, TransportError};
pub use stats::{GlobalStats, GlobalStatsSnapshot, ServerStats, StatsSnapshot, ToolCallStats, ToolStatsSnapshot};
pub use status::{ConnectionState, ManagerStatus, ServerStatus};
pub use tools::{RoutedTool, ToolCallResult, ToolMetadata};
