//! Provider supervision: child tool-provider processes and their capabilities.
//!
//! This module handles:
//! - Loading and validating provider configs (`providers.json`)
//! - Spawning providers and tracking each incarnation's lifecycle state
//! - Reaping providers that exit without being asked to
//! - Graceful-then-forced shutdown
//! - JSON-RPC over stdio for the `tools/list` capability query
//! - Point-in-time capability snapshots across all ready providers

pub mod aggregator;
pub mod config;
pub mod errors;
pub mod handle;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use aggregator::{CapabilityAggregator, SnapshotReport};
pub use config::{ProviderConfig, ProviderConfigStore};
pub use errors::{ConfigError, QueryError, StartError, StopError};
pub use handle::ProviderHandle;
pub use supervisor::Supervisor;
pub use types::{CapabilityEntry, CapabilitySnapshot, HandleSummary, ProviderState, ToolDescriptor};
