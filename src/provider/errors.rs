//! Provider supervision error types.

use thiserror::Error;

/// Errors returned by [`Supervisor::start`](super::Supervisor::start).
#[derive(Debug, Error)]
pub enum StartError {
    /// A handle for this provider exists and has not reached a terminal state.
    #[error("provider '{name}' is already running")]
    AlreadyRunning { name: String },

    /// The child process could not be spawned (missing executable, bad cwd, ...).
    ///
    /// The Supervisor keeps a `Failed` handle for the provider so the failure
    /// stays visible through `list_handles`.
    #[error("failed to launch provider '{name}': {cause}")]
    LaunchFailed { name: String, cause: String },
}

/// Errors returned by [`Supervisor::stop`](super::Supervisor::stop).
///
/// Escalating from the graceful signal to a forced kill is not an error.
#[derive(Debug, Error)]
pub enum StopError {
    /// No handle is tracked under this name.
    #[error("provider '{name}' not found")]
    NotFound { name: String },

    /// The OS refused to force-terminate the process. The handle has still
    /// been removed from the active set.
    #[error("failed to force-kill provider '{name}': {cause}")]
    ForceKillFailed { name: String, cause: String },
}

/// Errors from a single provider's capability query.
///
/// Never escalated: the aggregator logs them and the provider contributes
/// zero tools to the snapshot.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The provider did not answer `tools/list` in time.
    #[error("capability query to '{provider}' timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    /// Writing the request or reading the response failed.
    #[error("transport error for provider '{provider}': {reason}")]
    Transport { provider: String, reason: String },

    /// The provider answered with an error object or an unexpected shape.
    #[error("malformed capability response from '{provider}': {reason}")]
    Malformed { provider: String, reason: String },
}

/// Errors while loading or validating the providers file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse providers config: {reason}")]
    Parse { reason: String },

    /// A provider entry violates a store invariant.
    #[error("invalid provider config '{name}': {reason}")]
    Invalid { name: String, reason: String },
}
