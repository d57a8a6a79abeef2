//! Request-level error types.

use thiserror::Error;

/// Why a chat request produced no answer.
///
/// Every failure below the coordinator (provider queries, model errors,
/// timeouts, panics) ends up as one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    /// Capability context could not be gathered and the policy requires it.
    #[error("capability context unavailable: {reason}")]
    ContextUnavailable { reason: String },

    /// The model call failed, timed out or panicked.
    #[error("model call failed: {cause}")]
    ModelCallFailed { cause: String },

    /// The request itself is unusable.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl ProcessingError {
    /// Stable machine-readable tag, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::ContextUnavailable { .. } => "context_unavailable",
            ProcessingError::ModelCallFailed { .. } => "model_call_failed",
            ProcessingError::InvalidRequest { .. } => "invalid_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let cases = [
            (
                ProcessingError::ContextUnavailable {
                    reason: "x".into(),
                },
                "context_unavailable",
            ),
            (
                ProcessingError::ModelCallFailed { cause: "x".into() },
                "model_call_failed",
            ),
            (
                ProcessingError::InvalidRequest { reason: "x".into() },
                "invalid_request",
            ),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_display_includes_cause() {
        let err = ProcessingError::ModelCallFailed {
            cause: "HTTP 401: bad key".into(),
        };
        assert_eq!(err.to_string(), "model call failed: HTTP 401: bad key");
    }
}
