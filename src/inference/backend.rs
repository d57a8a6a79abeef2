//! The seam between request handling and whatever produces the answer.

use async_trait::async_trait;

use super::errors::InferenceError;

/// Error type of a model call.
pub type ModelError = InferenceError;

/// Something that turns a system prompt and a user message into a reply.
///
/// Implementations own their retry and fallback behavior; callers see one
/// result per call.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn infer(&self, prompt: &str, user_message: &str) -> Result<String, ModelError>;

    /// Short label for logs.
    fn name(&self) -> &str {
        "model"
    }
}
