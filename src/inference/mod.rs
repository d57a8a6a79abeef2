//! Inference client: OpenAI-compatible chat completions behind [`ModelBackend`].
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming chat completions
//! - Fallback chain management
//! - Model configuration loading from `models.yaml`
//!
//! Switching models is a config change, not a code change.

pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use backend::{ModelBackend, ModelError};
pub use client::InferenceClient;
pub use config::{load_models_config, ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use types::{ChatMessage, Role};
