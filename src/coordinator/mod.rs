//! Request coordination: one chat message in, one answer or error out.
//!
//! Each request takes its own capability snapshot, renders it into the
//! system prompt and makes a bounded model call. Nothing a request does
//! touches provider state.

pub mod errors;
pub mod handler;
pub mod prompt;

// Re-exports for convenience
pub use errors::ProcessingError;
pub use handler::{ChatRequest, ChatResponse, RequestCoordinator, MAX_CONTENT_CHARS};
pub use prompt::{build_system_prompt, DEFAULT_PROMPT_INTRO};
