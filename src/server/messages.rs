//! JSON frames exchanged with the chat UI.
//!
//! Every frame is a JSON object tagged by `"type"`. A client may attach an
//! `id` to a request; the reply carries the same `id`, since replies on one
//! connection can arrive out of order.

use serde::{Deserialize, Serialize};

use crate::coordinator::ProcessingError;
use crate::provider::HandleSummary;

/// Frames the UI sends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ChatMessage {
        #[serde(default)]
        id: Option<String>,
        content: String,
    },
    ProvidersStatus {
        #[serde(default)]
        id: Option<String>,
    },
}

/// Frames the bridge sends back.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ChatResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        content: String,
    },
    ChatError {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        kind: String,
        message: String,
    },
    ProvidersStatus {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        providers: Vec<HandleSummary>,
    },
}

impl ServerMessage {
    pub fn from_error(id: Option<String>, err: &ProcessingError) -> Self {
        ServerMessage::ChatError {
            id,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// Reply to a frame that could not be understood at all.
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        ServerMessage::ChatError {
            id: None,
            kind: "invalid_request".to_string(),
            message: reason.into(),
        }
    }
}
