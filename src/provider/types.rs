//! Shared types for provider supervision.
//!
//! JSON-RPC 2.0 framing for the stdio channel, the lifecycle state machine,
//! and the capability snapshot value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

// ─── Capabilities ───────────────────────────────────────────────────────────

/// One tool as advertised by a provider in its `tools/list` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Accepted shapes of a `tools/list` result: a bare array, or `{"tools": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ToolListResult {
    Bare(Vec<ToolDescriptor>),
    Wrapped { tools: Vec<ToolDescriptor> },
}

impl ToolListResult {
    pub(crate) fn into_tools(self) -> Vec<ToolDescriptor> {
        match self {
            Self::Bare(tools) | Self::Wrapped { tools } => tools,
        }
    }
}

/// A tool entry in a [`CapabilitySnapshot`], tagged with its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityEntry {
    pub provider_name: String,
    pub tool_name: String,
    pub description: String,
}

/// Point-in-time list of tools contributed by the providers that were
/// `Ready` when it was taken. Holds no reference to live handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySnapshot {
    pub tools: Vec<CapabilityEntry>,
}

impl CapabilitySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Distinct provider names in snapshot order.
    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entry in &self.tools {
            if names.last() != Some(&entry.provider_name.as_str()) {
                names.push(&entry.provider_name);
            }
        }
        names
    }
}

// ─── Lifecycle ──────────────────────────────────────────────────────────────

/// Lifecycle state of one provider incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl ProviderState {
    /// `Failed` and `Stopped` end an incarnation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Whether `self -> next` is a legal transition within one incarnation.
    pub fn can_transition_to(self, next: ProviderState) -> bool {
        use ProviderState::*;
        matches!(
            (self, next),
            (Starting, Ready) | (Starting, Failed) | (Starting, Stopped) | (Ready, Failed) | (Ready, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of one tracked handle, as returned by `list_handles`.
#[derive(Debug, Clone, Serialize)]
pub struct HandleSummary {
    pub name: String,
    pub state: ProviderState,
    pub last_error: Option<String>,
    pub launched_at: DateTime<Utc>,
    pub pid: Option<u32>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
