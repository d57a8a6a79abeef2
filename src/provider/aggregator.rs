//! Capability aggregation across ready providers.
//!
//! A snapshot asks every `Ready` provider for its tool list in parallel, each
//! query bounded by its own timeout. Providers that time out or answer
//! garbage contribute nothing; the snapshot itself never fails.

use std::time::Duration;

use super::errors::QueryError;
use super::supervisor::Supervisor;
use super::transport::{extract_result, StdioTransport};
use super::types::{CapabilityEntry, CapabilitySnapshot, ToolDescriptor, ToolListResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// JSON-RPC method of the capability query.
pub const TOOLS_LIST_METHOD: &str = "tools/list";

/// Default per-provider capability query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

// ─── CapabilityAggregator ────────────────────────────────────────────────────

/// Builds [`CapabilitySnapshot`]s from the Supervisor's ready providers.
#[derive(Clone)]
pub struct CapabilityAggregator {
    supervisor: Supervisor,
    query_timeout: Duration,
}

impl CapabilityAggregator {
    pub fn new(supervisor: Supervisor, query_timeout: Duration) -> Self {
        Self {
            supervisor,
            query_timeout,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Point-in-time tool list of all `Ready` providers.
    ///
    /// Ordered by provider registration order, then by each provider's own
    /// tool order. Completes within roughly one query timeout regardless of
    /// how many providers hang.
    pub async fn snapshot(&self) -> CapabilitySnapshot {
        self.collect().await.snapshot
    }

    /// Like [`snapshot`](Self::snapshot), also naming the ready providers
    /// whose query failed.
    pub async fn collect(&self) -> SnapshotReport {
        let mut ready = self.supervisor.ready_providers();
        ready.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));

        let timeout = self.query_timeout;
        let answers = futures::future::join_all(ready.into_iter().map(|provider| async move {
            let answer = query_tools(&provider.name, &provider.transport, timeout).await;
            if let Err(e) = &answer {
                tracing::warn!(
                    provider = %provider.name,
                    error = %e,
                    "capability query failed, provider contributes no tools"
                );
            }
            (provider.name, answer)
        }))
        .await;

        let mut tools = Vec::new();
        let mut unavailable = Vec::new();
        for (provider_name, answer) in answers {
            match answer {
                Ok(found) => tools.extend(found.into_iter().map(|tool| CapabilityEntry {
                    provider_name: provider_name.clone(),
                    tool_name: tool.name,
                    description: tool.description,
                })),
                Err(_) => unavailable.push(provider_name),
            }
        }

        let snapshot = CapabilitySnapshot { tools };
        tracing::debug!(
            tools = snapshot.len(),
            providers = ?snapshot.provider_names(),
            unavailable = ?unavailable,
            "capability snapshot taken"
        );
        SnapshotReport {
            snapshot,
            unavailable,
        }
    }
}

/// A snapshot plus the ready providers that did not answer in time or
/// answered garbage.
#[derive(Debug, Clone, Default)]
pub struct SnapshotReport {
    pub snapshot: CapabilitySnapshot,
    pub unavailable: Vec<String>,
}

impl SnapshotReport {
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }
}

/// Ask one provider for its tools, bounded by `timeout`.
pub async fn query_tools(
    provider: &str,
    transport: &StdioTransport,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, QueryError> {
    let response = tokio::time::timeout(timeout, transport.request(TOOLS_LIST_METHOD, None))
        .await
        .map_err(|_| QueryError::Timeout {
            provider: provider.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })??;

    let result = extract_result(provider, response)?;
    let list: ToolListResult =
        serde_json::from_value(result).map_err(|e| QueryError::Malformed {
            provider: provider.to_string(),
            reason: format!("unexpected tools/list result: {e}"),
        })?;

    Ok(list.into_tools())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
