//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with provider child processes:
//! - Writing JSON-RPC requests to stdin (one JSON object per line)
//! - A reader task that routes stdout responses to waiting requests by `id`
//! - A drain task that forwards stderr lines to the log
//!
//! Several requests may be in flight at once (concurrent snapshots). A
//! request whose caller gives up is unregistered when its future is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as TokioMutex};

use super::errors::QueryError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Pending Requests ────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>>;

/// Removes a pending entry when the waiting request is dropped.
struct PendingGuard {
    id: u64,
    pending: PendingMap,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(map) = pending.as_mut() {
                map.remove(&self.id);
            }
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    provider: String,
    writer: TokioMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// `None` once stdout has closed; new requests then fail immediately.
    pending: PendingMap,
}

impl StdioTransport {
    /// Create a transport and spawn its stdout reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<W, R>(provider: &str, stdin: W, stdout: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));
        tokio::spawn(read_responses(provider.to_string(), stdout, Arc::clone(&pending)));

        Self {
            provider: provider.to_string(),
            writer: TokioMutex::new(Box::new(stdin)),
            pending,
        }
    }

    /// Send a JSON-RPC request and wait for the response with the same `id`.
    ///
    /// Unbounded on its own; callers wrap it in a timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, QueryError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| self.transport_error(format!(
            "failed to serialize request: {e}"
        )))?;
        json.push('\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|e| self.transport_error(format!("pending map poisoned: {e}")))?;
            match pending.as_mut() {
                Some(map) => {
                    map.insert(id, tx);
                }
                None => {
                    return Err(self.transport_error(
                        "provider stdout closed (process may have exited)".into(),
                    ))
                }
            }
        }
        let _guard = PendingGuard {
            id,
            pending: Arc::clone(&self.pending),
        };

        self.write_line(&json).await?;

        rx.await.map_err(|_| {
            self.transport_error("provider stdout closed (process may have exited)".into())
        })
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), QueryError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            self.transport_error(format!("failed to serialize notification: {e}"))
        })?;
        json.push('\n');

        self.write_line(&json).await
    }

    async fn write_line(&self, line: &str) -> Result<(), QueryError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(HashMap::len))
            .unwrap_or(0)
    }

    fn transport_error(&self, reason: String) -> QueryError {
        QueryError::Transport {
            provider: self.provider.clone(),
            reason,
        }
    }
}

/// Read stdout line by line and complete the matching pending request.
///
/// Lines that are not JSON-RPC responses are provider log output, whatever
/// their encoding. Only EOF or an I/O error ends the loop.
async fn read_responses<R>(provider: String, stdout: R, pending: PendingMap)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(resp) => {
                        let waiter = pending
                            .lock()
                            .ok()
                            .and_then(|mut p| p.as_mut().and_then(|map| map.remove(&resp.id)));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => {
                                tracing::debug!(
                                    provider = %provider,
                                    id = resp.id,
                                    "dropping response with no waiting request"
                                );
                            }
                        }
                    }
                    Err(_) => {
                        tracing::debug!(provider = %provider, line = %trimmed, "provider stdout");
                    }
                }
            }
            Err(e) => {
                tracing::debug!(provider = %provider, error = %e, "provider stdout read failed");
                break;
            }
        }
    }

    // Dropping the senders wakes every waiter with an error.
    if let Ok(mut p) = pending.lock() {
        p.take();
    }
}

/// Forward a child's stderr to the log so the pipe never fills up.
///
/// Keeps reading until EOF: closing the pipe early would make the child's
/// next write fail with EPIPE.
pub(crate) async fn drain_stderr<R>(provider: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                tracing::debug!(provider = %provider, line = %line.trim_end(), "provider stderr");
            }
            Err(e) => {
                tracing::debug!(provider = %provider, error = %e, "provider stderr read failed");
                break;
            }
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, mapping error objects to
/// `QueryError::Malformed`.
pub fn extract_result(
    provider: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, QueryError> {
    if let Some(err) = response.error {
        return Err(QueryError::Malformed {
            provider: provider.to_string(),
            reason: format!("[{}] {}", err.code, err.message),
        });
    }

    response.result.ok_or(QueryError::Malformed {
        provider: provider.to_string(),
        reason: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
