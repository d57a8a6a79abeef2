//! Runtime handle for one provider incarnation.
//!
//! A `ProviderHandle` carries the lifecycle state of one launched child.
//! The child itself is owned by a monitor task (see [`monitor`]); the handle
//! only keeps the channels needed to ask that task to kill the child and to
//! observe its exit. Those channels are private to the `provider` module, so
//! nothing outside the Supervisor can signal or wait on the process.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};

use super::transport::StdioTransport;
use super::types::{HandleSummary, ProviderState};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on writing the `shutdown` notification to a child's stdin.
const NOTIFY_TIMEOUT: Duration = Duration::from_millis(200);

/// How long to wait for the exit after a forced kill was delivered.
const KILL_WAIT: Duration = Duration::from_secs(2);

// ─── Process Control ─────────────────────────────────────────────────────────

/// Capacity of the request channel to a monitor task.
pub(super) const CONTROL_BUFFER: usize = 4;

/// Signals the monitor task delivers to the child it owns.
///
/// Only the monitor signals the child, so a pid is never signalled after the
/// child has been reaped and the pid possibly reused.
#[derive(Debug)]
pub(super) enum ControlRequest {
    /// Ask the child to exit (SIGTERM on Unix).
    Terminate,
    /// Force-kill the child and report whether the kill was delivered.
    Kill(oneshot::Sender<std::io::Result<()>>),
}

/// Channels to a running child, attached once the spawn succeeded.
pub(super) struct ProcessControl {
    pub(super) pid: Option<u32>,
    pub(super) transport: Arc<StdioTransport>,
    pub(super) control_tx: mpsc::Sender<ControlRequest>,
    /// `Some(reason)` once the child has exited.
    pub(super) exit_rx: watch::Receiver<Option<String>>,
}

impl ProcessControl {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

// ─── ProviderHandle ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct HandleStatus {
    state: ProviderState,
    last_error: Option<String>,
    /// Set by `stop`; an exit after this point is not a failure.
    stop_requested: bool,
}

/// One provider incarnation: name, lifecycle state and exit tracking.
pub struct ProviderHandle {
    name: String,
    /// Registration order of the provider name (stable across restarts).
    order: u64,
    launched_at: DateTime<Utc>,
    status: Mutex<HandleStatus>,
    process: OnceLock<ProcessControl>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl ProviderHandle {
    pub(super) fn new(name: &str, order: u64) -> Self {
        Self {
            name: name.to_string(),
            order,
            launched_at: Utc::now(),
            status: Mutex::new(HandleStatus {
                state: ProviderState::Starting,
                last_error: None,
                stop_requested: false,
            }),
            process: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    pub fn state(&self) -> ProviderState {
        self.status().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.status().last_error.clone()
    }

    /// OS process id, once the child has been spawned.
    pub fn pid(&self) -> Option<u32> {
        self.process.get().and_then(|p| p.pid)
    }

    pub fn summary(&self) -> HandleSummary {
        let status = self.status();
        HandleSummary {
            name: self.name.clone(),
            state: status.state,
            last_error: status.last_error.clone(),
            launched_at: self.launched_at,
            pid: self.pid(),
        }
    }

    // A panic while holding the lock cannot leave `HandleStatus` half-written,
    // so a poisoned lock is still usable.
    fn status(&self) -> MutexGuard<'_, HandleStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Transitions ─────────────────────────────────────────────────────

    /// Apply `next` if it is a legal transition from the current state.
    ///
    /// `Ready` is refused once a stop has been requested.
    pub(super) fn transition(&self, next: ProviderState) -> bool {
        let mut status = self.status();
        if next == ProviderState::Ready && status.stop_requested {
            return false;
        }
        if !status.state.can_transition_to(next) {
            return false;
        }
        tracing::debug!(provider = %self.name, from = %status.state, to = %next, "provider state change");
        status.state = next;
        true
    }

    /// Move to `Failed` and record why. No-op on a terminal handle.
    pub(super) fn mark_failed(&self, reason: String) -> bool {
        let mut status = self.status();
        if !status.state.can_transition_to(ProviderState::Failed) {
            return false;
        }
        status.state = ProviderState::Failed;
        status.last_error = Some(reason);
        true
    }

    pub(super) fn begin_stop(&self) {
        self.status().stop_requested = true;
    }

    pub(super) fn is_stop_requested(&self) -> bool {
        self.status().stop_requested
    }

    /// End of `stop`: a non-terminal handle becomes `Stopped`; a handle that
    /// already failed keeps its `Failed` state and error.
    pub(super) fn finish_stop(&self) {
        self.transition(ProviderState::Stopped);
    }

    /// Called by the monitor when the child exits.
    fn on_exit(&self, reason: &str) {
        let failed = {
            let mut status = self.status();
            if !status.stop_requested && status.state.can_transition_to(ProviderState::Failed) {
                status.state = ProviderState::Failed;
                status.last_error = Some(reason.to_string());
                true
            } else {
                false
            }
        };

        if failed {
            tracing::warn!(
                provider = %self.name,
                pid = ?self.pid(),
                reason,
                "provider exited unexpectedly"
            );
        } else {
            tracing::debug!(provider = %self.name, reason, "provider exited");
        }
    }

    // ─── Process ─────────────────────────────────────────────────────────

    pub(super) fn attach(&self, control: ProcessControl) {
        if self.process.set(control).is_err() {
            tracing::error!(provider = %self.name, "process already attached to handle");
        }
    }

    /// Capability channel, only while the handle is `Ready`.
    pub(super) fn ready_transport(&self) -> Option<Arc<StdioTransport>> {
        if self.state() != ProviderState::Ready {
            return None;
        }
        self.process.get().map(|p| Arc::clone(&p.transport))
    }

    /// Ask the child to exit, escalating to a forced kill after `grace`.
    ///
    /// Returns `Err(cause)` only when the forced kill itself failed.
    pub(super) async fn terminate(&self, grace: Duration) -> Result<(), String> {
        let Some(control) = self.process.get() else {
            return Ok(());
        };
        if control.has_exited() {
            return Ok(());
        }
        let mut exit_rx = control.exit_rx.clone();

        // Best-effort: a child that reads stdin may shut down on its own.
        let _ = tokio::time::timeout(NOTIFY_TIMEOUT, control.transport.notify("shutdown", None)).await;
        if control.control_tx.send(ControlRequest::Terminate).await.is_err() {
            // Monitor already finished: the child is gone.
            return Ok(());
        }

        if wait_for_exit(&mut exit_rx, grace).await {
            tracing::info!(provider = %self.name, "provider exited gracefully");
            return Ok(());
        }

        tracing::warn!(
            provider = %self.name,
            grace_ms = grace.as_millis() as u64,
            "grace period elapsed, force-killing provider"
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        if control.control_tx.send(ControlRequest::Kill(reply_tx)).await.is_err() {
            // Monitor already finished: the child is gone.
            return Ok(());
        }
        match reply_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Ok(()),
        }

        if !wait_for_exit(&mut exit_rx, KILL_WAIT).await {
            tracing::warn!(provider = %self.name, "provider did not report exit after kill");
        }
        Ok(())
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

/// Own the child until it exits, delivering signals meanwhile.
///
/// Reports the exit to the handle (which decides between "failed" and
/// "stopped") and then publishes it on `exit_tx`.
pub(super) async fn monitor(
    handle: Arc<ProviderHandle>,
    mut child: Child,
    mut control_rx: mpsc::Receiver<ControlRequest>,
    exit_tx: watch::Sender<Option<String>>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = control_rx.recv() => match request {
                // `id()` is `None` once the child has been reaped.
                ControlRequest::Terminate => send_terminate_signal(handle.name(), child.id()),
                ControlRequest::Kill(reply) => {
                    let _ = reply.send(child.start_kill());
                }
            },
        }
    };

    let reason = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("failed to wait on process: {e}"),
    };
    handle.on_exit(&reason);
    let _ = exit_tx.send(Some(reason));
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<String>>, limit: Duration) -> bool {
    // A closed channel means the monitor is gone, so the child is too.
    tokio::time::timeout(limit, exit_rx.wait_for(|exit| exit.is_some()))
        .await
        .is_ok()
}

#[cfg(unix)]
fn send_terminate_signal(provider: &str, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(
            provider,
            pid,
            error = %std::io::Error::last_os_error(),
            "SIGTERM delivery failed"
        );
    }
}

// No portable graceful signal: rely on the stdin notification, then kill.
#[cfg(not(unix))]
fn send_terminate_signal(_provider: &str, _pid: Option<u32>) {}

// ─── Tests ───────────────────────────────────────────────────────────────────
