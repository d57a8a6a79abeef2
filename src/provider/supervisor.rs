//! Provider process supervision.
//!
//! The Supervisor owns the set of provider handles, keyed by name. The set is
//! guarded by a std `Mutex` that is never held across an `.await`: spawning,
//! stopping and capability queries all run outside it, so a slow or hung
//! provider cannot delay work on another one.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use super::config::{ProviderConfig, ProviderConfigStore};
use super::errors::{StartError, StopError};
use super::handle::{self, ProcessControl, ProviderHandle};
use super::transport::{self, StdioTransport};
use super::types::{HandleSummary, ProviderState};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default time a provider gets to exit after the graceful signal.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Registry {
    handles: HashMap<String, Arc<ProviderHandle>>,
    /// First-registration order per provider name, kept across restarts.
    order: HashMap<String, u64>,
    next_order: u64,
}

impl Registry {
    fn order_for(&mut self, name: &str) -> u64 {
        if let Some(order) = self.order.get(name) {
            return *order;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.order.insert(name.to_string(), order);
        order
    }

    /// Handles sorted by registration order, ties broken by name.
    fn sorted(&self) -> Vec<Arc<ProviderHandle>> {
        let mut handles: Vec<Arc<ProviderHandle>> = self.handles.values().cloned().collect();
        handles.sort_by(|a, b| a.order().cmp(&b.order()).then_with(|| a.name().cmp(b.name())));
        handles
    }
}

/// A provider that was `Ready` when the set was read, with its query channel.
pub(crate) struct ReadyProvider {
    pub(crate) name: String,
    pub(crate) order: u64,
    pub(crate) transport: Arc<StdioTransport>,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

struct Inner {
    registry: Mutex<Registry>,
    grace_period: Duration,
}

/// Launches, tracks and stops provider processes.
///
/// Cheap to clone; clones share the same handle set.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                grace_period,
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Launch one provider.
    ///
    /// Readiness policy: the handle becomes `Ready` as soon as the spawn
    /// succeeds and its stdio is wired.
    pub async fn start(&self, config: &ProviderConfig) -> Result<(), StartError> {
        let handle = self.reserve(&config.name)?;

        tracing::info!(
            provider = %config.name,
            command = %config.command,
            args = ?config.args,
            "starting provider"
        );
        launch(&handle, config).await
    }

    /// Register a fresh `Starting` handle under `name`.
    ///
    /// Done before spawning so concurrent starts cannot race.
    fn reserve(&self, name: &str) -> Result<Arc<ProviderHandle>, StartError> {
        let mut registry = self.registry();
        if let Some(existing) = registry.handles.get(name) {
            if !existing.state().is_terminal() {
                return Err(StartError::AlreadyRunning {
                    name: name.to_string(),
                });
            }
            tracing::debug!(provider = name, previous = %existing.state(), "replacing terminal provider handle");
        }
        let order = registry.order_for(name);
        let handle = Arc::new(ProviderHandle::new(name, order));
        registry.handles.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Start every configured provider in store order.
    ///
    /// Returns the providers that failed to start (partial startup is OK).
    pub async fn start_all(&self, store: &ProviderConfigStore) -> Vec<(String, StartError)> {
        let mut errors = Vec::new();
        for config in store.iter() {
            if let Err(e) = self.start(config).await {
                tracing::warn!(provider = %config.name, error = %e, "provider failed to start (non-fatal)");
                errors.push((config.name.clone(), e));
            }
        }
        errors
    }

    /// Stop one provider: graceful signal, grace period, then forced kill.
    ///
    /// The handle ends up `Stopped` (or keeps `Failed` if it had already
    /// crashed) and is removed from the set, even when the forced kill fails.
    pub async fn stop(&self, name: &str) -> Result<(), StopError> {
        let handle = self
            .registry()
            .handles
            .get(name)
            .cloned()
            .ok_or_else(|| StopError::NotFound {
                name: name.to_string(),
            })?;

        tracing::info!(provider = name, state = %handle.state(), "stopping provider");
        handle.begin_stop();
        let result = handle.terminate(self.inner.grace_period).await;
        handle.finish_stop();

        {
            let mut registry = self.registry();
            let same_incarnation = registry
                .handles
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, &handle));
            if same_incarnation {
                registry.handles.remove(name);
            }
        }

        result.map_err(|cause| {
            tracing::error!(provider = name, error = %cause, "force-kill failed");
            StopError::ForceKillFailed {
                name: name.to_string(),
                cause,
            }
        })
    }

    /// Stop every tracked provider concurrently, collecting every result.
    pub async fn stop_all(&self) -> Vec<(String, Result<(), StopError>)> {
        let names: Vec<String> = self
            .registry()
            .sorted()
            .iter()
            .map(|h| h.name().to_string())
            .collect();

        futures::future::join_all(names.into_iter().map(|name| async move {
            let result = self.stop(&name).await;
            (name, result)
        }))
        .await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Current tracking state, in registration order.
    pub fn list_handles(&self) -> Vec<HandleSummary> {
        let registry = self.registry();
        registry.sorted().iter().map(|h| h.summary()).collect()
    }

    /// Read-only access to the handle currently tracked under `name`.
    pub fn handle(&self, name: &str) -> Option<Arc<ProviderHandle>> {
        self.registry().handles.get(name).cloned()
    }

    pub fn state_of(&self, name: &str) -> Option<ProviderState> {
        self.handle(name).map(|h| h.state())
    }

    pub fn len(&self) -> usize {
        self.registry().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().handles.is_empty()
    }

    /// Ready providers and their query channels, in registration order.
    pub(crate) fn ready_providers(&self) -> Vec<ReadyProvider> {
        let registry = self.registry();
        registry
            .sorted()
            .into_iter()
            .filter_map(|h| {
                h.ready_transport().map(|transport| ReadyProvider {
                    name: h.name().to_string(),
                    order: h.order(),
                    transport,
                })
            })
            .collect()
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn the child for a reserved handle, wire its stdio and hand it to a
/// monitor task.
async fn launch(handle: &Arc<ProviderHandle>, config: &ProviderConfig) -> Result<(), StartError> {
    let name = handle.name();

    let mut child = match build_command(config).spawn() {
        Ok(child) => child,
        Err(e) => return Err(launch_failed(handle, format!("{e}"))),
    };

    let pid = child.id();
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.start_kill();
        return Err(launch_failed(handle, "failed to capture stdio".into()));
    };
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(transport::drain_stderr(name.to_string(), stderr));
    }

    let transport = Arc::new(StdioTransport::new(name, stdin, stdout));
    let (control_tx, control_rx) = mpsc::channel(handle::CONTROL_BUFFER);
    let (exit_tx, exit_rx) = watch::channel(None);
    handle.attach(ProcessControl {
        pid,
        transport,
        control_tx,
        exit_rx,
    });
    tokio::spawn(handle::monitor(Arc::clone(handle), child, control_rx, exit_tx));

    if handle.transition(ProviderState::Ready) {
        tracing::info!(provider = name, pid = ?pid, "provider ready");
    } else if handle.is_stop_requested() {
        // A stop arrived before the process was attached and could not
        // reach it; finish the job here.
        tracing::info!(provider = name, "provider stopped while starting");
        let _ = handle.terminate(Duration::ZERO).await;
    }
    Ok(())
}

fn build_command(config: &ProviderConfig) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    // Overrides on top of the inherited environment.
    cmd.envs(&config.env);

    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

fn launch_failed(handle: &ProviderHandle, cause: String) -> StartError {
    handle.mark_failed(cause.clone());
    tracing::warn!(provider = %handle.name(), error = %cause, "provider launch failed");
    StartError::LaunchFailed {
        name: handle.name().to_string(),
        cause,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
