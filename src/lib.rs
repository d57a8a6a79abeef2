pub mod config;
pub mod coordinator;
pub mod inference;
pub mod provider;
pub mod server;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use config::{BridgeSettings, MODELS_FILE, PROVIDERS_FILE};
use coordinator::RequestCoordinator;
use inference::InferenceClient;
use provider::{CapabilityAggregator, ProviderConfigStore, Supervisor};
use server::BridgeState;

/// Return the platform-standard data directory for toolbridge.
///
/// - macOS: `~/Library/Application Support/toolbridge/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolbridge\`
/// - Linux: `$XDG_DATA_HOME/toolbridge/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolbridge/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolbridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".toolbridge")
}

/// Initialize the tracing subscriber, writing structured logs to the data directory.
///
/// On each startup:
/// 1. Rotates existing logs (bridge.log → bridge.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh bridge.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// `TOOLBRIDGE_LOG_FORMAT=json` switches to one JSON object per line.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join("bridge.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let flushing_writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolbridge=info,warn"));

    let json = std::env::var("TOOLBRIDGE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let installed = if json {
        fmt::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(flushing_writer)
            .with_current_span(true)
            .try_init()
    } else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(flushing_writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolbridge starting ==="
    );
    Ok(())
}

/// Rotate log files: `bridge.log` → `bridge.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in buffers and be lost
/// when the process is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

/// Run the bridge until Ctrl-C / SIGTERM, then stop every provider.
pub async fn run() -> anyhow::Result<()> {
    // Tracing first, before anything logs.
    init_tracing()?;

    let dir = config::config_dir();
    tracing::info!(config_dir = %dir.display(), "loading configuration");

    let settings = BridgeSettings::load(&dir).context("failed to load bridge settings")?;
    let store = ProviderConfigStore::load(&dir.join(PROVIDERS_FILE))
        .context("failed to load provider configs")?;
    let models = inference::load_models_config(&dir.join(MODELS_FILE))
        .context("failed to load model config")?;
    let model = InferenceClient::from_config(models).context("failed to create model client")?;

    if model.health_check().await {
        tracing::info!(model = model.current_model_name(), "model endpoint reachable");
    } else {
        tracing::warn!(
            model = model.current_model_name(),
            "model endpoint not reachable yet, requests may fall back or fail"
        );
    }

    // Bind before launching children so a busy port leaves nothing to clean up.
    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;

    let supervisor = Supervisor::new(settings.grace_period());
    let errors = supervisor.start_all(&store).await;
    tracing::info!(
        configured = store.len(),
        failed = errors.len(),
        "providers started"
    );

    let aggregator = CapabilityAggregator::new(supervisor.clone(), settings.query_timeout());
    let coordinator = RequestCoordinator::from_settings(aggregator, Arc::new(model), &settings);
    let state = Arc::new(BridgeState {
        coordinator,
        supervisor: supervisor.clone(),
    });

    let served = server::serve(listener, state, shutdown_signal()).await;

    for (name, result) in supervisor.stop_all().await {
        if let Err(e) = result {
            tracing::warn!(provider = %name, error = %e, "provider did not stop cleanly");
        }
    }
    tracing::info!("=== toolbridge stopped ===");

    served.context("chat bridge server failed")
}
