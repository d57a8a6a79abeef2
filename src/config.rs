//! Bridge settings and config-file helpers.
//!
//! All config files live in one directory: `TOOLBRIDGE_CONFIG_DIR` if set,
//! otherwise the current directory. Files are read as text, `${VAR}` and
//! `${VAR:-default}` references are interpolated, then the text is parsed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Settings file name inside the config directory.
pub const BRIDGE_FILE: &str = "bridge.yaml";

/// Providers file name inside the config directory.
pub const PROVIDERS_FILE: &str = "providers.json";

/// Models file name inside the config directory.
pub const MODELS_FILE: &str = "models.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// What a request does when the capability snapshot cannot be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    /// Proceed with an empty capability set.
    #[default]
    BestEffort,
    /// Fail the request with `ContextUnavailable`.
    Required,
}

/// Process-wide settings (mirrors `bridge.yaml`). Every field is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub listen_addr: String,
    pub grace_period_ms: u64,
    pub query_timeout_ms: u64,
    pub model_timeout_ms: u64,
    pub context_policy: ContextPolicy,
    /// Overrides the built-in system prompt intro.
    pub system_prompt: Option<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8765".to_string(),
            grace_period_ms: 5_000,
            query_timeout_ms: 2_000,
            model_timeout_ms: 60_000,
            context_policy: ContextPolicy::BestEffort,
            system_prompt: None,
        }
    }
}

impl BridgeSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    /// Load `bridge.yaml` from `dir`. A missing file yields the defaults.
    pub fn load(dir: &Path) -> Result<Self, SettingsError> {
        let path = dir.join(BRIDGE_FILE);
        if !path.exists() {
            tracing::info!(path = %path.display(), "no bridge settings file, using defaults");
            return Ok(Self::default());
        }

        let raw = read_interpolated(&path).map_err(|reason| SettingsError::Read {
            path: path.display().to_string(),
            reason,
        })?;

        // An empty YAML document parses as null, not as an empty mapping.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&raw).map_err(|e| SettingsError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

// ─── Paths ───────────────────────────────────────────────────────────────────

/// Resolve the directory holding the config files.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLBRIDGE_CONFIG_DIR") {
        return PathBuf::from(expand_tilde(&dir));
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Read a file and interpolate environment references.
pub(crate) fn read_interpolated(path: &Path) -> Result<String, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    Ok(interpolate_env_vars(&raw))
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
