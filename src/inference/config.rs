//! Model configuration loading and validation.
//!
//! Reads `models.yaml` and resolves environment variables. The file is the
//! single source of truth for model endpoints and the fallback chain.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::errors::InferenceError;
use crate::config::read_interpolated;

/// Default completion budget, matching what the chat bridge always asked for.
pub const DEFAULT_MAX_TOKENS: u32 = 4000;

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    /// Name sent in the request body. Defaults to the model's config key.
    #[serde(default)]
    pub model_name: Option<String>,
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    /// Sent as a bearer token when present.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

/// Top-level `models.yaml` structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    /// Keys tried, in order, after the active model.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl ModelsConfig {
    /// Models to try for one call: the active model, then the fallback chain.
    ///
    /// Unknown keys and repeats are skipped.
    pub fn candidates(&self) -> Vec<(String, ModelConfig)> {
        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();

        for key in std::iter::once(&self.active_model).chain(&self.fallback_chain) {
            if seen.contains(&key.as_str()) {
                continue;
            }
            seen.push(key);
            if let Some(model) = self.models.get(key) {
                out.push((key.clone(), model.clone()));
            }
        }
        out
    }
}

/// Load and parse the models configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing, so API keys can stay out of the file.
pub fn load_models_config(path: &Path) -> Result<ModelsConfig, InferenceError> {
    let raw = read_interpolated(path).map_err(|reason| InferenceError::ConfigError {
        reason: format!("failed to read {}: {reason}", path.display()),
    })?;

    let config: ModelsConfig =
        serde_yaml::from_str(&raw).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    resolve_active_model(&config)?;
    Ok(config)
}

/// Resolve the active model configuration, respecting the fallback chain.
///
/// Returns `(model_key, ModelConfig)` for the first model that exists in the
/// config. Connectivity is only checked when a call is made.
pub fn resolve_active_model(
    config: &ModelsConfig,
) -> Result<(String, ModelConfig), InferenceError> {
    config
        .candidates()
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::ConfigError {
            reason: format!(
                "active model '{}' not found in config and no fallback available",
                config.active_model
            ),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(yaml: &str) -> ModelsConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse(
            r#"
            active_model: local
            models:
              local:
                display_name: "Local"
                base_url: "http://localhost:11434/v1"
            "#,
        );
        let model = &config.models["local"];
        assert_eq!(model.max_tokens, DEFAULT_MAX_TOKENS);
        assert!((model.temperature - 0.7).abs() < f32::EPSILON);
        assert!(model.api_key.is_none());
        assert!(config.fallback_chain.is_empty());
    }

    #[test]
    fn test_candidates_order_skips_unknown_and_repeats() {
        let config = parse(
            r#"
            active_model: primary
            fallback_chain: [primary, missing, backup, backup]
            models:
              primary:
                display_name: "Primary"
                base_url: "http://localhost:1/v1"
              backup:
                display_name: "Backup"
                base_url: "http://localhost:2/v1"
            "#,
        );
        let keys: Vec<String> = config.candidates().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["primary", "backup"]);
    }

    #[test]
    fn test_resolve_falls_back_when_active_missing() {
        let config = parse(
            r#"
            active_model: gone
            fallback_chain: [backup]
            models:
              backup:
                display_name: "Backup"
                base_url: "http://localhost:2/v1"
            "#,
        );
        let (key, _) = resolve_active_model(&config).unwrap();
        assert_eq!(key, "backup");
    }

    #[test]
    fn test_resolve_active_model_not_found() {
        let config = ModelsConfig {
            active_model: "nonexistent".into(),
            models: HashMap::new(),
            fallback_chain: vec![],
        };
        assert!(matches!(
            resolve_active_model(&config),
            Err(InferenceError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_load_interpolates_api_key() {
        std::env::set_var("TOOLBRIDGE_TEST_MODEL_KEY", "sk-test");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
active_model: remote
models:
  remote:
    display_name: "Remote"
    base_url: "https://api.example.com/v1"
    api_key: "${{TOOLBRIDGE_TEST_MODEL_KEY}}"
"#
        )
        .unwrap();

        let config = load_models_config(file.path()).unwrap();
        assert_eq!(config.models["remote"].api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_models_config(&dir.path().join("models.yaml")).unwrap_err();
        assert!(matches!(err, InferenceError::ConfigError { .. }));
    }
}
