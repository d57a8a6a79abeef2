//! Provider configuration store.
//!
//! Reads `providers.json`, an ordered list of provider entries:
//!
//! ```json
//! { "servers": [ { "name": "calc", "command": "python3", "args": ["-m", "calc"],
//!                  "env": { "CALC_PRECISION": "8" } } ] }
//! ```
//!
//! The order of the list is the provider registration order used by the
//! capability snapshot.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use super::errors::ConfigError;

/// Declarative description of one tool provider. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child; inherits ours when absent.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ProviderConfig {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Check the per-entry invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: self.name.clone(),
                reason: "name must not be empty".into(),
            });
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: self.name.clone(),
                reason: "command must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    servers: Vec<ProviderConfig>,
}

/// Ordered, validated set of provider configs, unique by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfigStore {
    configs: Vec<ProviderConfig>,
}

impl ProviderConfigStore {
    /// Build a store from already-parsed configs, validating each entry and
    /// name uniqueness.
    pub fn new(configs: Vec<ProviderConfig>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for config in &configs {
            config.validate()?;
            if !seen.insert(config.name.as_str()) {
                return Err(ConfigError::Invalid {
                    name: config.name.clone(),
                    reason: "duplicate provider name".into(),
                });
            }
        }
        Ok(Self { configs })
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: ProvidersFile = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        Self::new(file.servers)
    }

    /// Load the providers file. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "providers file not found, no providers configured");
            return Ok(Self::default());
        }

        let raw = crate::config::read_interpolated(path).map_err(|reason| ConfigError::Read {
            path: path.display().to_string(),
            reason,
        })?;

        let store = Self::from_json_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            count = store.len(),
            providers = ?store.names(),
            "loaded provider config"
        );
        Ok(store)
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.configs.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.configs.iter()
    }

    pub fn configs(&self) -> &[ProviderConfig] {
        &self.configs
    }

    pub fn names(&self) -> Vec<&str> {
        self.configs.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preserves_order() {
        let json = r#"{
            "servers": [
                {"name": "search", "command": "search-server"},
                {"name": "calc", "command": "python3", "args": ["-m", "calc"],
                 "env": {"CALC_PRECISION": "8"}}
            ]
        }"#;
        let store = ProviderConfigStore::from_json_str(json).unwrap();
        assert_eq!(store.names(), vec!["search", "calc"]);

        let calc = store.get("calc").unwrap();
        assert_eq!(calc.args, vec!["-m", "calc"]);
        assert_eq!(calc.env.get("CALC_PRECISION").map(String::as_str), Some("8"));
        assert!(store.get("search").unwrap().args.is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"{"servers": [
            {"name": "calc", "command": "a"},
            {"name": "calc", "command": "b"}
        ]}"#;
        let err = ProviderConfigStore::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref name, .. } if name == "calc"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = ProviderConfig::new("calc", "  ").validate().unwrap_err();
        assert!(err.to_string().contains("command must not be empty"));
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(ProviderConfigStore::new(vec![ProviderConfig::new("", "cat")]).is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = ProviderConfigStore::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_servers_key_is_empty() {
        let store = ProviderConfigStore::from_json_str("{}").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProviderConfigStore::load(&dir.path().join("providers.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_interpolates_env() {
        std::env::set_var("__TOOLBRIDGE_CALC_BIN__", "/opt/calc/bin/calc");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(
            &path,
            r#"{"servers": [{"name": "calc", "command": "${__TOOLBRIDGE_CALC_BIN__}"}]}"#,
        )
        .unwrap();

        let store = ProviderConfigStore::load(&path).unwrap();
        assert_eq!(store.get("calc").unwrap().command, "/opt/calc/bin/calc");
        std::env::remove_var("__TOOLBRIDGE_CALC_BIN__");
    }

    #[test]
    fn test_builder_helpers() {
        let config = ProviderConfig::new("calc", "sh")
            .with_args(["-c", "exit 0"])
            .with_env("A", "1");
        assert_eq!(config.args, vec!["-c", "exit 0"]);
        assert_eq!(config.env.len(), 1);
        assert!(config.validate().is_ok());
    }
}
