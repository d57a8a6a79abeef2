//! OpenAI-compatible inference client.
//!
//! Sends non-streaming chat completion requests to the configured model
//! endpoint. When a model is unavailable the call walks the fallback chain;
//! each call starts again from the active model, so concurrent callers never
//! share fallback progress.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::backend::{ModelBackend, ModelError};
use super::config::{resolve_active_model, ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::types::{parse_completion_response, ChatCompletionRequest, ChatMessage};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total timeout for one completion request against one model.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for the model endpoint(s) in `models.yaml`.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelsConfig,
    /// Key of the model tried first on every call.
    active_key: String,
    active_display_name: String,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    ///
    /// Resolves the active model from config. Does NOT check connectivity;
    /// that happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Self::with_http_client(config, http)
    }

    /// Like [`from_config`](Self::from_config) with a caller-built HTTP client.
    pub fn with_http_client(
        config: ModelsConfig,
        http: HttpClient,
    ) -> Result<Self, InferenceError> {
        let (key, model) = resolve_active_model(&config)?;
        Ok(Self {
            http,
            config,
            active_key: key,
            active_display_name: model.display_name,
        })
    }

    /// The name of the model tried first.
    pub fn current_model_name(&self) -> &str {
        &self.active_display_name
    }

    // ─── Chat Completion ─────────────────────────────────────────────────

    /// Send one non-streaming chat completion request to `model`.
    pub async fn chat_completion(
        &self,
        key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
    ) -> Result<String, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let body = ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages: messages.to_vec(),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            stream: false,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(api_key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ResponseError {
                    reason: format!("failed to read response body: {e}"),
                }
            }
        })?;

        parse_completion_response(&body_text)
    }

    /// Try the active model, then each fallback, until one answers.
    ///
    /// Non-retriable errors (bad request, auth, unusable body) stop the walk.
    pub async fn complete_with_fallback(
        &self,
        messages: &[ChatMessage],
    ) -> Result<String, InferenceError> {
        let mut attempted = Vec::new();
        let mut last_error: Option<InferenceError> = None;

        for (key, model) in self.config.candidates() {
            match self.chat_completion(&key, &model, messages).await {
                Ok(text) => {
                    if !attempted.is_empty() {
                        tracing::info!(model = %key, skipped = ?attempted, "answered by fallback model");
                    }
                    return Ok(text);
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next in chain");
                    attempted.push(key);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) if attempted.len() == 1 => Err(e),
            Some(e) => Err(InferenceError::AllModelsUnavailable {
                attempted,
                last_error: e.to_string(),
            }),
            None => Err(InferenceError::ConfigError {
                reason: "no models configured".into(),
            }),
        }
    }

    // ─── Health Check ────────────────────────────────────────────────────

    /// Check if the active model endpoint is reachable.
    ///
    /// Lists models rather than completing, so no tokens are spent.
    pub async fn health_check(&self) -> bool {
        let Some(model) = self.config.models.get(&self.active_key) else {
            return false;
        };
        let url = format!("{}/models", model.base_url.trim_end_matches('/'));

        let mut request = self.http.get(&url).timeout(CONNECT_TIMEOUT);
        if let Some(api_key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(api_key);
        }
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ModelBackend for InferenceClient {
    async fn infer(&self, prompt: &str, user_message: &str) -> Result<String, ModelError> {
        let messages = [ChatMessage::system(prompt), ChatMessage::user(user_message)];
        self.complete_with_fallback(&messages).await
    }

    fn name(&self) -> &str {
        &self.active_display_name
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
