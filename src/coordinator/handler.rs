//! Per-request orchestration: validate, gather context, prompt, call the model.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::errors::ProcessingError;
use super::prompt::{build_system_prompt, DEFAULT_PROMPT_INTRO};
use crate::config::{BridgeSettings, ContextPolicy};
use crate::inference::ModelBackend;
use crate::provider::{CapabilityAggregator, CapabilitySnapshot};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Longest accepted request, in characters.
pub const MAX_CONTENT_CHARS: usize = 32_000;

/// Default bound on one model call.
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time a whole snapshot gets on top of the per-provider query timeout.
const SNAPSHOT_SLACK: Duration = Duration::from_secs(1);

// ─── Request / Response ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub content: String,
}

impl ChatRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
}

// ─── RequestCoordinator ──────────────────────────────────────────────────────

/// Turns one chat request into one answer or one [`ProcessingError`].
///
/// Holds no per-request state, so a single instance serves any number of
/// concurrent requests. The only thing requests share is the read-only
/// snapshot each of them takes.
pub struct RequestCoordinator {
    aggregator: CapabilityAggregator,
    model: Arc<dyn ModelBackend>,
    model_timeout: Duration,
    context_policy: ContextPolicy,
    prompt_intro: String,
}

impl RequestCoordinator {
    pub fn new(aggregator: CapabilityAggregator, model: Arc<dyn ModelBackend>) -> Self {
        Self {
            aggregator,
            model,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            context_policy: ContextPolicy::default(),
            prompt_intro: DEFAULT_PROMPT_INTRO.to_string(),
        }
    }

    /// Coordinator configured from `bridge.yaml`.
    pub fn from_settings(
        aggregator: CapabilityAggregator,
        model: Arc<dyn ModelBackend>,
        settings: &BridgeSettings,
    ) -> Self {
        let mut coordinator = Self::new(aggregator, model)
            .with_model_timeout(settings.model_timeout())
            .with_context_policy(settings.context_policy);
        if let Some(intro) = settings.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            coordinator = coordinator.with_prompt_intro(intro);
        }
        coordinator
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_context_policy(mut self, policy: ContextPolicy) -> Self {
        self.context_policy = policy;
        self
    }

    pub fn with_prompt_intro(mut self, intro: impl Into<String>) -> Self {
        self.prompt_intro = intro.into();
        self
    }

    pub fn model_timeout(&self) -> Duration {
        self.model_timeout
    }

    pub fn context_policy(&self) -> ContextPolicy {
        self.context_policy
    }

    /// Handle one chat request.
    ///
    /// Never panics and never leaves provider state changed. Dropping the
    /// returned future cancels the model call.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse, ProcessingError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("chat_request", request_id = %request_id);

        async {
            let result = self.process(request).await;
            match &result {
                Ok(response) => {
                    tracing::info!(chars = response.content.chars().count(), "request answered")
                }
                Err(e) => tracing::warn!(kind = e.kind(), error = %e, "request failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn process(&self, request: ChatRequest) -> Result<ChatResponse, ProcessingError> {
        validate(&request)?;

        let snapshot = self.capabilities().await?;
        tracing::debug!(tools = snapshot.len(), "capability context ready");

        let prompt = build_system_prompt(&self.prompt_intro, &snapshot);
        let content = self.call_model(prompt, request.content).await?;
        Ok(ChatResponse { content })
    }

    /// Take this request's snapshot, applying the context policy.
    async fn capabilities(&self) -> Result<CapabilitySnapshot, ProcessingError> {
        let deadline = self.aggregator.query_timeout() + SNAPSHOT_SLACK;

        let report = match tokio::time::timeout(deadline, self.aggregator.collect()).await {
            Ok(report) => report,
            Err(_) => {
                return match self.context_policy {
                    ContextPolicy::BestEffort => {
                        tracing::warn!(
                            deadline_ms = deadline.as_millis() as u64,
                            "capability snapshot timed out, continuing without tools"
                        );
                        Ok(CapabilitySnapshot::empty())
                    }
                    ContextPolicy::Required => Err(ProcessingError::ContextUnavailable {
                        reason: format!(
                            "capability snapshot exceeded {}ms",
                            deadline.as_millis()
                        ),
                    }),
                };
            }
        };

        if self.context_policy == ContextPolicy::Required && !report.is_complete() {
            return Err(ProcessingError::ContextUnavailable {
                reason: format!(
                    "providers did not report capabilities: {}",
                    report.unavailable.join(", ")
                ),
            });
        }
        Ok(report.snapshot)
    }

    /// Run the model call in its own task so a panic inside the backend
    /// becomes an error instead of unwinding through the caller.
    async fn call_model(&self, prompt: String, user_message: String) -> Result<String, ProcessingError> {
        let model = Arc::clone(&self.model);
        tracing::debug!(model = model.name(), "calling model");

        let mut task = AbortOnDrop(tokio::spawn(
            async move { model.infer(&prompt, &user_message).await }.in_current_span(),
        ));

        match tokio::time::timeout(self.model_timeout, &mut task.0).await {
            Ok(Ok(Ok(text))) => Ok(text),
            Ok(Ok(Err(e))) => Err(ProcessingError::ModelCallFailed {
                cause: e.to_string(),
            }),
            Ok(Err(join_err)) => {
                let cause = if join_err.is_panic() {
                    "model call panicked".to_string()
                } else {
                    "model call was cancelled".to_string()
                };
                tracing::error!(error = %join_err, "model task did not complete");
                Err(ProcessingError::ModelCallFailed { cause })
            }
            Err(_) => Err(ProcessingError::ModelCallFailed {
                cause: format!(
                    "model call timed out after {}ms",
                    self.model_timeout.as_millis()
                ),
            }),
        }
    }
}

/// Aborts the wrapped task when dropped (timeout or caller cancellation).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn validate(request: &ChatRequest) -> Result<(), ProcessingError> {
    if request.content.trim().is_empty() {
        return Err(ProcessingError::InvalidRequest {
            reason: "message is empty".into(),
        });
    }
    let chars = request.content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(ProcessingError::InvalidRequest {
            reason: format!("message is {chars} characters, limit is {MAX_CONTENT_CHARS}"),
        });
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{InferenceError, ModelError};
    use crate::provider::Supervisor;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Records every prompt it sees and answers with a fixed reply.
    #[derive(Default)]
    struct RecordingModel {
        prompts: Mutex<Vec<String>>,
        delay: Option<Duration>,
        /// Signalled once the prompt has been recorded.
        called: Notify,
    }

    #[async_trait]
    impl ModelBackend for RecordingModel {
        async fn infer(&self, prompt: &str, user_message: &str) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.called.notify_one();
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(format!("echo: {user_message}"))
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ModelBackend for FailingModel {
        async fn infer(&self, _prompt: &str, _user_message: &str) -> Result<String, ModelError> {
            Err(InferenceError::HttpError {
                status: 401,
                body: "bad key".into(),
            })
        }
    }

    struct PanickingModel;

    #[async_trait]
    impl ModelBackend for PanickingModel {
        async fn infer(&self, _prompt: &str, _user_message: &str) -> Result<String, ModelError> {
            panic!("backend bug");
        }
    }

    fn aggregator(query_timeout_ms: u64) -> (Supervisor, CapabilityAggregator) {
        let supervisor = Supervisor::new(Duration::from_millis(300));
        let aggregator =
            CapabilityAggregator::new(supervisor.clone(), Duration::from_millis(query_timeout_ms));
        (supervisor, aggregator)
    }

    #[tokio::test]
    async fn test_answer_without_providers() {
        let (_supervisor, aggregator) = aggregator(300);
        let model = Arc::new(RecordingModel::default());
        let coordinator = RequestCoordinator::new(aggregator, model.clone());

        let response = coordinator.handle(ChatRequest::new("hello")).await.unwrap();
        assert_eq!(response.content, "echo: hello");
        assert_eq!(model.prompts.lock().unwrap()[0], DEFAULT_PROMPT_INTRO);
    }

    #[tokio::test]
    async fn test_custom_intro_from_settings() {
        let (_supervisor, aggregator) = aggregator(300);
        let model = Arc::new(RecordingModel::default());
        let settings = BridgeSettings {
            system_prompt: Some("You are terse.".into()),
            ..BridgeSettings::default()
        };
        let coordinator = RequestCoordinator::from_settings(aggregator, model.clone(), &settings);

        coordinator.handle(ChatRequest::new("hi")).await.unwrap();
        assert_eq!(model.prompts.lock().unwrap()[0], "You are terse.");
    }

    #[tokio::test]
    async fn test_empty_request_is_invalid() {
        let (_supervisor, aggregator) = aggregator(300);
        let model = Arc::new(RecordingModel::default());
        let coordinator = RequestCoordinator::new(aggregator, model.clone());

        let err = coordinator.handle(ChatRequest::new("   \n")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert!(model.prompts.lock().unwrap().is_empty(), "model must not be called");
    }

    #[tokio::test]
    async fn test_oversized_request_is_invalid() {
        let (_supervisor, aggregator) = aggregator(300);
        let coordinator =
            RequestCoordinator::new(aggregator, Arc::new(RecordingModel::default()));

        let huge = "x".repeat(MAX_CONTENT_CHARS + 1);
        let err = coordinator.handle(ChatRequest::new(huge)).await.unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidRequest { .. }));

        let at_limit = "x".repeat(MAX_CONTENT_CHARS);
        assert!(coordinator.handle(ChatRequest::new(at_limit)).await.is_ok());
    }

    #[tokio::test]
    async fn test_model_error_is_translated() {
        let (_supervisor, aggregator) = aggregator(300);
        let coordinator = RequestCoordinator::new(aggregator, Arc::new(FailingModel));

        let err = coordinator.handle(ChatRequest::new("hi")).await.unwrap_err();
        match err {
            ProcessingError::ModelCallFailed { cause } => assert!(cause.contains("401")),
            other => panic!("expected ModelCallFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_model_panic_is_contained() {
        let (_supervisor, aggregator) = aggregator(300);
        let coordinator = RequestCoordinator::new(aggregator, Arc::new(PanickingModel));

        let err = coordinator.handle(ChatRequest::new("hi")).await.unwrap_err();
        assert_eq!(
            err,
            ProcessingError::ModelCallFailed {
                cause: "model call panicked".into()
            }
        );
    }

    #[tokio::test]
    async fn test_model_timeout() {
        let (_supervisor, aggregator) = aggregator(300);
        let model = Arc::new(RecordingModel {
            delay: Some(Duration::from_secs(10)),
            ..RecordingModel::default()
        });
        let coordinator = RequestCoordinator::new(aggregator, model)
            .with_model_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = coordinator.handle(ChatRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, ProcessingError::ModelCallFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    mod with_providers {
        use super::*;
        use crate::provider::supervisor::tests::{silent_provider, tool_provider};
        use crate::provider::ProviderState;

        #[tokio::test]
        async fn test_prompt_lists_provider_tools() {
            let (supervisor, aggregator) = aggregator(1000);
            supervisor
                .start(&tool_provider("calc", r#"[{"name":"add","description":"adds numbers"}]"#))
                .await
                .unwrap();
            let model = Arc::new(RecordingModel::default());
            let coordinator = RequestCoordinator::new(aggregator, model.clone());

            coordinator.handle(ChatRequest::new("2+2?")).await.unwrap();
            let prompt = model.prompts.lock().unwrap()[0].clone();
            assert!(prompt.contains("- calc.add: adds numbers"), "prompt was: {prompt}");

            supervisor.stop_all().await;
        }

        #[tokio::test]
        async fn test_stop_during_request_keeps_captured_prompt() {
            let (supervisor, aggregator) = aggregator(1000);
            supervisor
                .start(&tool_provider("calc", r#"[{"name":"add","description":"adds numbers"}]"#))
                .await
                .unwrap();
            let model = Arc::new(RecordingModel {
                delay: Some(Duration::from_millis(500)),
                ..RecordingModel::default()
            });
            let coordinator = Arc::new(RequestCoordinator::new(aggregator, model.clone()));

            let request = tokio::spawn({
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.handle(ChatRequest::new("2+2?")).await }
            });

            model.called.notified().await;
            supervisor.stop("calc").await.unwrap();
            assert_eq!(supervisor.state_of("calc"), None);

            let response = request.await.unwrap().unwrap();
            assert_eq!(response.content, "echo: 2+2?");
            assert!(model.prompts.lock().unwrap()[0].contains("calc.add"));
        }

        #[tokio::test]
        async fn test_best_effort_ignores_silent_provider() {
            let (supervisor, aggregator) = aggregator(200);
            supervisor.start(&silent_provider("search")).await.unwrap();
            let model = Arc::new(RecordingModel::default());
            let coordinator = RequestCoordinator::new(aggregator, model.clone());

            let response = coordinator.handle(ChatRequest::new("hi")).await.unwrap();
            assert_eq!(response.content, "echo: hi");
            assert_eq!(model.prompts.lock().unwrap()[0], DEFAULT_PROMPT_INTRO);
            assert_eq!(supervisor.state_of("search"), Some(ProviderState::Ready));

            supervisor.stop_all().await;
        }

        #[tokio::test]
        async fn test_required_policy_rejects_incomplete_context() {
            let (supervisor, aggregator) = aggregator(200);
            supervisor.start(&silent_provider("search")).await.unwrap();
            let model = Arc::new(RecordingModel::default());
            let coordinator = RequestCoordinator::new(aggregator, model.clone())
                .with_context_policy(ContextPolicy::Required);

            let err = coordinator.handle(ChatRequest::new("hi")).await.unwrap_err();
            match err {
                ProcessingError::ContextUnavailable { reason } => assert!(reason.contains("search")),
                other => panic!("expected ContextUnavailable, got {other:?}"),
            }
            assert!(model.prompts.lock().unwrap().is_empty());

            supervisor.stop_all().await;
        }

        #[tokio::test]
        async fn test_concurrent_requests_are_independent() {
            let (supervisor, aggregator) = aggregator(1000);
            supervisor
                .start(&tool_provider("calc", r#"[{"name":"add","description":"adds numbers"}]"#))
                .await
                .unwrap();
            let coordinator =
                RequestCoordinator::new(aggregator, Arc::new(RecordingModel::default()));

            let (a, b) = tokio::join!(
                coordinator.handle(ChatRequest::new("one")),
                coordinator.handle(ChatRequest::new(""))
            );
            assert_eq!(a.unwrap().content, "echo: one");
            assert!(matches!(b, Err(ProcessingError::InvalidRequest { .. })));

            supervisor.stop_all().await;
        }
    }
}
