//! Model-service seam: one request in, one text reply out.
//!
//! Both external models (the vision extractor and the text transformer) sit
//! behind [`ModelService`]. The production adapter, [`ProviderService`],
//! forwards to an `edgequake_llm` provider; tests plug in scripted fakes.
//! Retry, backoff and the bounded wait live in [`call_with_retry`] so every
//! service, real or fake, gets the same policy.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! with 500 ms base and 3 retries waits 500 ms → 1 s → 2 s. Each attempt is
//! wrapped in `tokio::time::timeout`, so no call blocks indefinitely.

use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// One call to a model service.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// 1-based page number for per-page calls, `None` for document calls.
    pub page: Option<usize>,
    pub system: String,
    pub user: String,
    pub image: Option<ImageData>,
}

/// Raw text answer plus token accounting.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// An opaque request/response model endpoint.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Short identity for logs, e.g. `"openai/gpt-4.1-nano"`.
    fn name(&self) -> String;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, String>;
}

/// Adapter from an `edgequake_llm` provider to [`ModelService`].
pub struct ProviderService {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl ProviderService {
    pub fn new(provider: Arc<dyn LLMProvider>, temperature: f32, max_tokens: usize) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(temperature),
                max_tokens: Some(max_tokens),
                ..Default::default()
            },
        }
    }

    /// Message layout: system prompt, then one user turn. Page calls attach
    /// the image to the user turn.
    fn build_messages(request: &ModelRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(request.system.as_str())];
        match &request.image {
            Some(img) => messages.push(ChatMessage::user_with_images(
                request.user.as_str(),
                vec![img.clone()],
            )),
            None => messages.push(ChatMessage::user(request.user.as_str())),
        }
        messages
    }
}

#[async_trait]
impl ModelService for ProviderService {
    fn name(&self) -> String {
        format!("{}/{}", self.provider.name(), self.provider.model())
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, String> {
        let messages = Self::build_messages(request);
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| e.to_string())?;
        Ok(ModelReply {
            content: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

/// Retry and timeout settings for one class of call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

/// Why a call produced no reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// The service kept erroring.
    Failed { retries: u32, detail: String },
    /// The last attempt exceeded the bounded wait.
    TimedOut { secs: u64 },
}

/// Delay before retry number `attempt` (1-based): `base × 2^(attempt-1)`,
/// saturating instead of overflowing.
fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    2u64.saturating_pow(attempt.saturating_sub(1)).saturating_mul(base_ms)
}

/// Call `service`, retrying transient failures with exponential backoff.
pub async fn call_with_retry(
    service: &dyn ModelService,
    request: &ModelRequest,
    policy: RetryPolicy,
) -> Result<ModelReply, CallFailure> {
    let label = match request.page {
        Some(p) => format!("Page {p}"),
        None => "Transform".to_string(),
    };
    let wait = Duration::from_secs(policy.timeout_secs.max(1));
    let mut last = CallFailure::Failed {
        retries: 0,
        detail: "Unknown error".to_string(),
    };

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let backoff = backoff_delay_ms(policy.backoff_ms, attempt);
            warn!(
                "{}: retry {}/{} after {}ms",
                label, attempt, policy.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match timeout(wait, service.complete(request)).await {
            Ok(Ok(reply)) => {
                debug!(
                    "{}: {} input tokens, {} output tokens via {}",
                    label,
                    reply.input_tokens,
                    reply.output_tokens,
                    service.name()
                );
                return Ok(reply);
            }
            Ok(Err(detail)) => {
                warn!("{}: attempt {} failed: {}", label, attempt + 1, detail);
                last = CallFailure::Failed {
                    retries: attempt,
                    detail,
                };
            }
            Err(_) => {
                warn!(
                    "{}: attempt {} timed out after {}s",
                    label,
                    attempt + 1,
                    wait.as_secs()
                );
                last = CallFailure::TimedOut {
                    secs: wait.as_secs(),
                };
            }
        }
    }

    Err(last)
}
