//! Provider gateway for chat completions.
//!
//! Two wire adapters cover the supported provider families:
//! - [`openai::OpenAiCompatAdapter`] speaks `/chat/completions` (OpenAI, xAI)
//! - [`anthropic::AnthropicAdapter`] speaks the Anthropic Messages API
//!
//! [`ProviderGateway`] wraps either one with transport retries and usage
//! reporting.

pub mod anthropic;
pub mod error;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tokio::time::sleep;

use usage::{CallStatus, ProviderCallRecord};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// Maximum allowed response content length (1MB).
pub(crate) const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters.
pub(crate) const MAX_INPUT_CHARS: usize = 500_000;

/// A wire adapter for one provider family.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name used in errors and usage records.
    fn name(&self) -> &'static str;

    /// Endpoint label used in usage records.
    fn endpoint(&self) -> &'static str;

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// A chat client as seen by the structured-response layer.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Transport-level retries for retryable errors (429, 5xx, connect/timeouts).
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        // The evaluation runner owns the logical retry policy.
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway {
    provider: Arc<dyn ChatProvider>,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

#[async_trait]
impl ChatGateway for ProviderGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl ProviderGateway {
    pub fn new(provider: Arc<dyn ChatProvider>, usage_sink: Arc<dyn UsageSink>) -> Self {
        Self::with_config(provider, usage_sink, GatewayConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn ChatProvider>,
        usage_sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, attempt, CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(
                        &req,
                        &ChatResponse::empty(),
                        attempt,
                        CallStatus::Error,
                        Some(code),
                    )
                    .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::debug!(
                        provider = self.provider.name(),
                        attempt,
                        ?delay,
                        error = %err,
                        "retrying provider call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::provider(self.provider.name(), "unknown error", false)
        }))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        attempt: u32,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            self.provider.name(),
            self.provider.endpoint(),
            req.model.clone(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .run(req.attribution.run_id)
        .latency(resp.latency.as_millis() as u64)
        .attempt(attempt);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

// =============================================================================
// Shared adapter helpers
// =============================================================================

pub(crate) fn build_http_client(
    headers: HeaderMap,
    timeout: Duration,
) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .gzip(true)
        .build()
        .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))
}

pub(crate) fn check_input_size(req: &ChatRequest) -> Result<(), ProviderError> {
    let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
    if total_chars > MAX_INPUT_CHARS {
        return Err(ProviderError::invalid_request(format!(
            "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
        )));
    }
    Ok(())
}

/// Read a response body, enforcing the size limit while streaming.
pub(crate) async fn read_body_limited(
    provider: &'static str,
    mut response: reqwest::Response,
) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::provider(
                provider,
                format!("Response too large: {new_len} bytes"),
                false,
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// Extract a request ID from response headers.
pub(crate) fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    ["x-request-id", "request-id"]
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Check if message indicates a refusal.
pub(crate) fn is_refusal(msg: &str) -> bool {
    let l = msg.trim_start().to_lowercase();
    let first_line = l.lines().next().unwrap_or("");

    const PREFIXES: &[&str] = &[
        "refus",
        "i cannot",
        "i can't",
        "i won't",
        "i will not",
        "i am unable to",
        "i'm unable to",
        "unable to comply",
        "unable to assist",
        "unable to help",
        "unable to provide",
    ];

    PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }

    #[test]
    fn refusal_prefixes() {
        assert!(is_refusal("I cannot rate myself on that."));
        assert!(is_refusal("  I'm unable to provide a personal opinion"));
        assert!(!is_refusal("4"));
        assert!(!is_refusal(r#"{"score": 2}"#));
    }

    #[test]
    fn request_id_header_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("request-id", "req_abc".parse().unwrap());
        assert_eq!(extract_request_id(&headers).as_deref(), Some("req_abc"));
    }
}
