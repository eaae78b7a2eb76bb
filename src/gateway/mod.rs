//! Provider gateway: OpenRouter chat completions and OpenAI-compatible embeddings.

pub mod embeddings;
pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::{CallStatus, ProviderCallRecord};

pub use embeddings::{EmbeddingProvider, OpenAiEmbeddings};
pub use error::{ErrorContext, ProviderError};
pub use pricing::*;
pub use types::*;
pub use usage::{MemoryUsageSink, NoopUsageSink, StderrUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    /// Generation makes a single attempt per run; the next scheduled run is the retry.
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway {
    openrouter: OpenRouterAdapter,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl ChatGateway for ProviderGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl ProviderGateway {
    pub fn from_env(usage_sink: Arc<dyn UsageSink>) -> Result<Self, ProviderError> {
        Ok(Self {
            openrouter: OpenRouterAdapter::from_env()?,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(
        openrouter: OpenRouterAdapter,
        usage_sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            openrouter,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.openrouter.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, Some(&resp), CallStatus::Success, None, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(
                        &req,
                        None,
                        CallStatus::Error,
                        Some(err.code()),
                        err.request_id().map(str::to_string),
                    )
                    .await;

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying chat completion"
                    );
                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: Option<&ChatResponse>,
        status: CallStatus,
        error_code: Option<&str>,
        request_id: Option<String>,
    ) {
        let mut record = ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .session(req.attribution.session_id.clone())
        .slot(req.attribution.slot_id)
        .request_id(request_id);

        if let Some(resp) = resp {
            record = record
                .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
                .cost(resp.cost_nanodollars)
                .upstream_cost(resp.upstream_cost_nanodollars)
                .latency(resp.latency.as_millis() as i32);
        }
        if status == CallStatus::Error {
            record = record.error(error_code.unwrap_or("provider_error"));
        }

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
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
    fn default_config_makes_one_attempt() {
        assert_eq!(GatewayConfig::default().max_retries, 0);
    }
}
