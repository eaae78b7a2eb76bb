//! OpenAI-compatible embeddings adapter.
//!
//! The API key is resolved through a [`CredentialSource`] on every call, so a
//! credential rotated in the store is picked up without rebuilding the adapter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::embedding_cost;
use super::types::{EmbedModel, EmbedRequest, EmbedResponse};
use super::usage::{ProviderCallRecord, UsageSink};
use crate::credentials::{CredentialSource, EMBEDDING_PROVIDER};

pub const DEFAULT_EMBEDDINGS_BASE_URL: &str = "https://api.openai.com/v1";

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

#[derive(Serialize)]
struct EmbeddingApiRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
    usage: Option<EmbeddingUsage>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingUsage {
    prompt_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialSource>,
    usage_sink: Arc<dyn UsageSink>,
}

impl OpenAiEmbeddings {
    pub fn new(
        credentials: Arc<dyn CredentialSource>,
        usage_sink: Arc<dyn UsageSink>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            credentials,
            usage_sink,
        })
    }

    async fn call(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let credential = self
            .credentials
            .active_credential(EMBEDDING_PROVIDER)
            .await
            .map_err(|e| ProviderError::config(format!("credential lookup failed: {e}")))?
            .ok_or_else(|| ProviderError::config("no active embedding credential"))?;

        let base_url = credential
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_EMBEDDINGS_BASE_URL)
            .trim_end_matches('/');
        // A credential-level model overrides the request default.
        let model = credential
            .model
            .as_deref()
            .map(EmbedModel::from_id)
            .unwrap_or_else(|| req.model.clone());

        let start = Instant::now();
        let response = self
            .client
            .post(format!("{base_url}/embeddings"))
            .bearer_auth(&credential.api_key)
            .json(&EmbeddingApiRequest {
                model: model.as_str(),
                input: &req.text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let ctx = ErrorContext::new().with_status(status.as_u16());
            let preview: String = body.chars().take(200).collect();
            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited("openai", Duration::from_secs(60), ctx),
                code => ProviderError::provider_with_context(
                    "openai",
                    format!("HTTP {code}: {preview}"),
                    code >= 500,
                    ctx,
                ),
            });
        }

        let parsed: EmbeddingApiResponse = response.json().await.map_err(|e| {
            ProviderError::provider("openai", format!("Invalid embedding JSON: {e}"), false)
        })?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProviderError::provider("openai", "Empty embedding response", false))?;

        if let Some(expected) = model.dimensions() {
            if embedding.len() != expected {
                tracing::warn!(
                    model = model.as_str(),
                    expected,
                    actual = embedding.len(),
                    "embedding dimension differs from model default"
                );
            }
        }

        let tokens = parsed
            .usage
            .and_then(|u| u.prompt_tokens.or(u.total_tokens))
            .unwrap_or(0);

        Ok(EmbedResponse {
            embedding,
            tokens,
            cost_nanodollars: embedding_cost(model.as_str(), tokens),
            latency: start.elapsed(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let result = self.call(&req).await;

        let record = ProviderCallRecord::new(
            "openai",
            "embeddings",
            req.model.as_str(),
            req.attribution.caller,
        )
        .session(req.attribution.session_id.clone())
        .slot(req.attribution.slot_id);
        let record = match &result {
            Ok(resp) => record
                .tokens(resp.tokens as i32, 0)
                .cost(resp.cost_nanodollars)
                .latency(resp.latency.as_millis() as i32),
            Err(e) => record.error(e.code()),
        };
        self.usage_sink.record(record).await;

        result
    }
}
