//! API credential lookup and per-run chat gateway construction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::openrouter::{self, OpenRouterAdapter};
use crate::gateway::{ChatGateway, GatewayConfig, ProviderError, ProviderGateway, UsageSink};
use crate::store::{IdeaStore, StoreError};

/// Provider key for the generation model.
pub const CHAT_PROVIDER: &str = "openrouter";
/// Provider key for the embedding model.
pub const EMBEDDING_PROVIDER: &str = "openai";

pub const DEFAULT_CHAT_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredential {
    pub provider: String,
    pub api_key: String,
    /// Model id to use with this credential; provider default when absent.
    pub model: Option<String>,
    pub base_url: Option<String>,
}

impl ApiCredential {
    pub fn new(provider: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            model: None,
            base_url: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Key with everything but the last four characters masked.
    pub fn masked_key(&self) -> String {
        let n = self.api_key.chars().count();
        if n <= 4 {
            return "****".to_string();
        }
        let tail: String = self.api_key.chars().skip(n - 4).collect();
        format!("****{tail}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential store: {0}")]
    Store(#[from] StoreError),
}

/// Resolves the active credential for a provider at call time.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn active_credential(
        &self,
        provider: &str,
    ) -> Result<Option<ApiCredential>, CredentialError>;
}

#[async_trait]
impl CredentialSource for IdeaStore {
    async fn active_credential(
        &self,
        provider: &str,
    ) -> Result<Option<ApiCredential>, CredentialError> {
        Ok(IdeaStore::active_credential(self, provider).await?)
    }
}

/// Reads credentials from the environment on every lookup.
///
/// | provider   | key                  | base url              | model              |
/// |------------|----------------------|-----------------------|--------------------|
/// | openrouter | `OPENROUTER_API_KEY` | `OPENROUTER_BASE_URL` | `OPENROUTER_MODEL` |
/// | openai     | `OPENAI_API_KEY`     | `OPENAI_BASE_URL`     | `OPENAI_EMBEDDING_MODEL` |
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

#[async_trait]
impl CredentialSource for EnvCredentials {
    async fn active_credential(
        &self,
        provider: &str,
    ) -> Result<Option<ApiCredential>, CredentialError> {
        let (key_var, url_var, model_var) = match provider {
            CHAT_PROVIDER => ("OPENROUTER_API_KEY", "OPENROUTER_BASE_URL", "OPENROUTER_MODEL"),
            EMBEDDING_PROVIDER => ("OPENAI_API_KEY", "OPENAI_BASE_URL", "OPENAI_EMBEDDING_MODEL"),
            _ => return Ok(None),
        };
        let Some(api_key) = std::env::var(key_var).ok().filter(|k| !k.trim().is_empty()) else {
            return Ok(None);
        };
        Ok(Some(ApiCredential {
            provider: provider.to_string(),
            api_key,
            model: std::env::var(model_var).ok(),
            base_url: std::env::var(url_var).ok(),
        }))
    }
}

/// Tries each source in order and returns the first credential found.
pub struct ChainedCredentials {
    sources: Vec<Arc<dyn CredentialSource>>,
}

impl ChainedCredentials {
    pub fn new(sources: Vec<Arc<dyn CredentialSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl CredentialSource for ChainedCredentials {
    async fn active_credential(
        &self,
        provider: &str,
    ) -> Result<Option<ApiCredential>, CredentialError> {
        for source in &self.sources {
            if let Some(cred) = source.active_credential(provider).await? {
                return Ok(Some(cred));
            }
        }
        Ok(None)
    }
}

/// Builds a chat gateway bound to a verified credential.
pub trait ModelConnector: Send + Sync {
    fn connect(&self, credential: &ApiCredential) -> Result<Arc<dyn ChatGateway>, ProviderError>;
}

pub struct OpenRouterConnector {
    usage_sink: Arc<dyn UsageSink>,
    timeout: Duration,
    gateway_config: GatewayConfig,
}

impl OpenRouterConnector {
    pub fn new(usage_sink: Arc<dyn UsageSink>) -> Self {
        Self {
            usage_sink,
            timeout: openrouter::timeout_from_env(),
            gateway_config: GatewayConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ModelConnector for OpenRouterConnector {
    fn connect(&self, credential: &ApiCredential) -> Result<Arc<dyn ChatGateway>, ProviderError> {
        let adapter = OpenRouterAdapter::with_config(
            &credential.api_key,
            credential
                .base_url
                .as_deref()
                .unwrap_or(openrouter::DEFAULT_BASE_URL),
            self.timeout,
            std::env::var("OPENROUTER_REFERER").ok(),
            std::env::var("OPENROUTER_APP_TITLE").ok(),
        )?;
        Ok(Arc::new(ProviderGateway::with_config(
            adapter,
            self.usage_sink.clone(),
            self.gateway_config.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<ApiCredential>);

    #[async_trait]
    impl CredentialSource for Fixed {
        async fn active_credential(
            &self,
            _provider: &str,
        ) -> Result<Option<ApiCredential>, CredentialError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn masked_key_keeps_last_four() {
        assert_eq!(ApiCredential::new("openai", "sk-abcdef1234").masked_key(), "****1234");
        assert_eq!(ApiCredential::new("openai", "abc").masked_key(), "****");
    }

    #[tokio::test]
    async fn chained_returns_first_hit() {
        let chain = ChainedCredentials::new(vec![
            Arc::new(Fixed(None)),
            Arc::new(Fixed(Some(ApiCredential::new("openrouter", "second")))),
            Arc::new(Fixed(Some(ApiCredential::new("openrouter", "third")))),
        ]);
        let cred = chain.active_credential(CHAT_PROVIDER).await.unwrap().unwrap();
        assert_eq!(cred.api_key, "second");
    }

    #[tokio::test]
    async fn env_source_ignores_unknown_provider() {
        let cred = EnvCredentials.active_credential("anthropic").await.unwrap();
        assert!(cred.is_none());
    }
}
