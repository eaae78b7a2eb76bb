//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for cost tracking and debugging.
///
/// Every request through the gateway carries attribution so usage records can be
/// tied back to a generation session and, for unattended runs, the slot that
/// triggered it.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Generation session this request belongs to.
    pub session_id: Option<String>,
    /// Schedule slot that triggered the run, if any.
    pub slot_id: Option<i64>,
    /// Which code path made this call, e.g. "orchestrator::generate".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_slot(mut self, slot_id: Option<i64>) -> Self {
        self.slot_id = slot_id;
        self
    }
}

// =============================================================================
// EMBEDDING TYPES
// =============================================================================

/// Embedding model to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedModel {
    /// OpenAI text-embedding-3-large (3072 dimensions)
    OpenAI3Large,
    /// OpenAI text-embedding-3-small (1536 dimensions)
    OpenAI3Small,
    /// Any other OpenAI-compatible embedding model, by id.
    Custom(String),
}

impl EmbedModel {
    pub fn from_id(id: &str) -> Self {
        match id {
            "text-embedding-3-large" => EmbedModel::OpenAI3Large,
            "text-embedding-3-small" => EmbedModel::OpenAI3Small,
            other => EmbedModel::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EmbedModel::OpenAI3Large => "text-embedding-3-large",
            EmbedModel::OpenAI3Small => "text-embedding-3-small",
            EmbedModel::Custom(id) => id,
        }
    }

    /// Expected vector length, when known.
    pub fn dimensions(&self) -> Option<usize> {
        match self {
            EmbedModel::OpenAI3Large => Some(3072),
            EmbedModel::OpenAI3Small => Some(1536),
            EmbedModel::Custom(_) => None,
        }
    }
}

impl Default for EmbedModel {
    fn default() -> Self {
        EmbedModel::OpenAI3Small
    }
}

/// Request to embed a single text.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub model: EmbedModel,
    pub text: String,
    pub attribution: Attribution,
}

impl EmbedRequest {
    pub fn new(model: EmbedModel, text: impl Into<String>, attribution: Attribution) -> Self {
        Self {
            model,
            text: text.into(),
            attribution,
        }
    }
}

/// Response from an embedding request.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    pub embedding: Vec<f32>,
    /// Total tokens consumed.
    pub tokens: u32,
    /// Cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    pub latency: Duration,
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chat model specification.
#[derive(Debug, Clone)]
pub enum ChatModel {
    /// OpenRouter model, e.g. "anthropic/claude-3-5-haiku"
    OpenRouter(String),
}

impl ChatModel {
    pub fn openrouter(model_id: impl Into<String>) -> Self {
        ChatModel::OpenRouter(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::OpenRouter(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ChatModel::OpenRouter(_) => "openrouter",
        }
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: ChatModel,
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Whether to request JSON output.
    pub json_mode: bool,
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            json_mode: false,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// Total characters across all messages.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cost in nanodollars.
    pub cost_nanodollars: i64,
    /// Provider-reported upstream inference cost (nanodollars), if available.
    pub upstream_cost_nanodollars: Option<i64>,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Plain successful response, handy for fakes.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Stop,
        }
    }

    /// Whether the model was cut off by the token limit.
    pub fn truncated(&self) -> bool {
        self.finish_reason == FinishReason::Length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_model_ids_round_trip() {
        assert_eq!(EmbedModel::from_id("text-embedding-3-small"), EmbedModel::OpenAI3Small);
        assert_eq!(EmbedModel::from_id("nomic-embed").as_str(), "nomic-embed");
        assert_eq!(EmbedModel::OpenAI3Large.dimensions(), Some(3072));
    }

    #[test]
    fn finish_reason_parses_length() {
        let resp = ChatResponse {
            finish_reason: FinishReason::from(Some("length".to_string())),
            ..ChatResponse::text("{")
        };
        assert!(resp.truncated());
    }
}
