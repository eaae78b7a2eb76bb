//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// text-embedding-3-large: $0.13/1M tokens
// text-embedding-3-small: $0.02/1M tokens
const OPENAI_EMBED_3_LARGE: ModelPricing = ModelPricing::new(130, 0);
const OPENAI_EMBED_3_SMALL: ModelPricing = ModelPricing::new(20, 0);

// OpenRouter list prices (verify periodically against the model pages)
const CLAUDE_35_HAIKU: ModelPricing = ModelPricing::new(800, 4_000);
const CLAUDE_35_SONNET: ModelPricing = ModelPricing::new(3_000, 15_000);
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);
const GPT_4O: ModelPricing = ModelPricing::new(2_500, 10_000);
const GPT_5_MINI: ModelPricing = ModelPricing::new(250, 2_000);

/// Fallback for models missing from the table.
const UNKNOWN_CHAT: ModelPricing = ModelPricing::new(1_000, 5_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();
    map.insert("text-embedding-3-large", OPENAI_EMBED_3_LARGE);
    map.insert("text-embedding-3-small", OPENAI_EMBED_3_SMALL);
    map.insert("anthropic/claude-3-5-haiku", CLAUDE_35_HAIKU);
    map.insert("anthropic/claude-3-5-sonnet", CLAUDE_35_SONNET);
    map.insert("openai/gpt-4o-mini", GPT_4O_MINI);
    map.insert("openai/gpt-4o", GPT_4O);
    map.insert("openai/gpt-5-mini", GPT_5_MINI);
    map
}

pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    PRICING_MAP.get_or_init(init_pricing).get(model_id).copied()
}

pub fn embedding_cost(model: &str, tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(OPENAI_EMBED_3_SMALL)
        .calculate_cost(tokens, 0)
}

pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(UNKNOWN_CHAT)
        .calculate_cost(input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_cost() {
        // 1M tokens at $0.02/1M = 20,000,000 nanodollars
        assert_eq!(embedding_cost("text-embedding-3-small", 1_000_000), 20_000_000);
    }

    #[test]
    fn test_chat_cost() {
        // 1000 * 800 + 1000 * 4000
        assert_eq!(chat_cost("anthropic/claude-3-5-haiku", 1_000, 1_000), 4_800_000);
    }

    #[test]
    fn unknown_model_uses_fallback() {
        assert_eq!(chat_cost("someone/new-model", 1, 1), 6_000);
    }
}
