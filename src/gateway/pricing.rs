//! Token prices for the vision models the annotator is pointed at.
//!
//! Prices are nanodollars (1e-9 USD) per token, taken from the OpenRouter
//! model pages. Image inputs are billed as prompt tokens, so no separate
//! image rate is needed.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn per_million(input_usd_micros: i64, output_usd_micros: i64) -> Self {
        // $X per 1M tokens == X * 1000 nanodollars per token.
        Self {
            input_nanos_per_token: input_usd_micros / 1_000,
            output_nanos_per_token: output_usd_micros / 1_000,
        }
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        i64::from(input_tokens) * self.input_nanos_per_token
            + i64::from(output_tokens) * self.output_nanos_per_token
    }
}

/// Used for models missing from the table.
pub const FALLBACK_PRICING: ModelPricing = ModelPricing::per_million(3_000_000, 15_000_000);

const VISION_MODELS: &[(&str, ModelPricing)] = &[
    ("anthropic/claude-3.5-sonnet", ModelPricing::per_million(3_000_000, 15_000_000)),
    ("anthropic/claude-3.7-sonnet", ModelPricing::per_million(3_000_000, 15_000_000)),
    ("anthropic/claude-3.5-haiku", ModelPricing::per_million(800_000, 4_000_000)),
    ("openai/gpt-4o", ModelPricing::per_million(2_500_000, 10_000_000)),
    ("openai/gpt-4o-mini", ModelPricing::per_million(150_000, 600_000)),
    ("google/gemini-flash-1.5", ModelPricing::per_million(75_000, 300_000)),
];

pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    // OpenRouter variants such as ":beta" share the base price.
    let base = model.split(':').next().unwrap_or(model);
    VISION_MODELS
        .iter()
        .find(|(id, _)| *id == base)
        .map(|(_, p)| *p)
}

/// Estimated cost of one call, in nanodollars.
pub fn estimate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    pricing_for(model)
        .unwrap_or(FALLBACK_PRICING)
        .cost(input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpt_4o_mini_image_call() {
        // ~1k prompt tokens for a 1024px image plus prompt, 300 tokens of JSON.
        assert_eq!(estimate_cost("openai/gpt-4o-mini", 1_000, 300), 150_000 + 180_000);
    }

    #[test]
    fn variant_suffix_and_unknown_models() {
        assert_eq!(
            pricing_for("anthropic/claude-3.5-sonnet:beta"),
            pricing_for("anthropic/claude-3.5-sonnet")
        );
        assert_eq!(estimate_cost("someone/unlisted", 1, 1), 3_000 + 15_000);
    }
}
