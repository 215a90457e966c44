use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// USD per million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

const fn usd(cents: i64) -> Decimal {
    Decimal::from_parts(cents as u32, 0, 0, false, 2)
}

// Longest prefix first; the first match wins.
const PRICE_TABLE: &[(&str, ModelPricing)] = &[
    ("claude-opus", ModelPricing { input_per_million: usd(1500), output_per_million: usd(7500) }),
    ("claude-sonnet", ModelPricing { input_per_million: usd(300), output_per_million: usd(1500) }),
    ("claude-haiku", ModelPricing { input_per_million: usd(80), output_per_million: usd(400) }),
    ("gpt-4o-mini", ModelPricing { input_per_million: usd(15), output_per_million: usd(60) }),
    ("gpt-4o", ModelPricing { input_per_million: usd(250), output_per_million: usd(1000) }),
    ("llama", ModelPricing { input_per_million: usd(0), output_per_million: usd(0) }),
];

const FALLBACK: ModelPricing =
    ModelPricing { input_per_million: usd(300), output_per_million: usd(1500) };

pub fn pricing_for(model: &str) -> ModelPricing {
    let model = model.trim().to_ascii_lowercase();
    PRICE_TABLE
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, pricing)| *pricing)
        .unwrap_or(FALLBACK)
}

pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> Decimal {
    let pricing = pricing_for(model);
    let million = Decimal::from(1_000_000u64);
    (Decimal::from(input_tokens) * pricing.input_per_million
        + Decimal::from(output_tokens) * pricing.output_per_million)
        / million
}
