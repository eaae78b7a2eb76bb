//! Secondary difficulty metrics derived from scored criteria.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const TECHNICAL_FEASIBILITY: &str = "technicalFeasibility";
pub const TIME_TO_MARKET: &str = "timeToMarket";
pub const MARKET_SIZE: &str = "marketSize";
pub const MONETIZATION_CLARITY: &str = "monetizationClarity";

/// Score assumed for a criterion the response did not provide.
const MISSING_SCORE: f64 = 5.0;
/// Regulatory complexity when the time-to-market reasoning names no regulatory hurdle.
const BASELINE_REGULATORY: f64 = 3.0;

static REGULATORY_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)regulat|complian|licens|legal|permit|approval|certif")
        .expect("regulatory pattern is valid")
});

/// Technical, regulatory and sales complexity, each 1–10 with one decimal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Complexity {
    pub technical: f64,
    pub regulatory: f64,
    pub sales: f64,
    pub total: f64,
}

impl Complexity {
    pub fn new(technical: f64, regulatory: f64, sales: f64) -> Self {
        let technical = component(technical);
        let regulatory = component(regulatory);
        let sales = component(sales);
        Self {
            technical,
            regulatory,
            sales,
            total: technical + regulatory + sales,
        }
    }
}

/// Derive complexity from criterion scores and the time-to-market reasoning.
pub fn estimate(scores: &BTreeMap<String, u8>, time_to_market_reasoning: Option<&str>) -> Complexity {
    let score = |key: &str| scores.get(key).map(|&s| f64::from(s)).unwrap_or(MISSING_SCORE);

    let technical = 11.0 - score(TECHNICAL_FEASIBILITY);

    let regulatory = match time_to_market_reasoning {
        Some(text) if REGULATORY_HINT.is_match(text) => 11.0 - score(TIME_TO_MARKET),
        _ => BASELINE_REGULATORY,
    };

    let sales = 11.0 - (score(MARKET_SIZE) + score(MONETIZATION_CLARITY)) / 2.0;

    Complexity::new(technical, regulatory, sales)
}

fn component(value: f64) -> f64 {
    let clamped = value.clamp(1.0, 10.0);
    (clamped * 10.0).round() / 10.0
}
