//! Weighted aggregate scoring over a dynamic criteria set.
//!
//! Criteria are keyed by the camelCase form of their display name. The weight table
//! decides which criteria count: a scored criterion with no weight entry contributes to
//! neither numerator nor denominator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Display names of the criteria used when no weighted criteria are configured.
pub const DEFAULT_CRITERIA: [&str; 10] = [
    "Market Size",
    "Problem Severity",
    "Competitive Advantage",
    "Technical Feasibility",
    "Monetization Clarity",
    "Time To Market",
    "Scalability",
    "Customer Acquisition",
    "Defensibility",
    "Founder Market Fit",
];

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 10;

/// camelCase key for a criterion display name.
///
/// `"Market Size"` becomes `"marketSize"`, `"ROI Potential"` becomes `"roiPotential"`,
/// and an already camelCased key is returned unchanged.
pub fn criterion_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for (i, word) in name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .enumerate()
    {
        let all_upper = word.chars().all(|c| !c.is_lowercase());
        let mut chars = word.chars();
        let Some(first) = chars.next() else { continue };
        if i == 0 {
            key.extend(first.to_lowercase());
        } else {
            key.extend(first.to_uppercase());
        }
        if all_upper {
            key.extend(chars.flat_map(char::to_lowercase));
        } else {
            key.extend(chars);
        }
    }
    key
}

/// Criterion key → weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    weights: BTreeMap<String, f64>,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            weights: DEFAULT_CRITERIA
                .iter()
                .map(|name| (criterion_key(name), 1.0))
                .collect(),
        }
    }
}

impl WeightTable {
    /// Build from `(display name, weight)` pairs. An empty input yields the default table.
    /// Non-positive or non-finite weights are read as 1.
    pub fn from_named<'a, I>(criteria: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let weights: BTreeMap<String, f64> = criteria
            .into_iter()
            .map(|(name, w)| {
                let w = if w.is_finite() && w > 0.0 { w } else { 1.0 };
                (criterion_key(name), w)
            })
            .collect();
        if weights.is_empty() {
            return Self::default();
        }
        Self { weights }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.weights.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// `round(100 * Σ(score·weight) / Σ(10·weight))`, in 0..=100.
///
/// Returns 0 when no scored criterion has a weight.
pub fn weighted_score(scores: &BTreeMap<String, u8>, weights: &WeightTable) -> u8 {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (key, &score) in scores {
        let Some(weight) = weights.get(key) else {
            continue;
        };
        numerator += f64::from(score) * weight;
        denominator += f64::from(MAX_SCORE) * weight;
    }
    if denominator <= 0.0 {
        return 0;
    }
    (100.0 * numerator / denominator).round().clamp(0.0, 100.0) as u8
}
