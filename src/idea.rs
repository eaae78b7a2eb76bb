//! Idea records: the validated draft parsed from a model response and the
//! scored record that gets persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::complexity::{self, Complexity, TIME_TO_MARKET};
use crate::scoring::{weighted_score, WeightTable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub question: String,
    #[serde(default)]
    pub answer: String,
}

/// One criterion as evaluated by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionEvaluation {
    /// 1–10; `None` when the response carried no usable number.
    pub score: Option<u8>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub questions: Vec<QuestionAnswer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcreteExample {
    pub current_state: String,
    pub your_solution: String,
    pub key_improvement: String,
}

/// Structurally valid idea, before scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaDraft {
    pub name: String,
    pub domain: String,
    pub subdomain: Option<String>,
    pub problem: String,
    pub solution: String,
    pub quick_summary: String,
    pub concrete_example: ConcreteExample,
    /// Keyed by camelCase criterion key.
    pub evaluation: BTreeMap<String, CriterionEvaluation>,
    pub tags: Vec<String>,
}

impl IdeaDraft {
    /// Criterion key → score, for criteria with a usable score.
    pub fn scores(&self) -> BTreeMap<String, u8> {
        self.evaluation
            .iter()
            .filter_map(|(k, e)| e.score.map(|s| (k.clone(), s)))
            .collect()
    }
}

/// A scored idea as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaRecord {
    /// Row id; zero until saved.
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub subdomain: Option<String>,
    pub problem: String,
    pub solution: String,
    pub quick_summary: String,
    pub concrete_example: ConcreteExample,
    pub scores: BTreeMap<String, u8>,
    pub evaluation: BTreeMap<String, CriterionEvaluation>,
    /// Weighted aggregate, 0–100.
    pub score: u8,
    pub complexity: Complexity,
    pub tags: Vec<String>,
    pub framework: String,
    pub raw_response: String,
    pub prompt: String,
    pub session_id: Option<String>,
    pub created_at: i64,
}

impl IdeaRecord {
    pub fn from_draft(
        draft: IdeaDraft,
        weights: &WeightTable,
        framework: impl Into<String>,
        raw_response: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let scores = draft.scores();
        let score = weighted_score(&scores, weights);
        let complexity = complexity::estimate(
            &scores,
            draft
                .evaluation
                .get(TIME_TO_MARKET)
                .map(|e| e.reasoning.as_str()),
        );
        Self {
            id: 0,
            name: draft.name,
            domain: draft.domain,
            subdomain: draft.subdomain,
            problem: draft.problem,
            solution: draft.solution,
            quick_summary: draft.quick_summary,
            concrete_example: draft.concrete_example,
            scores,
            evaluation: draft.evaluation,
            score,
            complexity,
            tags: draft.tags,
            framework: framework.into(),
            raw_response: raw_response.into(),
            prompt: prompt.into(),
            session_id: None,
            created_at: 0,
        }
    }

    /// Recompute the aggregate from stored scores under a new weight table.
    pub fn rescore(&mut self, weights: &WeightTable) -> u8 {
        self.score = weighted_score(&self.scores, weights);
        self.score
    }

    /// "Domain | Subdomain", or the domain alone.
    pub fn domain_label(&self) -> String {
        match &self.subdomain {
            Some(sub) => format!("{} | {}", self.domain, sub),
            None => self.domain.clone(),
        }
    }

    /// Compact snapshot for history entries; leaves out prompt and raw response.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "domain": self.domain,
            "subdomain": self.subdomain,
            "quickSummary": self.quick_summary,
            "scores": self.scores,
            "score": self.score,
            "complexity": self.complexity,
            "framework": self.framework,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::scoring::{criterion_key, DEFAULT_CRITERIA};

    pub fn draft_with_uniform_scores(score: u8) -> IdeaDraft {
        IdeaDraft {
            name: "ShelfSense".into(),
            domain: "Retail".into(),
            subdomain: Some("Grocery".into()),
            problem: "Stockouts go unnoticed".into(),
            solution: "Shelf cameras with alerts".into(),
            quick_summary: "Computer vision for shelf gaps".into(),
            concrete_example: ConcreteExample {
                current_state: "Manual walks".into(),
                your_solution: "Camera alerts".into(),
                key_improvement: "Faster restock".into(),
            },
            evaluation: DEFAULT_CRITERIA
                .iter()
                .map(|n| {
                    (
                        criterion_key(n),
                        CriterionEvaluation {
                            score: Some(score),
                            reasoning: "fine".into(),
                            questions: vec![QuestionAnswer {
                                question: "Why?".into(),
                                answer: "Because.".into(),
                            }],
                        },
                    )
                })
                .collect(),
            tags: vec!["retail".into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::draft_with_uniform_scores;
    use super::*;

    #[test]
    fn record_scores_and_complexity_from_draft() {
        let record = IdeaRecord::from_draft(
            draft_with_uniform_scores(8),
            &WeightTable::default(),
            "Unbundling",
            "{}",
            "prompt",
        );
        assert_eq!(record.score, 80);
        assert_eq!(record.complexity.technical, 3.0);
        assert_eq!(record.complexity.regulatory, 3.0);
        assert_eq!(record.complexity.sales, 3.0);
        assert_eq!(record.complexity.total, 9.0);
        assert_eq!(record.domain_label(), "Retail | Grocery");
    }

    #[test]
    fn rescore_uses_stored_scores() {
        let mut record = IdeaRecord::from_draft(
            draft_with_uniform_scores(6),
            &WeightTable::default(),
            "f",
            "",
            "",
        );
        record.scores.insert("marketSize".into(), 10);
        let weights = WeightTable::from_named([("Market Size", 1.0)]);
        assert_eq!(record.rescore(&weights), 100);
    }

    #[test]
    fn unscored_criteria_are_left_out() {
        let mut draft = draft_with_uniform_scores(7);
        if let Some(e) = draft.evaluation.get_mut("marketSize") {
            e.score = None;
        }
        assert_eq!(draft.scores().len(), 9);
    }
}
