//! Semantic duplicate detection over stored idea embeddings.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::{Attribution, EmbedModel, EmbedRequest, EmbeddingProvider, ProviderError};
use crate::idea::IdeaDraft;
use crate::store::{IdeaStore, StoreError};

pub const DEFAULT_THRESHOLD: f64 = 0.85;
pub const DEFAULT_TOP_K: usize = 10;

/// Joins the fields of the summary text that gets embedded.
pub const SUMMARY_DELIMITER: &str = " | ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateMatch {
    pub idea_id: i64,
    pub name: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateReport {
    pub embedding: Vec<f32>,
    pub model: String,
    /// Most similar first; all at or above the threshold.
    pub matches: Vec<DuplicateMatch>,
}

impl DuplicateReport {
    pub fn best(&self) -> Option<&DuplicateMatch> {
        self.matches.first()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),
    #[error("similarity search failed: {0}")]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait DuplicateDetector: Send + Sync {
    /// Embed the draft and find stored ideas above the similarity threshold.
    async fn check(
        &self,
        draft: &IdeaDraft,
        exclude_id: Option<i64>,
        attribution: Attribution,
    ) -> Result<DuplicateReport, DedupError>;
}

/// Text embedded for an idea: domain, subdomain, problem, solution and quick summary.
pub fn summary_text(draft: &IdeaDraft) -> String {
    [
        Some(draft.domain.as_str()),
        draft.subdomain.as_deref(),
        Some(draft.problem.as_str()),
        Some(draft.solution.as_str()),
        Some(draft.quick_summary.as_str()),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(SUMMARY_DELIMITER)
}

/// Cosine similarity, or `None` on length mismatch or a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

pub struct EmbeddingDuplicateDetector {
    embedder: Arc<dyn EmbeddingProvider>,
    store: IdeaStore,
    model: EmbedModel,
    threshold: f64,
    top_k: usize,
}

impl EmbeddingDuplicateDetector {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: IdeaStore) -> Self {
        Self {
            embedder,
            store,
            model: EmbedModel::default(),
            threshold: DEFAULT_THRESHOLD,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_model(mut self, model: EmbedModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

#[async_trait]
impl DuplicateDetector for EmbeddingDuplicateDetector {
    async fn check(
        &self,
        draft: &IdeaDraft,
        exclude_id: Option<i64>,
        attribution: Attribution,
    ) -> Result<DuplicateReport, DedupError> {
        let text = summary_text(draft);
        let response = self
            .embedder
            .embed(EmbedRequest::new(self.model.clone(), text, attribution))
            .await?;
        let matches = self
            .store
            .similar_ideas(&response.embedding, exclude_id, self.top_k, self.threshold)
            .await?;
        Ok(DuplicateReport {
            embedding: response.embedding,
            model: self.model.as_str().to_string(),
            matches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::EmbedResponse;
    use crate::idea::fixtures::draft_with_uniform_scores;
    use crate::idea::IdeaRecord;
    use crate::scoring::WeightTable;
    use std::time::Duration;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed(&self, _req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
            Ok(EmbedResponse {
                embedding: self.0.clone(),
                tokens: 3,
                cost_nanodollars: 0,
                latency: Duration::from_millis(1),
            })
        }
    }

    async fn store_with(embedding: &[f32]) -> (IdeaStore, i64) {
        let store = IdeaStore::in_memory().unwrap();
        let record = IdeaRecord::from_draft(
            draft_with_uniform_scores(5),
            &WeightTable::default(),
            "f",
            "",
            "",
        );
        let id = store.insert_idea(&record).await.unwrap();
        store.put_embedding(id, "m", embedding).await.unwrap();
        (store, id)
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
    }

    #[test]
    fn summary_joins_non_empty_fields() {
        let mut draft = draft_with_uniform_scores(5);
        draft.solution = "  ".into();
        assert_eq!(
            summary_text(&draft),
            "Retail | Grocery | Stockouts go unnoticed | Computer vision for shelf gaps"
        );
    }

    #[tokio::test]
    async fn no_stored_embeddings_means_no_duplicate() {
        let store = IdeaStore::in_memory().unwrap();
        let detector = EmbeddingDuplicateDetector::new(Arc::new(FixedEmbedder(vec![1.0, 0.0])), store);
        let report = detector
            .check(&draft_with_uniform_scores(5), None, Attribution::new("test"))
            .await
            .unwrap();
        assert!(report.best().is_none());
        assert_eq!(report.embedding, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn similarity_at_threshold_is_a_match() {
        // cos([1, 0], [3, 4]) = 3 / 5
        let (store, id) = store_with(&[3.0, 4.0]).await;
        let detector = EmbeddingDuplicateDetector::new(Arc::new(FixedEmbedder(vec![1.0, 0.0])), store)
            .with_threshold(0.6);
        let report = detector
            .check(&draft_with_uniform_scores(5), None, Attribution::new("test"))
            .await
            .unwrap();
        assert_eq!(report.best().map(|m| m.idea_id), Some(id));
    }

    #[tokio::test]
    async fn below_threshold_is_not_a_match() {
        let (store, _) = store_with(&[3.0, 4.0]).await;
        let detector = EmbeddingDuplicateDetector::new(Arc::new(FixedEmbedder(vec![1.0, 0.0])), store);
        let report = detector
            .check(&draft_with_uniform_scores(5), None, Attribution::new("test"))
            .await
            .unwrap();
        assert!(report.matches.is_empty());
    }
}
