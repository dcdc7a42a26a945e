//! Semantic search: embed the query, run one ANN request, convert scores.

use std::sync::Arc;

use homily_providers::{AnnQuery, EmbeddingProvider, Metric, ProviderError, RawHit, VectorStore};
use serde::Serialize;
use tracing::debug;

/// One ANN hit with a similarity in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticHit {
    /// Block id used for hydration.
    pub id: String,
    /// Primary key of the vector entity.
    pub external_id: String,
    pub distance: Option<f64>,
    pub score: Option<f64>,
    pub similarity: f64,
}

/// Convert a provider distance or score into a similarity for `metric`.
///
/// - cosine: `1 - distance` when a distance is given, else the score as is
/// - inner product: the score as is, else `1 - distance`
/// - L2: `1 / (1 + distance)`
/// - anything else: `1 - distance`, else the score
///
/// The result is clamped to `[0, 1]`; a hit with neither value scores 0.
pub fn similarity(metric: &Metric, distance: Option<f64>, score: Option<f64>) -> f64 {
    let from_distance = |d: f64| 1.0 - d;
    let value = match metric {
        Metric::Cosine => distance.map(from_distance).or(score),
        Metric::InnerProduct => score.or(distance.map(from_distance)),
        Metric::L2 => distance
            .map(|d| 1.0 / (1.0 + d.max(0.0)))
            .or(score.map(|s| 1.0 / (1.0 + s.max(0.0)))),
        Metric::Unknown(_) => distance.map(from_distance).or(score),
    };
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn to_semantic(metric: &Metric, raw: RawHit) -> SemanticHit {
    SemanticHit {
        similarity: similarity(metric, raw.distance, raw.score),
        id: raw.target().to_string(),
        external_id: raw.id,
        distance: raw.distance,
        score: raw.score,
    }
}

/// Embedding provider plus ANN store.
pub struct VectorSearchEngine {
    embeddings: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl VectorSearchEngine {
    pub fn new(embeddings: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self { embeddings, store }
    }

    /// Embed query text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let vector = self.embeddings.embed(text).await?;
        if vector.is_empty() {
            return Err(ProviderError::Embedding("empty vector".to_string()));
        }
        Ok(vector)
    }

    /// One ANN request. Hits keep provider order.
    pub async fn search(&self, vector: Vec<f32>, limit: usize) -> Result<Vec<SemanticHit>, ProviderError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self.store.search(&AnnQuery { vector, limit }).await?;
        let metric = self.store.metric();
        let hits: Vec<SemanticHit> = raw.into_iter().map(|h| to_semantic(metric, h)).collect();
        debug!(hits = hits.len(), metric = %metric, "Semantic search complete");
        Ok(hits)
    }

    /// Embed `text` and search with it.
    pub async fn search_text(&self, text: &str, limit: usize) -> Result<Vec<SemanticHit>, ProviderError> {
        let vector = self.embed(text).await?;
        self.search(vector, limit).await
    }

    pub fn model_name(&self) -> &str {
        self.embeddings.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_cosine_prefers_distance() {
        assert!((similarity(&Metric::Cosine, Some(0.25), Some(0.1)) - 0.75).abs() < EPS);
        assert!((similarity(&Metric::Cosine, None, Some(0.6)) - 0.6).abs() < EPS);
        assert_eq!(similarity(&Metric::Cosine, Some(1.7), None), 0.0);
    }

    #[test]
    fn test_inner_product_prefers_score() {
        assert!((similarity(&Metric::InnerProduct, Some(0.25), Some(0.8)) - 0.8).abs() < EPS);
        assert!((similarity(&Metric::InnerProduct, Some(0.25), None) - 0.75).abs() < EPS);
        assert_eq!(similarity(&Metric::InnerProduct, None, Some(3.0)), 1.0);
    }

    #[test]
    fn test_l2() {
        assert!((similarity(&Metric::L2, Some(1.0), None) - 0.5).abs() < EPS);
        assert!((similarity(&Metric::L2, Some(0.0), None) - 1.0).abs() < EPS);
        assert!((similarity(&Metric::L2, None, Some(3.0)) - 0.25).abs() < EPS);
    }

    #[test]
    fn test_unknown_metric_and_missing_values() {
        let metric = Metric::Unknown("JACCARD".into());
        assert!((similarity(&metric, Some(0.4), None) - 0.6).abs() < EPS);
        assert_eq!(similarity(&metric, None, None), 0.0);
        assert_eq!(similarity(&Metric::Cosine, Some(f64::NAN), None), 0.0);
    }

    struct FixedEmbeddings(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedEmbeddings {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(self.0.clone())
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    struct FixedStore(Vec<RawHit>, Metric);

    #[async_trait]
    impl VectorStore for FixedStore {
        async fn search(&self, query: &AnnQuery) -> Result<Vec<RawHit>, ProviderError> {
            Ok(self.0.iter().take(query.limit).cloned().collect())
        }
        fn metric(&self) -> &Metric {
            &self.1
        }
    }

    fn raw(id: &str, block: Option<&str>, distance: f64) -> RawHit {
        RawHit {
            id: id.to_string(),
            block_uid: block.map(str::to_string),
            distance: Some(distance),
            score: None,
        }
    }

    #[tokio::test]
    async fn test_search_text_preserves_provider_order() {
        let store = FixedStore(
            vec![raw("1", Some("b1"), 0.5), raw("2", None, 0.1), raw("3", Some("b3"), 0.3)],
            Metric::Cosine,
        );
        let engine = VectorSearchEngine::new(Arc::new(FixedEmbeddings(vec![1.0])), Arc::new(store));
        let hits = engine.search_text("grace", 10).await.unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "2", "b3"]);
        assert_eq!(hits[1].external_id, "2");
        assert!((hits[0].similarity - 0.5).abs() < EPS);
        assert_eq!(engine.model_name(), "fixed");
    }

    #[tokio::test]
    async fn test_empty_embedding_is_an_error() {
        let engine = VectorSearchEngine::new(
            Arc::new(FixedEmbeddings(vec![])),
            Arc::new(FixedStore(vec![], Metric::Cosine)),
        );
        let err = engine.search_text("grace", 5).await.unwrap_err();
        assert!(matches!(err, ProviderError::Embedding(_)));
    }
}
