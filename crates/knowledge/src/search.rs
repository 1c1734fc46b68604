//! Vector similarity search with a deterministic full-text fallback.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    document::{DocFilter, DocType, Document, SearchHit},
    embeddings::EmbeddingClient,
    error::{KnowledgeError, Result},
    store::{DocumentStore, bounded},
};

/// One search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub filter: DocFilter,
    pub limit: usize,
    pub min_similarity: f32,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filter: DocFilter::all(),
            limit: 5,
            min_similarity: 0.0,
        }
    }

    pub fn doc_types(mut self, types: impl IntoIterator<Item = DocType>) -> Self {
        self.filter.doc_types = types.into_iter().collect();
        self
    }

    pub fn categories(mut self, categories: impl IntoIterator<Item = String>) -> Self {
        self.filter = self.filter.with_categories(categories);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    /// Contract checks. These are caller bugs, not transient failures.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(KnowledgeError::invalid("limit must be at least 1"));
        }
        if !self.min_similarity.is_finite() || !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err(KnowledgeError::invalid(format!(
                "min_similarity {} is outside [-1, 1]",
                self.min_similarity
            )));
        }
        self.filter.validate()
    }
}

/// Knobs the engine passes down from configuration.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub backend_timeout: Duration,
    pub fallback_score_scale: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(30),
            fallback_score_scale: 10.0,
        }
    }
}

/// `dot(a, b) / (|a| * |b|)`, or `0.0` when either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(KnowledgeError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32)
}

/// Descending score, then most recently updated, then id.
pub fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.document.updated_at.cmp(&a.document.updated_at))
            .then_with(|| a.document.id().cmp(b.document.id()))
    });
}

/// Score candidates against a query vector. Documents without a vector or
/// with a vector of a different length are skipped.
pub fn score_candidates(
    query_vector: &[f32],
    candidates: Vec<Document>,
    min_similarity: f32,
) -> Vec<SearchHit> {
    let mut skipped = 0usize;
    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .filter_map(|document| {
            let embedding = document.embedding.as_deref()?;
            match cosine_similarity(query_vector, embedding) {
                Ok(score) if score.is_finite() && score >= min_similarity => {
                    Some(SearchHit { document, score })
                },
                Ok(_) => None,
                Err(_) => {
                    skipped += 1;
                    None
                },
            }
        })
        .collect();
    if skipped > 0 {
        debug!(skipped, "skipped documents with mismatched embedding dimensions");
    }
    rank(&mut hits);
    hits
}

/// Search `store` for documents relevant to `query`.
///
/// Uses cosine similarity when the embedding client yields a query vector,
/// otherwise full-text search with scores mapped monotonically into `[0, 1)`.
/// Backend failures give an empty result; only an invalid query is an error.
pub async fn search(
    store: &dyn DocumentStore,
    embedder: &EmbeddingClient,
    query: &SearchQuery,
    options: SearchOptions,
) -> Result<Vec<SearchHit>> {
    query.validate()?;

    let hits = match embedder.embed(&query.text).await {
        Some(vector) => vector_search(store, &vector, query, options).await,
        None => {
            debug!(query = %query.text, "no query vector, using full-text fallback");
            fallback_search(store, query, options).await
        },
    };

    match hits {
        Ok(hits) => {
            debug!(query = %query.text, results = hits.len(), "search complete");
            Ok(hits)
        },
        Err(e) => {
            warn!(query = %query.text, error = %e, "search failed, returning no results");
            Ok(Vec::new())
        },
    }
}

async fn vector_search(
    store: &dyn DocumentStore,
    vector: &[f32],
    query: &SearchQuery,
    options: SearchOptions,
) -> Result<Vec<SearchHit>> {
    let candidates = bounded(options.backend_timeout, "scan", store.scan(&query.filter)).await?;
    let mut hits = score_candidates(vector, candidates, query.min_similarity);
    hits.truncate(query.limit);
    Ok(hits)
}

/// Map a backend relevance score into [0, 1). Strictly increasing for positive
/// scores, so the backend's order survives re-ranking.
fn fallback_score(score: f32, scale: f32) -> f32 {
    if score.is_finite() && score > 0.0 {
        score / (score + scale)
    } else {
        0.0
    }
}

async fn fallback_search(
    store: &dyn DocumentStore,
    query: &SearchQuery,
    options: SearchOptions,
) -> Result<Vec<SearchHit>> {
    let raw = bounded(
        options.backend_timeout,
        "full_text_search",
        store.full_text_search(&query.text, &query.filter, query.limit),
    )
    .await?;
    let scale = options.fallback_score_scale;
    let mut hits: Vec<SearchHit> = raw
        .into_iter()
        .map(|(document, score)| SearchHit {
            document,
            score: fallback_score(score, scale),
        })
        .collect();
    rank(&mut hits);
    hits.truncate(query.limit);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::{store_memory::MemoryDocumentStore, testing::*},
        chrono::Duration as ChronoDuration,
        std::sync::Arc,
    };

    fn embedded(title: &str, content: &str, category: &str) -> Document {
        Document::new(DocType::Knowledge, title, content, category)
            .with_embedding(keyword_embedding(&format!("{title} {content}")), 0)
            .unwrap()
    }

    #[test]
    fn cosine_bounds_and_zero_vectors() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).unwrap() + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[3.0, 4.0]).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]).unwrap(), 0.0);

        let pairs = [
            (vec![0.3, -2.0, 7.5], vec![1e-3, 4.0, -0.25]),
            (vec![1e6, 1e-6, 3.0], vec![1e6, 2e-6, 3.0]),
            (vec![-5.0, -5.0, -5.0], vec![2.0, 2.0, 2.0]),
        ];
        for (a, b) in pairs {
            let s = cosine_similarity(&a, &b).unwrap();
            assert!((-1.0..=1.0).contains(&s), "{s} out of range");
        }
    }

    #[test]
    fn cosine_rejects_mismatched_lengths() {
        assert!(matches!(
            cosine_similarity(&[1.0, 2.0], &[1.0]),
            Err(KnowledgeError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn equal_scores_rank_newer_first() {
        let mut older = embedded("a", "pod", "kubernetes");
        let mut newer = embedded("b", "pod", "kubernetes");
        older.updated_at = newer.updated_at - ChronoDuration::seconds(5);
        newer.updated_at = older.updated_at + ChronoDuration::seconds(10);

        let hits = score_candidates(&keyword_embedding("pod"), vec![older, newer], 0.0);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].score, hits[1].score);
        assert_eq!(hits[0].document.title, "b");
    }

    #[test]
    fn candidates_without_or_with_wrong_vectors_are_skipped() {
        let plain = Document::new(DocType::Knowledge, "no vector", "pod", "general");
        let wrong = Document::new(DocType::Knowledge, "short", "pod", "general")
            .with_embedding(vec![1.0, 0.0], 0)
            .unwrap();
        let good = embedded("good", "pod", "kubernetes");
        let hits = score_candidates(&keyword_embedding("pod"), vec![plain, wrong, good], -1.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.title, "good");
    }

    async fn seeded_store() -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new();
        for doc in [
            embedded("Pod crash", "kubernetes pod crash loop", "kubernetes"),
            embedded("Pod pending", "kubernetes pod pending", "kubernetes"),
            embedded("Prometheus alert", "prometheus alert rules", "monitoring"),
            embedded("Loki", "loki log queries", "logging"),
            embedded("Git revert", "git revert", "git"),
        ] {
            store.put(&doc).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn vector_search_ranks_and_respects_floor() {
        let store = seeded_store().await;
        let client = EmbeddingClient::new(Arc::new(KeywordEmbedder));
        let query = SearchQuery::new("kubernetes pod crash")
            .limit(10)
            .min_similarity(0.5);
        let hits = search(&store, &client, &query, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits[0].document.title, "Pod crash");
        assert!(hits.iter().all(|h| h.score >= 0.5));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|h| h.category() == "kubernetes"));
    }

    #[tokio::test]
    async fn vector_search_applies_filter_and_limit() {
        let store = seeded_store().await;
        let client = EmbeddingClient::new(Arc::new(KeywordEmbedder));
        let query = SearchQuery::new("alert on pod crash")
            .categories(["monitoring".to_string()])
            .limit(1);
        let hits = search(&store, &client, &query, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.title, "Prometheus alert");
    }

    #[tokio::test]
    async fn unavailable_provider_falls_back_to_full_text() {
        let store = MemoryDocumentStore::new();
        for i in 0..3 {
            store
                .put(&Document::new(
                    DocType::Knowledge,
                    format!("Pod guide {i}"),
                    "When a pod fails, describe the pod.".repeat(i + 1),
                    "kubernetes",
                ))
                .await
                .unwrap();
        }
        store
            .put(&Document::new(DocType::Knowledge, "Git", "rebase", "git"))
            .await
            .unwrap();

        let provider = Arc::new(FlakyEmbedder::default());
        provider.set_failing(true);
        let client = EmbeddingClient::new(provider);
        client.probe().await;

        let query = SearchQuery::new("pod troubleshooting").limit(5);
        let hits = search(&store, &client, &query, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].document.title, "Pod guide 2");
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn fallback_scores_keep_backend_order() {
        let scores = [0.5, 9.0, 10.0, 11.0, 30.0, 1e4];
        let mapped: Vec<f32> = scores.iter().map(|&s| fallback_score(s, 10.0)).collect();
        assert!(mapped.windows(2).all(|w| w[0] < w[1]), "{mapped:?}");
        assert!(mapped.iter().all(|s| (0.0..1.0).contains(s)));
        assert_eq!(fallback_score(0.0, 10.0), 0.0);
        assert_eq!(fallback_score(-3.0, 10.0), 0.0);
        assert_eq!(fallback_score(f32::NAN, 10.0), 0.0);
    }

    #[tokio::test]
    async fn strong_full_text_match_outranks_newer_weak_match() {
        let store = MemoryDocumentStore::new();
        let mut strong = Document::new(DocType::Knowledge, "strong", "pod ".repeat(30), "kubernetes");
        let mut weak = Document::new(DocType::Knowledge, "weak", "pod ".repeat(11), "kubernetes");
        strong.updated_at = weak.updated_at - ChronoDuration::hours(1);
        weak.updated_at = strong.updated_at + ChronoDuration::hours(2);
        store.put(&strong).await.unwrap();
        store.put(&weak).await.unwrap();

        let hits = search(
            &store,
            &EmbeddingClient::disabled(),
            &SearchQuery::new("pod"),
            SearchOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.title, "strong");
        assert!(hits[0].score > hits[1].score);
        assert!(hits[0].score < 1.0);
    }

    #[tokio::test]
    async fn failed_embed_call_also_falls_back() {
        let store = MemoryDocumentStore::new();
        store
            .put(&Document::new(DocType::Knowledge, "Disk", "disk full", "infrastructure"))
            .await
            .unwrap();
        let provider = Arc::new(FlakyEmbedder::default());
        provider.set_failing(true);
        let client = EmbeddingClient::new(provider);
        let hits = search(&store, &client, &SearchQuery::new("disk"), SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn backend_failure_yields_empty_result() {
        let store = seeded_store().await;
        store.set_offline(true);
        let client = EmbeddingClient::new(Arc::new(KeywordEmbedder));
        let hits = search(&store, &client, &SearchQuery::new("pod"), SearchOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = search(
            &store,
            &EmbeddingClient::disabled(),
            &SearchQuery::new("pod"),
            SearchOptions::default(),
        )
        .await
        .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn invalid_queries_are_rejected() {
        let store = MemoryDocumentStore::new();
        let client = EmbeddingClient::disabled();
        for query in [
            SearchQuery::new("x").limit(0),
            SearchQuery::new("x").min_similarity(f32::NAN),
            SearchQuery::new("x").min_similarity(1.5),
            SearchQuery::new("x").categories([" ".to_string()]),
        ] {
            assert!(matches!(
                search(&store, &client, &query, SearchOptions::default()).await,
                Err(KnowledgeError::InvalidRequest(_))
            ));
        }
    }
}
