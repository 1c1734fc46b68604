//! Document backend contract.

use std::{future::Future, time::Duration};

use async_trait::async_trait;

use crate::{
    document::{Collection, DocFilter, Document},
    error::{KnowledgeError, Result},
};

/// Durable storage for documents.
///
/// Two logical collections live behind one store: `knowledge_base`
/// (upsert-by-id) and `conversations` (insert-only). The collection a document
/// goes to is decided by its `doc_type`. Single-document writes must be atomic;
/// there is no cross-document transaction requirement.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert into `conversations` (fails with `DuplicateId` on collision) or
    /// upsert into `knowledge_base` (same id replaces, `created_at` is kept).
    async fn put(&self, doc: &Document) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// All documents matching the filter, across the collections it touches.
    async fn scan(&self, filter: &DocFilter) -> Result<Vec<Document>>;

    /// Keyword relevance search over `title` + `content`, best first. Scores
    /// are higher-is-better and comparable within one call only.
    ///
    /// When the filter spans both collections, each collection is scored
    /// against its own index statistics and the results are merged by raw
    /// score. Cross-collection order is therefore approximate; context
    /// packing splits the classes again, so it only affects `limit` cutoffs.
    async fn full_text_search(
        &self,
        query: &str,
        filter: &DocFilter,
        limit: usize,
    ) -> Result<Vec<(Document, f32)>>;

    async fn count(&self, filter: &DocFilter) -> Result<usize>;

    /// Sorted, de-duplicated categories across both collections.
    async fn distinct_categories(&self) -> Result<Vec<String>>;

    /// Remove the `n` documents with the smallest `created_at` in `collection`.
    /// Returns how many were removed.
    async fn delete_oldest(&self, collection: Collection, n: usize) -> Result<usize>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;
}

/// Run a backend call under a deadline; an elapsed deadline is a backend failure.
pub async fn bounded<T>(
    timeout: Duration,
    op: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(KnowledgeError::BackendUnavailable(format!(
            "{op} timed out after {}s",
            timeout.as_secs_f32()
        ))),
    }
}

/// Query terms for keyword search: lowercase alphanumeric words.
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    let mut terms = crate::taxonomy::tokenize(query);
    terms.sort();
    terms.dedup();
    terms
}
