//! Conversation memory lifecycle: ingestion, retention, consolidation, seeding.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    config::MemoryConfig,
    document::{Collection, DocFilter, DocType, Document},
    embeddings::EmbeddingClient,
    error::{KnowledgeError, Result},
    store::{DocumentStore, bounded},
    taxonomy::{extract_topics, resolve_category},
};

const TITLE_CHARS: usize = 60;

/// Session context recorded with an ingested turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestMeta {
    pub session_id: Option<String>,
    pub intent: Option<String>,
    /// Overrides the topic-coverage confidence when set.
    pub confidence: Option<f32>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub conversation_count: usize,
    /// A new multiple of `consolidate_every` was crossed since the last run.
    pub triggered: bool,
}

/// Topic-coverage confidence: `0.5 + 0.1` per matched topic, at most `1.0`.
pub fn topic_confidence(topic_count: usize) -> f32 {
    (0.5 + 0.1 * topic_count as f32).min(1.0)
}

fn conversation_title(user_text: &str) -> String {
    let first_line = user_text.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "Conversation".to_string();
    }
    let mut title: String = first_line.chars().take(TITLE_CHARS).collect();
    if first_line.chars().count() > TITLE_CHARS {
        title.push('…');
    }
    format!("Conversation: {title}")
}

pub struct MemoryLifecycle {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<EmbeddingClient>,
    config: MemoryConfig,
    backend_timeout: Duration,
    retention_lock: Mutex<()>,
    consolidated_bucket: AtomicUsize,
}

impl MemoryLifecycle {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<EmbeddingClient>,
        config: MemoryConfig,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            backend_timeout,
            retention_lock: Mutex::new(()),
            consolidated_bucket: AtomicUsize::new(0),
        }
    }

    /// Build the conversation document for one turn. No I/O.
    pub fn conversation_document(
        user_text: &str,
        response_text: &str,
        meta: &IngestMeta,
    ) -> Document {
        let combined = format!("{user_text}\n{response_text}");
        let topics = extract_topics(&combined);
        let category = resolve_category(&combined);
        let confidence = meta
            .confidence
            .unwrap_or_else(|| topic_confidence(topics.len()));

        let mut metadata = serde_json::Map::new();
        for (key, value) in [
            ("session_id", &meta.session_id),
            ("intent", &meta.intent),
            ("source", &meta.source),
        ] {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value.clone().into());
            }
        }

        Document::new(
            DocType::Conversation,
            conversation_title(user_text),
            format!("User: {user_text}\nResponse: {response_text}"),
            category,
        )
        .with_tags(topics.into_iter().map(str::to_string))
        .with_confidence(confidence)
        .with_metadata(metadata)
    }

    /// Store one conversation turn. Returns the new document id, or `None`
    /// when the backend rejected the write (logged).
    ///
    /// A turn ingested while the provider is down is stored without a vector
    /// and stays that way: conversations are insert-only, so
    /// [`Self::backfill_embeddings`] never revisits them. Such turns are only
    /// reachable through full-text fallback search.
    pub async fn ingest(
        &self,
        user_text: &str,
        response_text: &str,
        meta: &IngestMeta,
    ) -> Option<String> {
        let mut doc = Self::conversation_document(user_text, response_text, meta);
        self.attach_embedding(&mut doc).await;

        let id = match self.put_conversation(&mut doc).await {
            Ok(()) => doc.id().to_string(),
            Err(e) => {
                warn!(error = %e, "failed to store conversation");
                return None;
            },
        };
        info!(
            id = %id,
            category = %doc.category,
            embedded = doc.embedding.is_some(),
            session_id = ?meta.session_id,
            "stored conversation"
        );

        if self.config.retention_on_ingest {
            self.enforce_retention().await;
        }
        Some(id)
    }

    /// Insert, regenerating the id once on collision.
    async fn put_conversation(&self, doc: &mut Document) -> Result<()> {
        match bounded(self.backend_timeout, "put", self.store.put(doc)).await {
            Err(KnowledgeError::DuplicateId(id)) => {
                debug!(id = %id, "conversation id collision, retrying with a new id");
                doc.regenerate_id();
                bounded(self.backend_timeout, "put", self.store.put(doc)).await
            },
            other => other,
        }
    }

    /// Best effort: a document without a vector is still written.
    pub(crate) async fn attach_embedding(&self, doc: &mut Document) {
        let Some(vector) = self.embedder.embed(&doc.content).await else {
            return;
        };
        if let Err(e) = doc.set_embedding(vector, self.embedder.dimensions()) {
            warn!(id = doc.id(), error = %e, "rejecting embedding");
        }
    }

    /// Batch variant of [`Self::attach_embedding`].
    async fn attach_embeddings(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if docs.is_empty() {
            return docs;
        }
        let texts: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await;
        let dims = self.embedder.dimensions();
        for (doc, vector) in docs.iter_mut().zip(vectors) {
            if let Some(vector) = vector
                && let Err(e) = doc.set_embedding(vector, dims)
            {
                warn!(id = doc.id(), error = %e, "rejecting embedding");
            }
        }
        docs
    }

    /// Delete the oldest conversations until at most `max_memories` remain.
    /// Runs one pass at a time; returns how many were deleted.
    pub async fn enforce_retention(&self) -> usize {
        let _guard = self.retention_lock.lock().await;
        match self.prune().await {
            Ok(0) => 0,
            Ok(deleted) => {
                info!(
                    deleted,
                    max_memories = self.config.max_memories,
                    "evicted oldest conversations"
                );
                deleted
            },
            Err(e) => {
                warn!(error = %e, "retention pass failed");
                0
            },
        }
    }

    async fn prune(&self) -> Result<usize> {
        let count = bounded(
            self.backend_timeout,
            "count",
            self.store.count(&DocFilter::conversations()),
        )
        .await?;
        if count <= self.config.max_memories {
            return Ok(0);
        }
        bounded(
            self.backend_timeout,
            "delete_oldest",
            self.store
                .delete_oldest(Collection::Conversations, count - self.config.max_memories),
        )
        .await
    }

    /// Consolidation hook. Reports whether the conversation count crossed a
    /// new multiple of `consolidate_every`; nothing is retrained.
    pub async fn consolidate(&self) -> Option<ConsolidationReport> {
        let count = match bounded(
            self.backend_timeout,
            "count",
            self.store.count(&DocFilter::conversations()),
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "consolidation skipped");
                return None;
            },
        };
        let bucket = count / self.config.consolidate_every;
        let previous = self.consolidated_bucket.fetch_max(bucket, Ordering::AcqRel);
        let triggered = bucket > previous;
        if triggered {
            info!(conversation_count = count, "consolidation threshold reached");
        }
        Some(ConsolidationReport {
            conversation_count: count,
            triggered,
        })
    }

    /// Write `docs` only if the knowledge collection is empty. Returns how
    /// many documents were written.
    pub async fn seed_knowledge(&self, docs: Vec<Document>) -> usize {
        let existing = match bounded(
            self.backend_timeout,
            "count",
            self.store.count(&DocFilter::knowledge()),
        )
        .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cannot check knowledge base, not seeding");
                return 0;
            },
        };
        if existing > 0 {
            debug!(existing, "knowledge base already populated, skipping seed");
            return 0;
        }

        let docs: Vec<Document> = docs
            .into_iter()
            .filter(|d| d.doc_type.is_knowledge())
            .collect();
        let mut written = 0;
        for doc in self.attach_embeddings(docs).await {
            match bounded(self.backend_timeout, "put", self.store.put(&doc)).await {
                Ok(()) => written += 1,
                Err(e) => warn!(id = doc.id(), error = %e, "failed to seed document"),
            }
        }
        info!(written, "seeded knowledge base");
        written
    }

    /// Embed knowledge documents that were stored without a vector.
    /// Conversations are never rewritten, see [`Self::ingest`].
    pub async fn backfill_embeddings(&self) -> usize {
        if !self.embedder.available() {
            debug!("embedding provider unavailable, skipping backfill");
            return 0;
        }
        let docs = match bounded(
            self.backend_timeout,
            "scan",
            self.store.scan(&DocFilter::knowledge()),
        )
        .await
        {
            Ok(docs) => docs,
            Err(e) => {
                warn!(error = %e, "backfill skipped");
                return 0;
            },
        };

        let missing: Vec<Document> = docs
            .into_iter()
            .filter(|d| d.embedding.is_none())
            .collect();
        let mut updated = 0;
        for doc in self.attach_embeddings(missing).await {
            if doc.embedding.is_none() {
                continue;
            }
            match bounded(self.backend_timeout, "put", self.store.put(&doc)).await {
                Ok(()) => updated += 1,
                Err(e) => warn!(id = doc.id(), error = %e, "failed to store backfilled embedding"),
            }
        }
        if updated > 0 {
            info!(updated, "backfilled knowledge embeddings");
        }
        updated
    }
}
