/// Knowledge manager: the caller-facing engine over store, embeddings, search and lifecycle.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tokio::{task::JoinHandle, time::MissedTickBehavior},
    tracing::{debug, info, warn},
};

use crate::{
    config::{EmbeddingBackend, EmbeddingsConfig, KnowledgeConfig},
    context::{self, ContextBundle},
    document::{DocFilter, DocType, Document, SearchHit},
    embeddings::{EmbeddingClient, EmbeddingProvider},
    embeddings_ollama::OllamaEmbeddingProvider,
    embeddings_openai::OpenAiEmbeddingProvider,
    error::{KnowledgeError, Result},
    lifecycle::{ConsolidationReport, IngestMeta, MemoryLifecycle},
    search::{self, SearchOptions, SearchQuery},
    seed,
    store::{DocumentStore, bounded},
    store_sqlite::SqliteDocumentStore,
    taxonomy::{extract_topics, resolve_category},
};

const SNIPPET_CHARS: usize = 200;
const HELPFUL_DELTA: f32 = 0.05;
const UNHELPFUL_DELTA: f32 = -0.10;

pub struct KnowledgeManager {
    config: KnowledgeConfig,
    store: Arc<dyn DocumentStore>,
    embedder: Arc<EmbeddingClient>,
    lifecycle: MemoryLifecycle,
}

/// A search result as handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct DocSummary {
    pub id: String,
    pub title: String,
    pub doc_type: DocType,
    pub category: String,
    pub snippet: String,
    pub tags: Vec<String>,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub score: f32,
}

impl From<SearchHit> for DocSummary {
    fn from(hit: SearchHit) -> Self {
        let doc = hit.document;
        let mut snippet: String = doc.content.chars().take(SNIPPET_CHARS).collect();
        if doc.content.chars().count() > SNIPPET_CHARS {
            snippet.push('…');
        }
        Self {
            id: doc.id().to_string(),
            confidence: doc.confidence(),
            title: doc.title,
            doc_type: doc.doc_type,
            category: doc.category,
            snippet,
            tags: doc.tags.into_iter().collect(),
            source_url: doc.source_url,
            updated_at: doc.updated_at,
            score: hit.score,
        }
    }
}

/// An authored knowledge document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeInput {
    /// Upserts in place when set; a fresh id is derived otherwise.
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub content: String,
    /// Resolved from the text when absent.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_doc_type")]
    pub doc_type: DocType,
    /// Extracted topics are used when empty.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

fn default_doc_type() -> DocType {
    DocType::Knowledge
}

impl KnowledgeInput {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            content: content.into(),
            category: None,
            doc_type: DocType::Knowledge,
            tags: Vec::new(),
            source_url: None,
            confidence: None,
        }
    }

    fn into_document(self) -> Result<Document> {
        if !self.doc_type.is_knowledge() {
            return Err(KnowledgeError::invalid(format!(
                "doc_type '{}' cannot be authored as knowledge",
                self.doc_type
            )));
        }
        if self.title.trim().is_empty() || self.content.trim().is_empty() {
            return Err(KnowledgeError::invalid("title and content must not be empty"));
        }

        let text = format!("{}\n{}", self.title, self.content);
        let category = self
            .category
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| resolve_category(&text).to_string());
        let tags = if self.tags.is_empty() {
            extract_topics(&text).into_iter().map(str::to_string).collect()
        } else {
            self.tags
        };

        let doc = match self.id {
            Some(id) if !id.trim().is_empty() => {
                Document::with_id(id, self.doc_type, self.title, self.content, category)
            },
            _ => Document::new(self.doc_type, self.title, self.content, category),
        };
        Ok(doc
            .with_tags(tags)
            .with_confidence(self.confidence.unwrap_or(0.8))
            .with_source_url(self.source_url))
    }
}

/// Engine health and inventory.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeStatus {
    /// Whether the document backend answered.
    pub available: bool,
    pub document_counts: BTreeMap<String, usize>,
    pub categories: Vec<String>,
    pub embedding_available: bool,
    pub embedding_model: String,
}

/// Outcome of one maintenance tick.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub embedding_available: bool,
    pub backfilled: usize,
    pub consolidation: Option<ConsolidationReport>,
    pub evicted: usize,
}

/// Build the embedding client described by `config`.
pub fn embedding_client(config: &EmbeddingsConfig) -> EmbeddingClient {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingBackend::None => return EmbeddingClient::disabled(),
        EmbeddingBackend::OpenAi => Arc::new(
            OpenAiEmbeddingProvider::new(config.api_key.clone())
                .with_model(config.model.clone(), config.dimensions)
                .with_base_url(config.base_url.clone())
                .with_timeout(config.timeout()),
        ),
        EmbeddingBackend::Ollama => Arc::new(
            OllamaEmbeddingProvider::new(config.base_url.clone(), config.model.clone())
                .with_dimensions(config.dimensions)
                .with_timeouts(config.timeout(), config.probe_timeout()),
        ),
    };
    EmbeddingClient::new(provider).with_timeouts(config.timeout(), config.probe_timeout())
}

impl KnowledgeManager {
    pub fn new(
        config: KnowledgeConfig,
        store: Arc<dyn DocumentStore>,
        embedder: EmbeddingClient,
    ) -> Self {
        let embedder = Arc::new(embedder);
        let lifecycle = MemoryLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            config.memory.clone(),
            config.store.timeout(),
        );
        Self {
            config,
            store,
            embedder,
            lifecycle,
        }
    }

    /// Open the SQLite store and the configured provider, probe the provider,
    /// and seed an empty knowledge base when `seed_on_start` is set.
    pub async fn from_config(config: KnowledgeConfig) -> Result<Self> {
        config.validate()?;
        let store =
            SqliteDocumentStore::connect(&config.store.db_path, config.store.max_connections)
                .await?;
        let embedder = embedding_client(&config.embeddings);
        let manager = Self::new(config, Arc::new(store), embedder);

        let available = manager.probe_embeddings().await;
        info!(
            db_path = %manager.config.store.db_path,
            embedding_model = manager.embedder.model_name(),
            embedding_available = available,
            "knowledge engine ready"
        );
        if manager.config.memory.seed_on_start {
            manager.seed_knowledge().await;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.config
    }

    fn backend_timeout(&self) -> Duration {
        self.config.store.timeout()
    }

    fn search_options(&self) -> SearchOptions {
        SearchOptions {
            backend_timeout: self.backend_timeout(),
            fallback_score_scale: self.config.retrieval.fallback_score_scale,
        }
    }

    /// A query carrying the configured default limit and similarity floor.
    pub fn query(&self, text: impl Into<String>) -> SearchQuery {
        SearchQuery::new(text)
            .limit(self.config.retrieval.default_limit)
            .min_similarity(self.config.retrieval.min_similarity)
    }

    /// Ranked search. Only a malformed query is an error.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<DocSummary>> {
        let hits = search::search(
            self.store.as_ref(),
            &self.embedder,
            query,
            self.search_options(),
        )
        .await?;
        Ok(hits.into_iter().map(DocSummary::from).collect())
    }

    /// Retrieve and pack context for `query` under `max_chars`.
    pub async fn get_context(
        &self,
        query: &str,
        max_chars: usize,
        include_conversations: bool,
        include_knowledge: bool,
    ) -> ContextBundle {
        let doc_types = context::doc_types_for(include_conversations, include_knowledge);
        if doc_types.is_empty() {
            return ContextBundle::default();
        }
        let request = SearchQuery::new(query)
            .doc_types(doc_types)
            .limit(self.config.retrieval.context_fetch_limit)
            .min_similarity(self.config.retrieval.context_min_similarity);

        let hits = match search::search(
            self.store.as_ref(),
            &self.embedder,
            &request,
            self.search_options(),
        )
        .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "context search rejected");
                return ContextBundle::default();
            },
        };

        let bundle = context::assemble(&hits, max_chars, include_conversations);
        debug!(
            query,
            max_chars,
            chars_used = bundle.chars_used,
            docs_used = bundle.docs_used,
            total_found = bundle.total_found,
            "assembled context"
        );
        bundle
    }

    /// Store a conversation turn. `None` when the backend rejected it.
    pub async fn ingest_conversation(
        &self,
        user_text: &str,
        response_text: &str,
        meta: &IngestMeta,
    ) -> Option<String> {
        self.lifecycle
            .ingest(user_text, response_text, meta)
            .await
    }

    /// Author or replace a knowledge document. Returns `Ok(None)` when the
    /// backend rejected the write; malformed input is an error.
    pub async fn add_knowledge(&self, input: KnowledgeInput) -> Result<Option<String>> {
        let mut doc = input.into_document()?;
        self.lifecycle.attach_embedding(&mut doc).await;

        match bounded(self.backend_timeout(), "put", self.store.put(&doc)).await {
            Ok(()) => {
                info!(
                    id = doc.id(),
                    doc_type = %doc.doc_type,
                    category = %doc.category,
                    embedded = doc.embedding.is_some(),
                    "stored knowledge"
                );
                Ok(Some(doc.id().to_string()))
            },
            Err(e) => {
                warn!(id = doc.id(), error = %e, "failed to store knowledge");
                Ok(None)
            },
        }
    }

    pub async fn status(&self) -> KnowledgeStatus {
        let mut status = KnowledgeStatus {
            available: false,
            document_counts: BTreeMap::new(),
            categories: Vec::new(),
            embedding_available: self.embedder.available(),
            embedding_model: self.embedder.model_name().to_string(),
        };
        match self.inventory().await {
            Ok((counts, categories)) => {
                status.available = true;
                status.document_counts = counts;
                status.categories = categories;
            },
            Err(e) => warn!(error = %e, "document backend unavailable"),
        }
        status
    }

    async fn inventory(&self) -> Result<(BTreeMap<String, usize>, Vec<String>)> {
        let timeout = self.backend_timeout();
        bounded(timeout, "ping", self.store.ping()).await?;
        let mut counts = BTreeMap::new();
        for doc_type in DocType::ALL {
            let n = bounded(
                timeout,
                "count",
                self.store.count(&DocFilter::doc_types([doc_type])),
            )
            .await?;
            counts.insert(doc_type.to_string(), n);
        }
        let categories =
            bounded(timeout, "distinct_categories", self.store.distinct_categories()).await?;
        Ok((counts, categories))
    }

    /// Write the starter catalog into an empty knowledge base.
    pub async fn seed_knowledge(&self) -> usize {
        self.lifecycle.seed_knowledge(seed::catalog()).await
    }

    pub async fn enforce_retention(&self) -> usize {
        self.lifecycle.enforce_retention().await
    }

    pub async fn consolidate(&self) -> Option<ConsolidationReport> {
        self.lifecycle.consolidate().await
    }

    /// Refresh provider availability.
    pub async fn probe_embeddings(&self) -> bool {
        self.embedder.probe().await
    }

    pub async fn backfill_embeddings(&self) -> usize {
        self.lifecycle.backfill_embeddings().await
    }

    /// Nudge a knowledge document's confidence after a user rated it.
    /// Returns the new confidence, or `None` when there is nothing to update.
    pub async fn record_feedback(&self, id: &str, helpful: bool) -> Option<f32> {
        let timeout = self.backend_timeout();
        let mut doc = match bounded(timeout, "get", self.store.get(id)).await {
            Ok(Some(doc)) if doc.doc_type.is_knowledge() => doc,
            Ok(Some(_)) => {
                debug!(id, "feedback ignored for conversation document");
                return None;
            },
            Ok(None) => {
                debug!(id, "feedback for unknown document");
                return None;
            },
            Err(e) => {
                warn!(id, error = %e, "failed to load document for feedback");
                return None;
            },
        };

        let delta = if helpful {
            HELPFUL_DELTA
        } else {
            UNHELPFUL_DELTA
        };
        doc.set_confidence(doc.confidence() + delta);
        match bounded(timeout, "put", self.store.put(&doc)).await {
            Ok(()) => {
                info!(id, helpful, confidence = doc.confidence(), "recorded feedback");
                Some(doc.confidence())
            },
            Err(e) => {
                warn!(id, error = %e, "failed to store feedback");
                None
            },
        }
    }

    /// One maintenance pass: probe, backfill, consolidate, retention.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let embedding_available = self.probe_embeddings().await;
        let backfilled = if embedding_available {
            self.backfill_embeddings().await
        } else {
            0
        };
        let consolidation = self.consolidate().await;
        let evicted = self.enforce_retention().await;
        MaintenanceReport {
            embedding_available,
            backfilled,
            consolidation,
            evicted,
        }
    }

    /// Run [`Self::run_maintenance`] every `maintenance_interval_secs`.
    /// The first pass runs immediately. Abort the handle to stop.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.memory.maintenance_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let report = manager.run_maintenance().await;
                debug!(?report, "maintenance pass complete");
            }
        })
    }
}
