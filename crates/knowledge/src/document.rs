//! Document model shared by the stores, the search engine and the context assembler.

use std::{collections::BTreeSet, fmt, str::FromStr};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

use crate::error::{KnowledgeError, Result};

/// Kind of document. Controls which collection it lives in and how the
/// context assembler prioritizes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Knowledge,
    Runbook,
    Troubleshoot,
    Conversation,
}

impl DocType {
    pub const ALL: [DocType; 4] = [
        DocType::Knowledge,
        DocType::Runbook,
        DocType::Troubleshoot,
        DocType::Conversation,
    ];

    pub const KNOWLEDGE_CLASS: [DocType; 3] =
        [DocType::Knowledge, DocType::Runbook, DocType::Troubleshoot];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Knowledge => "knowledge",
            Self::Runbook => "runbook",
            Self::Troubleshoot => "troubleshoot",
            Self::Conversation => "conversation",
        }
    }

    pub fn is_knowledge(self) -> bool {
        !matches!(self, Self::Conversation)
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "knowledge" => Ok(Self::Knowledge),
            "runbook" => Ok(Self::Runbook),
            "troubleshoot" => Ok(Self::Troubleshoot),
            "conversation" => Ok(Self::Conversation),
            other => Err(KnowledgeError::invalid(format!("unknown doc_type '{other}'"))),
        }
    }
}

/// Logical collection a document is persisted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Upsert-by-id, never evicted.
    KnowledgeBase,
    /// Insert-only, subject to size-bounded retention.
    Conversations,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::KnowledgeBase, Collection::Conversations];

    pub fn of(doc_type: DocType) -> Self {
        if doc_type.is_knowledge() {
            Self::KnowledgeBase
        } else {
            Self::Conversations
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Self::KnowledgeBase => "knowledge_base",
            Self::Conversations => "conversations",
        }
    }

    pub fn is_insert_only(self) -> bool {
        matches!(self, Self::Conversations)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Conjunctive filter over `doc_type` and `category`. An empty set leaves
/// that dimension unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocFilter {
    pub doc_types: BTreeSet<DocType>,
    pub categories: BTreeSet<String>,
}

impl DocFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn doc_types(types: impl IntoIterator<Item = DocType>) -> Self {
        Self {
            doc_types: types.into_iter().collect(),
            categories: BTreeSet::new(),
        }
    }

    pub fn knowledge() -> Self {
        Self::doc_types(DocType::KNOWLEDGE_CLASS)
    }

    pub fn conversations() -> Self {
        Self::doc_types([DocType::Conversation])
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = String>) -> Self {
        self.categories = categories
            .into_iter()
            .map(|c| c.trim().to_lowercase())
            .collect();
        self
    }

    /// Collections this filter can match documents in.
    pub fn collections(&self) -> Vec<Collection> {
        Collection::ALL
            .into_iter()
            .filter(|c| {
                self.doc_types.is_empty() || self.doc_types.iter().any(|t| Collection::of(*t) == *c)
            })
            .collect()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        (self.doc_types.is_empty() || self.doc_types.contains(&doc.doc_type))
            && (self.categories.is_empty() || self.categories.contains(&doc.category))
    }

    /// Rejects filters that can never be satisfied because of malformed input.
    pub fn validate(&self) -> Result<()> {
        if self.categories.iter().any(|c| c.is_empty()) {
            return Err(KnowledgeError::invalid("category filter contains an empty name"));
        }
        Ok(())
    }
}

/// The unit of knowledge or memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: String,
    pub title: String,
    pub content: String,
    pub doc_type: DocType,
    pub category: String,
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a document with a freshly derived id and `created_at = updated_at = now`.
    pub fn new(
        doc_type: DocType,
        title: impl Into<String>,
        content: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let content = content.into();
        let now = Utc::now();
        let id = generate_id(doc_type, &title, &content, now, "");
        Self::restore(
            id,
            title,
            content,
            doc_type,
            category.into(),
            now,
            now,
        )
    }

    /// Create a document with a caller-chosen id (seed catalog, upserts).
    pub fn with_id(
        id: impl Into<String>,
        doc_type: DocType,
        title: impl Into<String>,
        content: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self::restore(
            id.into(),
            title.into(),
            content.into(),
            doc_type,
            category.into(),
            now,
            now,
        )
    }

    /// Rebuild a document from persisted fields. Used by the store backends.
    pub(crate) fn restore(
        id: String,
        title: String,
        content: String,
        doc_type: DocType,
        category: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let category = normalize_category(&category);
        Self {
            id,
            title,
            content,
            doc_type,
            category,
            tags: BTreeSet::new(),
            embedding: None,
            metadata: serde_json::Map::new(),
            confidence: 0.5,
            source_url: None,
            created_at,
            updated_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn collection(&self) -> Collection {
        Collection::of(self.doc_type)
    }

    /// Replace the id with one derived from a fresh nonce. Used once when an
    /// insert-only collection reports a collision.
    pub(crate) fn regenerate_id(&mut self) {
        let nonce = uuid::Uuid::new_v4().to_string();
        self.id = generate_id(
            self.doc_type,
            &self.title,
            &self.content,
            self.created_at,
            &nonce,
        );
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn with_source_url(mut self, url: Option<String>) -> Self {
        self.source_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach a vector. `expected_dims == 0` accepts any non-empty length.
    pub fn with_embedding(mut self, embedding: Vec<f32>, expected_dims: usize) -> Result<Self> {
        self.set_embedding(embedding, expected_dims)?;
        Ok(self)
    }

    pub fn set_embedding(&mut self, embedding: Vec<f32>, expected_dims: usize) -> Result<()> {
        check_dimensions(&embedding, expected_dims)?;
        self.embedding = Some(embedding);
        self.touch();
        Ok(())
    }

    pub fn set_confidence(&mut self, confidence: f32) {
        self.confidence = clamp_confidence(confidence);
        self.touch();
    }

    pub fn set_content(&mut self, title: impl Into<String>, content: impl Into<String>) {
        self.title = title.into();
        self.content = content.into();
        self.embedding = None;
        self.touch();
    }

    /// Bump `updated_at`, keeping it strictly after the previous value.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }

    /// Text indexed by full-text search.
    pub fn searchable_text(&self) -> String {
        format!("{}\n{}", self.title, self.content)
    }
}

/// Reject empty vectors, non-finite components and length mismatches.
pub fn check_dimensions(embedding: &[f32], expected_dims: usize) -> Result<()> {
    if embedding.is_empty() {
        return Err(KnowledgeError::DimensionMismatch {
            expected: expected_dims,
            actual: 0,
        });
    }
    if expected_dims != 0 && embedding.len() != expected_dims {
        return Err(KnowledgeError::DimensionMismatch {
            expected: expected_dims,
            actual: embedding.len(),
        });
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(KnowledgeError::invalid("embedding contains non-finite values"));
    }
    Ok(())
}

pub fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

fn normalize_category(category: &str) -> String {
    let category = category.trim().to_lowercase();
    if category.is_empty() {
        crate::taxonomy::GENERAL.to_string()
    } else {
        category
    }
}

/// SHA-256 over the identifying fields, truncated to 128 bits of hex.
fn generate_id(
    doc_type: DocType,
    title: &str,
    content: &str,
    at: DateTime<Utc>,
    nonce: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_type.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(title.as_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    hasher.update(b"\0");
    hasher.update(at.timestamp_micros().to_le_bytes());
    hasher.update(nonce.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// Ranked search result. Produced fresh per query, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document: Document,
    pub score: f32,
}

impl SearchHit {
    pub fn doc_type(&self) -> DocType {
        self.document.doc_type
    }

    pub fn category(&self) -> &str {
        &self.document.category
    }
}
