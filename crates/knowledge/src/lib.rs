//! Knowledge retrieval: embedded documents in SQLite, vector search with a
//! full-text fallback, budgeted context assembly and conversation memory.

pub mod config;
pub mod context;
pub mod document;
pub mod embeddings;
pub mod embeddings_ollama;
pub mod embeddings_openai;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod schema;
pub mod search;
pub mod seed;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod taxonomy;

#[cfg(test)]
mod testing;

pub use {
    config::KnowledgeConfig,
    context::ContextBundle,
    document::{DocFilter, DocType, Document, SearchHit},
    error::{KnowledgeError, Result},
    lifecycle::IngestMeta,
    manager::{DocSummary, KnowledgeInput, KnowledgeManager, KnowledgeStatus},
    search::SearchQuery,
};
