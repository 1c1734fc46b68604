//! Test doubles shared by the unit tests.

#![allow(clippy::unwrap_used)]

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;

use crate::embeddings::EmbeddingProvider;

/// Each dimension is one keyword: 1.0 if the text contains it, else 0.0.
/// Lets vector search separate topics deterministically.
pub const KEYWORDS: [&str; 10] = [
    "kubernetes",
    "pod",
    "crash",
    "prometheus",
    "alert",
    "loki",
    "log",
    "git",
    "disk",
    "rbac",
];

pub fn keyword_embedding(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
        .collect()
}

pub struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(keyword_embedding(text))
    }

    fn model_name(&self) -> &str {
        "keyword-mock"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }
}

/// Keyword embedder that can be switched into a failing state.
#[derive(Default)]
pub struct FlakyEmbedder {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("provider down");
        }
        Ok(keyword_embedding(text))
    }

    fn model_name(&self) -> &str {
        "flaky-mock"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }
}

pub struct SlowEmbedder(pub Duration);

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        tokio::time::sleep(self.0).await;
        Ok(keyword_embedding(text))
    }

    fn model_name(&self) -> &str {
        "slow-mock"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }
}

/// Returns the same vector for every input, regardless of declared dims.
pub struct FixedEmbedder {
    pub vector: Vec<f32>,
    pub dims: usize,
}

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.vector.clone())
    }

    fn model_name(&self) -> &str {
        "fixed-mock"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
