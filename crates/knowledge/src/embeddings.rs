//! Embedding provider contract and the availability-tracking client the engine uses.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tracing::{debug, info, warn},
};

use crate::{
    document::check_dimensions,
    error::{KnowledgeError, Result},
};

/// Turns text into a numeric vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embed several texts. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Lightweight round-trip used to refresh availability.
    async fn probe(&self) -> anyhow::Result<()> {
        self.embed("ping").await.map(|_| ())
    }

    fn model_name(&self) -> &str;

    /// Vector length produced by the model, `0` when not fixed up front.
    fn dimensions(&self) -> usize;
}

/// Wraps a provider with timeouts and an availability flag.
///
/// The flag changes only through [`EmbeddingClient::probe`]. A failed
/// [`EmbeddingClient::embed`] call yields `None` and leaves the flag alone, so
/// a flaky provider keeps being tried until a probe says otherwise.
pub struct EmbeddingClient {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    available: AtomicBool,
    timeout: Duration,
    probe_timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider: Some(provider),
            available: AtomicBool::new(true),
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }

    /// A client with no provider behind it. Always unavailable.
    pub fn disabled() -> Self {
        Self {
            provider: None,
            available: AtomicBool::new(false),
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(mut self, timeout: Duration, probe_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn available(&self) -> bool {
        self.provider.is_some() && self.available.load(Ordering::Acquire)
    }

    pub fn model_name(&self) -> &str {
        self.provider.as_ref().map_or("none", |p| p.model_name())
    }

    pub fn dimensions(&self) -> usize {
        self.provider.as_ref().map_or(0, |p| p.dimensions())
    }

    /// Round-trip to the provider and record the outcome.
    pub async fn probe(&self) -> bool {
        let Some(provider) = &self.provider else {
            return false;
        };
        let ok = match tokio::time::timeout(self.probe_timeout, provider.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(model = provider.model_name(), error = %e, "embedding probe failed");
                false
            },
            Err(_) => {
                warn!(
                    model = provider.model_name(),
                    timeout_secs = self.probe_timeout.as_secs(),
                    "embedding probe timed out"
                );
                false
            },
        };
        let was = self.available.swap(ok, Ordering::AcqRel);
        if was != ok {
            info!(model = provider.model_name(), available = ok, "embedding availability changed");
        }
        ok
    }

    /// Embed one text, reporting why no vector was produced.
    pub async fn try_embed(&self, text: &str) -> Result<Vec<f32>> {
        let Some(provider) = &self.provider else {
            return Err(KnowledgeError::ProviderUnavailable(
                "no embedding provider configured".into(),
            ));
        };
        if !self.available() {
            return Err(KnowledgeError::ProviderUnavailable(format!(
                "{} marked unavailable",
                provider.model_name()
            )));
        }
        let vector = match tokio::time::timeout(self.timeout, provider.embed(text)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(KnowledgeError::ProviderUnavailable(e.to_string())),
            Err(_) => {
                return Err(KnowledgeError::ProviderUnavailable(format!(
                    "timed out after {}s",
                    self.timeout.as_secs_f32()
                )));
            },
        };
        check_dimensions(&vector, self.dimensions())?;
        Ok(vector)
    }

    /// Embed one text. `None` means "no vector": unavailable, timed out,
    /// transport failure, or a malformed vector.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.try_embed(text).await {
            Ok(vector) => Some(vector),
            Err(e) if !self.available() => {
                debug!(error = %e, "skipping embedding");
                None
            },
            Err(e) => {
                warn!(model = self.model_name(), error = %e, "embedding failed");
                None
            },
        }
    }

    /// Embed several texts in one provider call. Output order matches input
    /// order; a slot is `None` when its vector was malformed, and every slot is
    /// `None` when the call failed.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let none = || vec![None; texts.len()];
        let Some(provider) = &self.provider else {
            return none();
        };
        if texts.is_empty() || !self.available() {
            return none();
        }
        match tokio::time::timeout(self.timeout, provider.embed_batch(texts)).await {
            Ok(Ok(vectors)) if vectors.len() == texts.len() => vectors
                .into_iter()
                .map(|v| check_dimensions(&v, self.dimensions()).ok().map(|()| v))
                .collect(),
            Ok(Ok(vectors)) => {
                warn!(
                    model = provider.model_name(),
                    expected = texts.len(),
                    got = vectors.len(),
                    "embedding batch size mismatch"
                );
                none()
            },
            Ok(Err(e)) => {
                warn!(model = provider.model_name(), error = %e, "embedding batch failed");
                none()
            },
            Err(_) => {
                warn!(
                    model = provider.model_name(),
                    timeout_secs = self.timeout.as_secs(),
                    "embedding batch timed out"
                );
                none()
            },
        }
    }
}
