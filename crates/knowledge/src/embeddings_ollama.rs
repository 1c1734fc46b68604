//! Ollama embeddings provider (`POST /api/embeddings`).
//!
//! Ollama embeds one prompt per request, so batches go through the trait's
//! sequential default. Probing hits `/api/tags`, which is cheap and does not
//! load the model.

use std::time::Duration;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use crate::embeddings::EmbeddingProvider;

pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    timeout: Duration,
    probe_timeout: Duration,
}

impl OllamaEmbeddingProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dims: 0,
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dims = dims;
        self
    }

    pub fn with_timeouts(mut self, timeout: Duration, probe_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.probe_timeout = probe_timeout;
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let resp = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .timeout(self.timeout)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<EmbeddingResponse>()
            .await?;
        if resp.embedding.is_empty() {
            anyhow::bail!("ollama returned an empty embedding for model {}", self.model);
        }
        Ok(resp.embedding)
    }

    async fn probe(&self) -> anyhow::Result<()> {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
