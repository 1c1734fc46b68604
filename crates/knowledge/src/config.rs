use std::{fmt, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{KnowledgeError, Result};

/// Configuration for the knowledge engine.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub store: StoreConfig,
    pub embeddings: EmbeddingsConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database file (or `:memory:` for tests).
    pub db_path: String,
    /// Upper bound for any single backend call.
    pub timeout_secs: u64,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "knowledge.db".into(),
            timeout_secs: 30,
            max_connections: 4,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// OpenAI-compatible `/v1/embeddings`.
    OpenAi,
    /// Ollama `/api/embeddings`.
    Ollama,
    /// No provider; every search uses full-text fallback.
    None,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub provider: EmbeddingBackend,
    pub base_url: String,
    pub model: String,
    /// Expected vector length. `0` accepts whatever the provider returns.
    pub dimensions: usize,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::Ollama,
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
            dimensions: 0,
            api_key: None,
            timeout_secs: 30,
            probe_timeout_secs: 10,
        }
    }
}

impl fmt::Debug for EmbeddingsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingsConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .finish()
    }
}

impl EmbeddingsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub min_similarity: f32,
    /// Results fetched before context packing; more than will usually fit.
    pub context_fetch_limit: usize,
    /// Similarity floor applied when assembling context.
    pub context_min_similarity: f32,
    pub context_max_chars: usize,
    /// Divisor that maps full-text relevance into the cosine score range.
    pub fallback_score_scale: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            min_similarity: 0.0,
            context_fetch_limit: 8,
            context_min_similarity: 0.3,
            context_max_chars: 2000,
            fallback_score_scale: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Ceiling on stored conversation documents.
    pub max_memories: usize,
    /// Consolidation fires each time the conversation count crosses a multiple of this.
    pub consolidate_every: usize,
    pub retention_on_ingest: bool,
    pub maintenance_interval_secs: u64,
    pub seed_on_start: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memories: 1000,
            consolidate_every: 100,
            retention_on_ingest: true,
            maintenance_interval_secs: 300,
            seed_on_start: true,
        }
    }
}

impl MemoryConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl KnowledgeConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            },
            Err(e) => Err(KnowledgeError::invalid(format!(
                "failed to read config {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| KnowledgeError::invalid(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if r.default_limit == 0 || r.context_fetch_limit == 0 {
            return Err(KnowledgeError::invalid("retrieval limits must be positive"));
        }
        for (name, floor) in [
            ("min_similarity", r.min_similarity),
            ("context_min_similarity", r.context_min_similarity),
        ] {
            if !floor.is_finite() || !(-1.0..=1.0).contains(&floor) {
                return Err(KnowledgeError::invalid(format!(
                    "{name} must be within [-1, 1]"
                )));
            }
        }
        if !r.fallback_score_scale.is_finite() || r.fallback_score_scale <= 0.0 {
            return Err(KnowledgeError::invalid(
                "fallback_score_scale must be positive",
            ));
        }
        if self.store.timeout_secs == 0
            || self.embeddings.timeout_secs == 0
            || self.embeddings.probe_timeout_secs == 0
        {
            return Err(KnowledgeError::invalid("timeouts must be positive"));
        }
        if self.store.max_connections == 0 {
            return Err(KnowledgeError::invalid("max_connections must be positive"));
        }
        if self.memory.max_memories == 0 || self.memory.consolidate_every == 0 {
            return Err(KnowledgeError::invalid(
                "max_memories and consolidate_every must be positive",
            ));
        }
        if self.memory.maintenance_interval_secs == 0 {
            return Err(KnowledgeError::invalid(
                "maintenance_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = KnowledgeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.retrieval.context_fetch_limit, 8);
        assert_eq!(cfg.memory.max_memories, 1000);
        assert_eq!(cfg.embeddings.provider, EmbeddingBackend::Ollama);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = KnowledgeConfig::from_toml_str(
            r#"
            [embeddings]
            provider = "openai"
            model = "text-embedding-3-small"
            dimensions = 1536
            api_key = "sk-test"

            [memory]
            max_memories = 50
            "#,
        )
        .unwrap();
        assert_eq!(cfg.embeddings.provider, EmbeddingBackend::OpenAi);
        assert_eq!(cfg.embeddings.dimensions, 1536);
        assert_eq!(cfg.embeddings.timeout_secs, 30);
        assert_eq!(cfg.memory.max_memories, 50);
        assert_eq!(cfg.memory.consolidate_every, 100);
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let mut cfg = KnowledgeConfig::default();
        cfg.embeddings.api_key = Some("sk-very-secret".into());
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("sk-very-secret"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(KnowledgeConfig::from_toml_str("[retrieval]\ndefault_limit = 0").is_err());
        assert!(KnowledgeConfig::from_toml_str("[retrieval]\nmin_similarity = 1.5").is_err());
        assert!(KnowledgeConfig::from_toml_str("[memory]\nmax_memories = 0").is_err());
        assert!(KnowledgeConfig::from_toml_str("[store]\ntimeout_secs = 0").is_err());
        assert!(KnowledgeConfig::from_toml_str("[embeddings]\nprovider = \"bogus\"").is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = KnowledgeConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.store.db_path, "knowledge.db");
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lorekeep.toml");
        std::fs::write(&path, "[store]\ndb_path = \"/tmp/kb.db\"\n").unwrap();
        let cfg = KnowledgeConfig::load(&path).unwrap();
        assert_eq!(cfg.store.db_path, "/tmp/kb.db");
    }
}
