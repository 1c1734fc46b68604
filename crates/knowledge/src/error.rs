use thiserror::Error;

/// Failure kinds surfaced by the knowledge engine.
///
/// Transient I/O failures (`ProviderUnavailable`, `BackendUnavailable`) are
/// absorbed by the engine facade and turned into degraded results. Only
/// `InvalidRequest` is meant to reach callers as a hard error.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("document backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("duplicate document id: {0}")]
    DuplicateId(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl KnowledgeError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable(err.to_string())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

impl From<sqlx::Error> for KnowledgeError {
    fn from(err: sqlx::Error) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for KnowledgeError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::BackendUnavailable(format!("migration failed: {err}"))
    }
}

impl From<serde_json::Error> for KnowledgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::BackendUnavailable(format!("corrupt record: {err}"))
    }
}

pub type Result<T, E = KnowledgeError> = std::result::Result<T, E>;
