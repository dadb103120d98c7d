use thiserror::Error;

use crate::eval::phase::InvalidTransition;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("provider call timed out after {0} ms")]
    Timeout(u64),
}

impl LLMError {
    /// Errors worth a single retry: timeouts and connection-level failures.
    /// Malformed content is never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            LLMError::Timeout(_) => true,
            LLMError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("embedding service returned an invalid vector: {0}")]
    InvalidVector(String),

    #[error(transparent)]
    Provider(#[from] LLMError),
}

/// Run-level failures. Turn-level failures never surface here; they are
/// recorded inside the scenario report instead.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("agent under test unavailable: {0}")]
    AgentUnavailable(String),

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(#[from] EmbeddingError),

    #[error("malformed scenario config: {0}")]
    MalformedScenarioConfig(String),

    #[error("invalid evaluation config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    PhaseTransition(#[from] InvalidTransition),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
