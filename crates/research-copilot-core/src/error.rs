//! Error taxonomy for the retrieval and grounded-generation pipeline.
//!
//! Insufficient evidence and invalid citations are deliberately absent:
//! both are terminal *answer* states (see [`crate::synth::Answer`]), not
//! failures.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CopilotError>;

/// Errors raised by the core pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CopilotError {
    /// Unknown source on delete.
    #[error("source not found: {source_name}")]
    NotFound { source_name: String },

    /// Unknown or ended conversation session.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Mutation contention (reset while writes are in flight under the fail policy).
    #[error("conflict on '{source_name}': {reason}")]
    Conflict { source_name: String, reason: String },

    /// The embedding gateway failed or is not configured.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The language-model gateway failed or is not configured.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Caller supplied something unusable (empty text, bad chunking config).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Backend storage failure.
    #[error("store error: {0}")]
    Store(String),

    /// The caller cancelled an in-flight stream.
    #[error("cancelled")]
    Cancelled,
}

impl CopilotError {
    /// Stable machine-readable code, used by the HTTP error contract.
    pub fn kind(&self) -> &'static str {
        match self {
            CopilotError::NotFound { .. } | CopilotError::SessionNotFound { .. } => "not_found",
            CopilotError::Conflict { .. } => "conflict",
            CopilotError::EmbeddingUnavailable(_) => "embedding_unavailable",
            CopilotError::ModelUnavailable(_) => "model_unavailable",
            CopilotError::InvalidInput(_) => "bad_request",
            CopilotError::Store(_) => "store_error",
            CopilotError::Cancelled => "cancelled",
        }
    }

    /// Whether retrying the same unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CopilotError::Conflict { .. }
                | CopilotError::EmbeddingUnavailable(_)
                | CopilotError::ModelUnavailable(_)
                | CopilotError::Store(_)
        )
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        CopilotError::Store(err.to_string())
    }

    /// Prefix the message with the unit of work that failed (a source name
    /// or turn id) so the caller knows what to retry.
    pub fn context(self, unit: &str) -> Self {
        match self {
            CopilotError::EmbeddingUnavailable(m) => {
                CopilotError::EmbeddingUnavailable(format!("{}: {}", unit, m))
            }
            CopilotError::ModelUnavailable(m) => {
                CopilotError::ModelUnavailable(format!("{}: {}", unit, m))
            }
            CopilotError::InvalidInput(m) => CopilotError::InvalidInput(format!("{}: {}", unit, m)),
            CopilotError::Store(m) => CopilotError::Store(format!("{}: {}", unit, m)),
            other => other,
        }
    }
}
