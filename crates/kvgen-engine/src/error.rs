//! Engine error taxonomy.

use kvgen_kv::KVError;
use kvgen_models::ModelError;
use kvgen_sampling::SamplingError;
use kvgen_tokenizer::TokenizerError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error type for generation requests.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid chunk size, sampling parameters or request shape. Raised before
    /// any session is touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The cache cannot hold one prefill chunk or the pinned anchor.
    #[error("capacity error: {0}")]
    Capacity(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// An open stream owns the session; finish, cancel or drop it first.
    #[error("session {0} is owned by an open stream")]
    SessionBusy(String),

    #[error("empty prompt")]
    EmptyPrompt,

    /// The forward pass produced NaN or infinite logits. Nothing from that
    /// evaluation was written to the cache.
    #[error("non-finite logits at position {position}")]
    NumericalAnomaly { position: usize },

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("kv cache error: {0}")]
    Kv(KVError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("generation worker unavailable")]
    WorkerUnavailable,
}

impl From<KVError> for EngineError {
    fn from(err: KVError) -> Self {
        if err.is_capacity_error() {
            EngineError::Capacity(err.to_string())
        } else {
            EngineError::Kv(err)
        }
    }
}

impl EngineError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, EngineError::Capacity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_policy_errors_map_to_capacity() {
        let err: EngineError = KVError::ChunkTooLarge {
            chunk: 9,
            available: 7,
        }
        .into();
        assert!(err.is_capacity());

        let err: EngineError = KVError::ShapeMismatch {
            expected: 8,
            got: 4,
        }
        .into();
        assert!(matches!(err, EngineError::Kv(_)));
    }

    #[test]
    fn display_includes_detail() {
        let err = EngineError::SessionNotFound("chat-1".into());
        assert_eq!(err.to_string(), "session not found: chat-1");
    }
}
