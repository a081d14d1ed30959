//! Common error types for tulka.

use thiserror::Error;

/// Errors that can occur when using tulka.
#[derive(Debug, Error)]
pub enum TulkaError {
    /// Invalid model or generation configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required collaborator was not supplied to the builder.
    #[error("Missing {0}; configure it on the builder before build()")]
    MissingComponent(&'static str),

    /// Vocabulary file could not be read or parsed.
    #[error("Failed to load vocabulary: {source}")]
    VocabFailed {
        #[source]
        source: anyhow::Error,
    },

    /// Checkpoint loading failed, including parameter name-set mismatches.
    #[error("Failed to load checkpoint: {source}")]
    CheckpointFailed {
        #[source]
        source: anyhow::Error,
    },

    /// Inference failed.
    #[error("Inference failed: {0}")]
    Inference(#[from] anyhow::Error),
}

/// Result type for tulka operations.
pub type TulkaResult<T> = Result<T, TulkaError>;
