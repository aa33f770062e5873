//! Error types for incremental training

use thiserror::Error;

/// Incremental training errors
#[derive(Debug, Error)]
pub enum IlError {
    /// Configuration error (fatal, indicates misconfiguration)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Custom sampling requested with a count that has no preset
    #[error("The per num for custom sample method cannot be {per_num}")]
    InvalidSamplePreset { per_num: i64 },

    /// A previous-state snapshot was requested at the initial state
    #[error("Initial state doesn't have previous state")]
    NoPreviousState,

    /// Transient failure inside a single training iteration
    #[error("Iteration error: {0}")]
    Iteration(String),

    /// Model collaborator error
    #[error("Model error: {0}")]
    Model(String),

    /// Dataset collaborator error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Shape mismatch
    #[error("Shape mismatch for {name}: expected {expected}, got {got}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl IlError {
    /// Whether the training loop may skip past this error when debug mode is off.
    ///
    /// Configuration errors are always fatal.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            IlError::Config(_) | IlError::InvalidSamplePreset { .. } | IlError::NoPreviousState
        )
    }
}

impl From<bincode::Error> for IlError {
    fn from(e: bincode::Error) -> Self {
        IlError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for IlError {
    fn from(e: serde_json::Error) -> Self {
        IlError::Serialization(e.to_string())
    }
}

/// Result type for incremental training operations
pub type Result<T> = std::result::Result<T, IlError>;
