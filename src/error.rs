//! Error types for the escrow engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Missing parameter {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Ledger unreachable: {0}")]
    Network(String),

    #[error("Ledger error {code}: {message}")]
    Ledger { code: String, message: String },

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Completion record for {owner}/{sequence} changed concurrently")]
    Conflict { owner: String, sequence: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if error is retryable by the owning task's next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_) | EngineError::Timeout { .. } | EngineError::Conflict { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            EngineError::Signing(_) | EngineError::Persistence(_) | EngineError::Database(_)
        )
    }

    /// Ledger reported that no server in the cluster is reachable.
    pub fn is_no_network(&self) -> bool {
        match self {
            EngineError::Network(_) => true,
            EngineError::Ledger { code, .. } => code == "noNetwork",
            _ => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Decoding(e.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
