//! Error types for the auditor

use thiserror::Error;

/// Result type alias for auditor operations
pub type Result<T> = std::result::Result<T, AuditorError>;

/// Errors that abort an audit pass
#[derive(Debug, Error)]
pub enum AuditorError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] coinage_core::CoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A ledger could not be read
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Progress marker could not be loaded or stored
    #[error("Progress store error: {0}")]
    Progress(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
