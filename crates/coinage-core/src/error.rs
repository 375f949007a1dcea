//! Error types for coinage-core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by amounts, the record codec, and the crypto primitives
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Two amounts with different currencies were combined
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    /// Addition exceeded the maximum representable amount
    #[error("Amount overflow")]
    AmountOverflow,

    /// Subtraction would produce a negative amount
    #[error("Amount would become negative")]
    AmountNegative,

    /// Amount string or binary form could not be parsed
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Record shorter than its declared layout
    #[error("Record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// Record header does not match the expected purpose
    #[error("Purpose mismatch: expected {expected}, got {got}")]
    PurposeMismatch { expected: u32, got: u32 },

    /// Declared record size disagrees with the actual length
    #[error("Record size mismatch: header says {declared}, got {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    /// Invalid key, signature, or encoding
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// A signature failed to verify
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Revealed refresh data does not reproduce the commitment
    #[error("Refresh commitment mismatch: {0}")]
    CommitmentMismatch(String),

    /// Hex decoding failure
    #[error("Hex error: {0}")]
    Hex(String),
}

impl From<hex::FromHexError> for CoreError {
    fn from(e: hex::FromHexError) -> Self {
        CoreError::Hex(e.to_string())
    }
}
