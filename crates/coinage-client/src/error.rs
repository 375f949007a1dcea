//! Error types for the protocol engine

use coinage_core::CoreError;
use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Outcome classes of a protocol operation
///
/// Only [`ProtocolError::Transient`] may be retried. Everything else is
/// final for the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Response or stored data does not parse or violates the format
    #[error("Malformed: {0}")]
    Malformed(String),

    /// A signature in a response failed to verify
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// The server claimed a conflict but its proof does not hold
    #[error("Invalid proof: {0}")]
    ProofInvalid(String),

    /// The server proved a conflict (double spend, insufficient reserve)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Retry budget exhausted on network or server failures
    #[error("Transient failure after {attempts} attempts: {reason}")]
    Transient { attempts: u32, reason: String },

    /// The request could not be built from the given arguments
    #[error("Caller error: {0}")]
    CallerError(String),

    /// The server refused the request without a proof
    #[error("Rejected with status {status} (code {code}): {hint}")]
    Rejected { status: u16, code: u32, hint: String },

    /// The server found a signature in the request invalid (`403`)
    ///
    /// A correct client never sees this from a correct exchange, so one
    /// of the two has a bug.
    #[error("Forbidden (code {code}): {hint}")]
    Forbidden { code: u32, hint: String },

    /// The request was cancelled before completion
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProtocolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::Transient { .. })
    }

    /// Map a core error raised while building a request
    pub fn caller(e: CoreError) -> Self {
        ProtocolError::CallerError(e.to_string())
    }
}

impl From<CoreError> for ProtocolError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::SignatureVerificationFailed => {
                ProtocolError::SignatureInvalid(e.to_string())
            }
            other => ProtocolError::Malformed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

/// Failure below the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,
}

/// Numeric error codes carried in `{"code": n, "hint": ...}` bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    InvalidJson = 1000,
    ParameterMalformed = 1001,
    DbSoftFailure = 1010,
    DbHardFailure = 1011,
    ReserveInsufficientFunds = 1150,
    ReserveSignatureInvalid = 1151,
    CoinSignatureInvalid = 1200,
    DepositInsufficientFunds = 1205,
    CoinConflictingDenomination = 1206,
    DenominationKeyUnknown = 1300,
    DenominationRevoked = 1301,
    DenominationExpired = 1302,
    DenominationSignatureInvalid = 1303,
    RefreshCommitmentViolation = 1370,
    RefreshSessionUnknown = 1371,
    LinkCoinUnknown = 1400,
    RecoupNotEligible = 1850,
    RecoupRefreshedMismatch = 1851,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        use ErrorCode::*;
        [
            None,
            InvalidJson,
            ParameterMalformed,
            DbSoftFailure,
            DbHardFailure,
            ReserveInsufficientFunds,
            ReserveSignatureInvalid,
            CoinSignatureInvalid,
            DepositInsufficientFunds,
            CoinConflictingDenomination,
            DenominationKeyUnknown,
            DenominationRevoked,
            DenominationExpired,
            DenominationSignatureInvalid,
            RefreshCommitmentViolation,
            RefreshSessionUnknown,
            LinkCoinUnknown,
            RecoupNotEligible,
            RecoupRefreshedMismatch,
        ]
        .into_iter()
        .find(|c| c.as_u32() == code)
    }
}
