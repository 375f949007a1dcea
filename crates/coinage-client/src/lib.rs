//! Coinage Client - Protocol engine for talking to a Coinage exchange
//!
//! This crate drives the wallet and merchant side of the protocol:
//!
//! - **Key sets**: download, verify and merge the exchange's `/keys`
//! - **Withdraw**: blind-signed coins from a reserve
//! - **Deposit**: deposit permissions and signed confirmations
//! - **Refresh**: melt, cut-and-choose reveal, and link
//! - **Recoup**: reclaim the value of coins of revoked denominations
//! - **Proofs**: replay of coin and reserve histories on `409` replies
//!
//! Requests go through the [`Transport`] trait so the HTTP stack stays the
//! caller's choice. Every signature the exchange returns is checked before a
//! result is delivered.

pub mod auditor;
pub mod client;
pub mod config;
pub mod deposit;
pub mod error;
pub mod history;
pub mod keys;
pub mod pending;
pub mod recoup;
pub mod refresh;
pub mod retry;
pub mod transport;
pub mod version;
pub mod wire;
pub mod withdraw;

#[cfg(test)]
mod testing;

pub use auditor::{should_report, AuditorClient};
pub use client::ExchangeClient;
pub use config::{ExchangeConfig, RetryPolicy, DEFAULT_AUDITOR_CHANCE};
pub use deposit::{DepositParams, DepositReceipt, PreparedDeposit};
pub use error::{ErrorCode, ProtocolError, Result, TransportError};
pub use history::{CoinHistoryEntry, ReserveHistoryEntry};
pub use keys::{AuditorInfo, DenominationInfo, KeySet, SigningKeyInfo};
pub use pending::PendingRequest;
pub use recoup::{PreparedRecoup, RecoupReceipt, RecoupTarget};
pub use refresh::{LinkedCoin, MeltOutcome, MeltPlan};
pub use transport::{AuditorConnector, HttpResponse, Transport};
pub use version::{ProtocolVersion, VersionCompat};
pub use wire::{DepositConfirmationReport, WireAccount};
pub use withdraw::PreparedWithdraw;
