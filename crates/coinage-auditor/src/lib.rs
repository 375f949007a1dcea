//! Coinage Auditor - Deposit-confirmation consistency checking
//!
//! Merchants forward a sample of the exchange's deposit confirmations to
//! the auditor. This crate checks them against the exchange's own deposit
//! ledger in resumable passes.

pub mod checker;
pub mod config;
pub mod error;
pub mod ledger;
pub mod progress;

#[cfg(test)]
mod testing;

pub use checker::{
    CurrencyMismatch, DepositCheckReport, DepositConfirmationChecker, MissingConfirmation,
};
pub use config::AuditorConfig;
pub use error::{AuditorError, Result};
pub use ledger::{
    append_json_line, ConfirmationSource, DepositLedger, DepositQuery, ExchangeDeposit,
    JsonLinesConfirmations, JsonLinesDeposits, StoredConfirmation,
};
pub use progress::{ProgressMarker, ProgressStore};
