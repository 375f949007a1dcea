//! Ledgers the deposit check reads from
//!
//! Two sources are compared: the deposit confirmations merchants reported
//! to the auditor, and the deposits the exchange itself recorded. Both are
//! behind traits; the file-backed implementations read JSON lines, one
//! record per line.

use std::path::{Path, PathBuf};

use coinage_client::DepositConfirmationReport;
use coinage_core::{Amount, CoinPublicKey, HashCode, MasterPublicKey, MerchantPublicKey, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::error::{AuditorError, Result};

/// A merchant-reported deposit confirmation and its row in the auditor's store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfirmation {
    pub row_id: u64,
    pub report: DepositConfirmationReport,
}

/// A deposit as recorded by the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDeposit {
    pub coin_pub: CoinPublicKey,
    pub h_contract_terms: HashCode,
    pub merchant_pub: MerchantPublicKey,
    pub h_wire: HashCode,
    pub refund_deadline: Timestamp,
    pub exchange_timestamp: Timestamp,
    pub amount_with_fee: Amount,
}

/// What identifies a deposit when looking it up
///
/// The refund deadline is left out on purpose: the exchange may round it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositQuery {
    pub coin_pub: CoinPublicKey,
    pub h_contract_terms: HashCode,
    pub merchant_pub: MerchantPublicKey,
    pub h_wire: HashCode,
}

impl DepositQuery {
    pub fn for_report(report: &DepositConfirmationReport) -> Self {
        Self {
            coin_pub: report.coin_pub,
            h_contract_terms: report.h_contract_terms,
            merchant_pub: report.merchant_pub,
            h_wire: report.h_wire,
        }
    }

    pub fn matches(&self, deposit: &ExchangeDeposit) -> bool {
        self.coin_pub == deposit.coin_pub
            && self.h_contract_terms == deposit.h_contract_terms
            && self.merchant_pub == deposit.merchant_pub
            && self.h_wire == deposit.h_wire
    }
}

/// Source of merchant-reported confirmations
pub trait ConfirmationSource {
    /// Confirmations for exchange `master` with a row id above `after`, ascending
    fn confirmations_after(
        &self,
        master: &MasterPublicKey,
        after: u64,
    ) -> Result<Vec<StoredConfirmation>>;
}

/// The exchange's deposit ledger
pub trait DepositLedger {
    fn find_deposit(&self, query: &DepositQuery) -> Result<Option<ExchangeDeposit>>;
}

fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AuditorError::Ledger(format!("cannot read {}: {}", path.display(), e))
    })?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                AuditorError::Ledger(format!("{}:{}: {}", path.display(), n + 1, e))
            })
        })
        .collect()
}

/// Append one record to a JSON-lines file
pub fn append_json_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    use std::io::Write;

    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Merchant confirmations stored as JSON lines, re-read on every query
#[derive(Debug, Clone)]
pub struct JsonLinesConfirmations {
    path: PathBuf,
}

impl JsonLinesConfirmations {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfirmationSource for JsonLinesConfirmations {
    fn confirmations_after(
        &self,
        master: &MasterPublicKey,
        after: u64,
    ) -> Result<Vec<StoredConfirmation>> {
        let mut rows: Vec<StoredConfirmation> = read_json_lines(&self.path)?
            .into_iter()
            .filter(|c: &StoredConfirmation| c.row_id > after && c.report.master_pub == *master)
            .collect();
        rows.sort_by_key(|c| c.row_id);
        debug!(
            "{} confirmations after row {} in {}",
            rows.len(),
            after,
            self.path.display()
        );
        Ok(rows)
    }
}

/// Exchange deposits loaded from a JSON-lines file
#[derive(Debug, Clone)]
pub struct JsonLinesDeposits {
    deposits: Vec<ExchangeDeposit>,
}

impl JsonLinesDeposits {
    pub fn open(path: &Path) -> Result<Self> {
        let deposits = read_json_lines(path)?;
        Ok(Self { deposits })
    }

    pub fn len(&self) -> usize {
        self.deposits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deposits.is_empty()
    }
}

impl DepositLedger for JsonLinesDeposits {
    fn find_deposit(&self, query: &DepositQuery) -> Result<Option<ExchangeDeposit>> {
        Ok(self.deposits.iter().find(|d| query.matches(d)).cloned())
    }
}
