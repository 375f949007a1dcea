//! Deposit-confirmation consistency check
//!
//! Every deposit confirmation a merchant reported must correspond to a
//! deposit in the exchange's ledger. A confirmation without one means the
//! exchange signed a deposit it then failed to record.
//!
//! Progress advances to just before the first missing row, so a gap is
//! looked at again on the next pass and reported until it is filled.

use coinage_core::{Amount, CoinPublicKey, Currency, HashCode, MasterPublicKey, Timestamp};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AuditorError, Result};
use crate::ledger::{ConfirmationSource, DepositLedger, DepositQuery};
use crate::progress::ProgressMarker;

/// A confirmation the exchange has no deposit for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingConfirmation {
    pub row_id: u64,
    pub timestamp: Timestamp,
    pub amount: Amount,
    pub h_wire: HashCode,
    pub coin_pub: CoinPublicKey,
    pub h_contract_terms: HashCode,
}

/// A confirmation whose amount is not in the audited currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyMismatch {
    pub row_id: u64,
    pub coin_pub: CoinPublicKey,
    pub amount: Amount,
}

/// Outcome of one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositCheckReport {
    /// Rows above this one were examined
    pub start_row: u64,
    pub rows_checked: u64,
    pub missing: Vec<MissingConfirmation>,
    pub missed_count: u64,
    pub missed_amount: Amount,
    /// Rows skipped because their amount is in another currency
    pub currency_mismatches: Vec<CurrencyMismatch>,
    /// Marker to persist once the pass is complete
    pub progress: ProgressMarker,
}

/// Compares merchant confirmations against the exchange ledger
pub struct DepositConfirmationChecker<'a> {
    master: MasterPublicKey,
    currency: Currency,
    confirmations: &'a dyn ConfirmationSource,
    deposits: &'a dyn DepositLedger,
}

impl<'a> DepositConfirmationChecker<'a> {
    pub fn new(
        master: MasterPublicKey,
        currency: Currency,
        confirmations: &'a dyn ConfirmationSource,
        deposits: &'a dyn DepositLedger,
    ) -> Self {
        Self {
            master,
            currency,
            confirmations,
            deposits,
        }
    }

    /// Run one pass starting after `from`
    ///
    /// Any ledger failure aborts the pass; the caller then keeps its old
    /// marker.
    pub fn run(&self, from: ProgressMarker) -> Result<DepositCheckReport> {
        let rows = self
            .confirmations
            .confirmations_after(&self.master, from.last_row_id)?;
        info!(
            "Checking {} deposit confirmations after row {}",
            rows.len(),
            from.last_row_id
        );

        let mut missing = Vec::new();
        let mut currency_mismatches = Vec::new();
        let mut missed_amount = Amount::zero(self.currency);
        let mut first_missing: Option<u64> = None;
        let mut last_seen = from.last_row_id;

        for row in &rows {
            last_seen = last_seen.max(row.row_id);
            let report = &row.report;
            if report.amount_without_fee.currency() != self.currency {
                warn!(
                    "Row {} for coin {} is in {}, not {}",
                    row.row_id,
                    report.coin_pub.short(),
                    report.amount_without_fee.currency(),
                    self.currency
                );
                currency_mismatches.push(CurrencyMismatch {
                    row_id: row.row_id,
                    coin_pub: report.coin_pub,
                    amount: report.amount_without_fee,
                });
                continue;
            }

            let query = DepositQuery::for_report(report);
            if self.deposits.find_deposit(&query)?.is_some() {
                debug!("Row {} matched", row.row_id);
                continue;
            }

            warn!(
                "Deposit confirmation row {} for coin {} has no exchange deposit",
                row.row_id,
                report.coin_pub.short()
            );
            missed_amount = missed_amount
                .checked_add(&report.amount_without_fee)
                .map_err(|e| AuditorError::Ledger(format!("row {}: {}", row.row_id, e)))?;
            first_missing.get_or_insert(row.row_id);
            missing.push(MissingConfirmation {
                row_id: row.row_id,
                timestamp: report.exchange_timestamp,
                amount: report.amount_without_fee,
                h_wire: report.h_wire,
                coin_pub: report.coin_pub,
                h_contract_terms: report.h_contract_terms,
            });
        }

        let last_row_id = match first_missing {
            Some(row) => row.saturating_sub(1),
            None => last_seen,
        };
        let missed_count = missing.len() as u64;
        if missed_count > 0 {
            warn!(
                "{} deposit confirmations missing, {} in total",
                missed_count, missed_amount
            );
        }

        Ok(DepositCheckReport {
            start_row: from.last_row_id,
            rows_checked: rows.len() as u64,
            missing,
            missed_count,
            missed_amount,
            currency_mismatches,
            progress: ProgressMarker { last_row_id },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ExchangeDeposit, StoredConfirmation};
    use crate::testing::{confirmation, deposit_for, kudos};

    struct Confirmations(Vec<StoredConfirmation>);

    impl ConfirmationSource for Confirmations {
        fn confirmations_after(
            &self,
            master: &MasterPublicKey,
            after: u64,
        ) -> Result<Vec<StoredConfirmation>> {
            Ok(self
                .0
                .iter()
                .filter(|c| c.row_id > after && c.report.master_pub == *master)
                .cloned()
                .collect())
        }
    }

    struct Deposits(Vec<ExchangeDeposit>);

    impl DepositLedger for Deposits {
        fn find_deposit(&self, query: &DepositQuery) -> Result<Option<ExchangeDeposit>> {
            Ok(self.0.iter().find(|d| query.matches(d)).cloned())
        }
    }

    struct Broken;

    impl DepositLedger for Broken {
        fn find_deposit(&self, _query: &DepositQuery) -> Result<Option<ExchangeDeposit>> {
            Err(AuditorError::Ledger("connection lost".to_string()))
        }
    }

    fn fixture(rows: u64, missing: &[u64]) -> (Confirmations, Deposits) {
        let confirmations: Vec<StoredConfirmation> = (1..=rows).map(confirmation).collect();
        let deposits = confirmations
            .iter()
            .filter(|c| !missing.contains(&c.row_id))
            .map(deposit_for)
            .collect();
        (Confirmations(confirmations), Deposits(deposits))
    }

    fn checker<'a>(c: &'a Confirmations, d: &'a dyn DepositLedger) -> DepositConfirmationChecker<'a> {
        let master = c.0[0].report.master_pub;
        DepositConfirmationChecker::new(master, Currency::new("KUDOS").unwrap(), c, d)
    }

    #[test]
    fn test_all_present_advances_to_last_row() {
        let (c, d) = fixture(5, &[]);
        let report = checker(&c, &d).run(ProgressMarker::default()).unwrap();
        assert_eq!(report.rows_checked, 5);
        assert_eq!(report.missed_count, 0);
        assert!(report.missed_amount.is_zero());
        assert_eq!(report.progress.last_row_id, 5);
    }

    #[test]
    fn test_gap_holds_progress_before_first_missing() {
        let (c, d) = fixture(10, &[4, 7]);
        let report = checker(&c, &d).run(ProgressMarker::default()).unwrap();
        assert_eq!(report.missed_count, 2);
        assert_eq!(report.missed_amount, kudos("2"));
        let rows: Vec<u64> = report.missing.iter().map(|m| m.row_id).collect();
        assert_eq!(rows, vec![4, 7]);
        assert_eq!(report.progress.last_row_id, 3);

        // Re-running from the stored marker reports the same gap again
        let again = checker(&c, &d).run(report.progress).unwrap();
        assert_eq!(again.missed_count, 2);
        assert_eq!(again.progress.last_row_id, 3);
    }

    #[test]
    fn test_resumes_after_marker() {
        let (c, d) = fixture(6, &[2]);
        let report = checker(&c, &d).run(ProgressMarker { last_row_id: 3 }).unwrap();
        assert_eq!(report.rows_checked, 3);
        assert_eq!(report.missed_count, 0);
        assert_eq!(report.progress.last_row_id, 6);
    }

    #[test]
    fn test_empty_pass_keeps_marker() {
        let (c, d) = fixture(2, &[]);
        let report = checker(&c, &d).run(ProgressMarker { last_row_id: 2 }).unwrap();
        assert_eq!(report.rows_checked, 0);
        assert_eq!(report.progress.last_row_id, 2);
    }

    #[test]
    fn test_foreign_currency_row_is_reported_and_skipped() {
        let (mut c, d) = fixture(4, &[3]);
        c.0[1].report.amount_without_fee = "EUR:1".parse().unwrap();
        let report = checker(&c, &d).run(ProgressMarker::default()).unwrap();

        assert_eq!(report.rows_checked, 4);
        assert_eq!(report.currency_mismatches.len(), 1);
        assert_eq!(report.currency_mismatches[0].row_id, 2);
        assert_eq!(report.currency_mismatches[0].amount.currency().as_str(), "EUR");
        // The rest of the pass still runs
        assert_eq!(report.missed_count, 1);
        assert_eq!(report.missing[0].row_id, 3);
        assert_eq!(report.missed_amount, kudos("1"));
        assert_eq!(report.progress.last_row_id, 2);
    }

    #[test]
    fn test_ledger_failure_aborts() {
        let (c, _) = fixture(3, &[]);
        let result = checker(&c, &Broken).run(ProgressMarker::default());
        assert!(matches!(result, Err(AuditorError::Ledger(_))));
    }
}
