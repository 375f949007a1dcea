//! Sampled deposit-confirmation reports to auditors

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::config::RetryPolicy;
use crate::deposit::{PreparedDeposit, DepositReceipt};
use crate::error::{ProtocolError, Result};
use crate::keys::KeySet;
use crate::retry::send_with_retry;
use crate::transport::{join_url, Transport};
use crate::wire::{to_body, unexpected_reply, DepositConfirmationReport};

/// Whether this deposit is among the 1 in `chance` that get reported
pub fn should_report<R: Rng>(chance: u32, rng: &mut R) -> bool {
    chance <= 1 || rng.gen_range(0..chance) == 0
}

/// Build the report for a confirmed deposit
///
/// The report carries the signing key's master certificate so the auditor
/// can check the exchange key without a key download of its own.
pub fn build_report(
    keys: &KeySet,
    prepared: &PreparedDeposit,
    receipt: &DepositReceipt,
) -> Result<DepositConfirmationReport> {
    let master_pub = keys
        .master_public_key
        .ok_or_else(|| ProtocolError::CallerError("no master key known".to_string()))?;
    let signkey = keys.signing_key(&receipt.exchange_pub).ok_or_else(|| {
        ProtocolError::CallerError(format!(
            "signing key {} not in key set",
            receipt.exchange_pub.short()
        ))
    })?;
    Ok(DepositConfirmationReport {
        h_wire: prepared.request.h_wire,
        h_contract_terms: prepared.request.h_contract_terms,
        exchange_timestamp: receipt.exchange_timestamp,
        refund_deadline: prepared.request.refund_deadline,
        amount_without_fee: receipt.amount_without_fee,
        coin_pub: prepared.coin_pub,
        merchant_pub: prepared.request.merchant_pub,
        exchange_sig: receipt.exchange_sig,
        exchange_pub: receipt.exchange_pub,
        master_pub,
        ep_start: signkey.valid_from,
        ep_expire: signkey.valid_until,
        ep_end: signkey.valid_legal,
        master_sig: signkey.master_sig,
    })
}

/// Client for one auditor
#[derive(Clone)]
pub struct AuditorClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl AuditorClient {
    pub fn new(base_url: impl Into<String>, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
            retry,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /deposit-confirmation`
    #[instrument(skip(self, report), fields(auditor = %self.base_url))]
    pub async fn submit_deposit_confirmation(
        &self,
        report: &DepositConfirmationReport,
    ) -> Result<()> {
        let url = join_url(&self.base_url, "deposit-confirmation");
        let body = to_body(report)?;
        let response = send_with_retry(&self.retry, "deposit confirmation report", || {
            self.transport.post(&url, &body)
        })
        .await?;
        match response.status {
            200 => {
                debug!("Auditor accepted report for coin {}", report.coin_pub.short());
                Ok(())
            }
            _ => Err(unexpected_reply(&response, "deposit confirmation report")),
        }
    }
}

/// Send `report` to every auditor in `auditors`, logging each outcome
pub(crate) async fn report_to_all(auditors: Vec<AuditorClient>, report: DepositConfirmationReport) {
    for auditor in auditors {
        match auditor.submit_deposit_confirmation(&report).await {
            Ok(()) => info!(
                "Reported deposit of coin {} to {}",
                report.coin_pub.short(),
                auditor.base_url()
            ),
            Err(e) => warn!(
                "Auditor {} did not take deposit report: {}",
                auditor.base_url(),
                e
            ),
        }
    }
}
