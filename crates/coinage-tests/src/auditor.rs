//! In-process auditor collecting deposit-confirmation reports

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use coinage_auditor::{ConfirmationSource, StoredConfirmation};
use coinage_client::{
    AuditorConnector, DepositConfirmationReport, ErrorCode, HttpResponse, Transport,
    TransportError,
};
use coinage_core::codec::{DepositConfirmationPS, SignKeyValidityPS, SignedRecord};
use coinage_core::MasterPublicKey;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::exchange::AUDITOR_URL;

/// Accepts `POST /deposit-confirmation` and keeps every valid report as a row
#[derive(Default)]
pub struct AuditorSim {
    rows: Mutex<Vec<StoredConfirmation>>,
}

impl AuditorSim {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, Vec<StoredConfirmation>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    pub fn stored(&self) -> Vec<StoredConfirmation> {
        self.rows().clone()
    }

    fn accept(&self, body: &Value) -> HttpResponse {
        let report: DepositConfirmationReport = match serde_json::from_value(body.clone()) {
            Ok(report) => report,
            Err(e) => {
                return HttpResponse::new(
                    400,
                    json!({ "code": ErrorCode::InvalidJson.as_u32(), "hint": e.to_string() }),
                )
            }
        };

        let certified = SignKeyValidityPS {
            master_public_key: report.master_pub,
            start: report.ep_start,
            expire: report.ep_expire,
            end: report.ep_end,
            signkey_pub: report.exchange_pub,
        }
        .verify(&report.master_pub, &report.master_sig)
        .is_ok();
        let confirmed = DepositConfirmationPS {
            h_contract_terms: report.h_contract_terms,
            h_wire: report.h_wire,
            exchange_timestamp: report.exchange_timestamp,
            refund_deadline: report.refund_deadline,
            amount_without_fee: report.amount_without_fee,
            coin_pub: report.coin_pub,
            merchant: report.merchant_pub,
        }
        .verify(&report.exchange_pub, &report.exchange_sig)
        .is_ok();
        if !certified || !confirmed {
            warn!(
                "Rejecting report for coin {}: signing key certified {}, confirmation valid {}",
                report.coin_pub.short(),
                certified,
                confirmed
            );
            return HttpResponse::new(
                403,
                json!({
                    "code": ErrorCode::CoinSignatureInvalid.as_u32(),
                    "hint": "report signatures do not verify",
                }),
            );
        }

        let mut rows = self.rows();
        let row_id = rows.len() as u64 + 1;
        debug!("Stored report for coin {} as row {}", report.coin_pub.short(), row_id);
        rows.push(StoredConfirmation { row_id, report });
        HttpResponse::new(200, json!({}))
    }
}

#[async_trait]
impl Transport for AuditorSim {
    async fn get(&self, _url: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(404, json!({ "code": 0, "hint": "no such endpoint" })))
    }

    async fn post(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        if url.ends_with("/deposit-confirmation") {
            Ok(self.accept(body))
        } else {
            Ok(HttpResponse::new(404, json!({ "code": 0, "hint": "no such endpoint" })))
        }
    }
}

impl ConfirmationSource for AuditorSim {
    fn confirmations_after(
        &self,
        master: &MasterPublicKey,
        after: u64,
    ) -> coinage_auditor::Result<Vec<StoredConfirmation>> {
        Ok(self
            .rows()
            .iter()
            .filter(|c| c.row_id > after && c.report.master_pub == *master)
            .cloned()
            .collect())
    }
}

/// Hands out the simulated auditor for its URL and nothing else
pub struct SimAuditorConnector(pub Arc<AuditorSim>);

impl AuditorConnector for SimAuditorConnector {
    fn connect(&self, auditor_url: &str) -> Option<Arc<dyn Transport>> {
        if auditor_url != AUDITOR_URL {
            return None;
        }
        let transport: Arc<dyn Transport> = self.0.clone();
        Some(transport)
    }
}
