//! JSON bodies exchanged with the exchange and the auditors

use coinage_core::{
    Amount, AuditorPublicKey, BlindedMessage, BlindedSignature, BlindingKeySecret, CoinPublicKey,
    DenominationPublicKey, EddsaSignature, ExchangePublicKey, HashCode, MasterPublicKey,
    MerchantPublicKey, RelativeTime, ReservePublicKey, RsaSignature, Timestamp,
    TransferPrivateKey, TransferPublicKey,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ProtocolError};
use crate::transport::HttpResponse;

/// `GET /keys`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysResponse {
    pub version: String,
    pub master_public_key: MasterPublicKey,
    pub list_issue_date: Timestamp,
    pub reserve_closing_delay: RelativeTime,
    pub signkeys: Vec<SignKeyJson>,
    pub denoms: Vec<DenomJson>,
    #[serde(default)]
    pub auditors: Vec<AuditorJson>,
    #[serde(default)]
    pub recoup: Vec<RecoupJson>,
    /// Absent only in cached copies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eddsa_pub: Option<ExchangePublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eddsa_sig: Option<EddsaSignature>,
    /// Cache lifetime, present only in cached copies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignKeyJson {
    pub key: ExchangePublicKey,
    pub master_sig: EddsaSignature,
    pub stamp_start: Timestamp,
    pub stamp_expire: Timestamp,
    pub stamp_end: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenomJson {
    pub master_sig: EddsaSignature,
    pub stamp_start: Timestamp,
    pub stamp_expire_withdraw: Timestamp,
    pub stamp_expire_deposit: Timestamp,
    pub stamp_expire_legal: Timestamp,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub fee_deposit: Amount,
    pub fee_refresh: Amount,
    pub fee_refund: Amount,
    pub denom_pub: DenominationPublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditorJson {
    pub auditor_pub: AuditorPublicKey,
    pub auditor_url: String,
    pub denomination_keys: Vec<AuditorDenomJson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditorDenomJson {
    pub denom_pub_h: HashCode,
    pub auditor_sig: EddsaSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoupJson {
    pub h_denom_pub: HashCode,
}

/// Merchant wire account as given to the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAccount {
    pub payto_uri: String,
    pub salt: String,
}

impl WireAccount {
    pub fn h_wire(&self) -> HashCode {
        coinage_core::wire_hash(&self.payto_uri, &self.salt)
    }
}

/// `POST /coins/{coin_pub}/deposit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequestJson {
    pub contribution: Amount,
    pub wire: WireAccount,
    pub h_wire: HashCode,
    pub h_contract_terms: HashCode,
    pub denom_pub_hash: HashCode,
    pub ub_sig: RsaSignature,
    pub timestamp: Timestamp,
    pub merchant_pub: MerchantPublicKey,
    pub refund_deadline: Timestamp,
    pub wire_transfer_deadline: Timestamp,
    pub coin_sig: EddsaSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositSuccessJson {
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
    pub exchange_timestamp: Timestamp,
}

/// `POST /reserves/{reserve_pub}/withdraw`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequestJson {
    pub denom_pub_hash: HashCode,
    pub coin_ev: BlindedMessage,
    pub reserve_sig: EddsaSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawSuccessJson {
    pub ev_sig: BlindedSignature,
}

/// `POST /coins/{coin_pub}/melt`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltRequestJson {
    pub coin_pub: CoinPublicKey,
    pub denom_pub_hash: HashCode,
    pub denom_sig: RsaSignature,
    pub confirm_sig: EddsaSignature,
    pub value_with_fee: Amount,
    pub rc: HashCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltSuccessJson {
    pub noreveal_index: u32,
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
}

/// `POST /refreshes/{rc}/reveal`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealRequestJson {
    pub transfer_pub: TransferPublicKey,
    pub transfer_privs: Vec<TransferPrivateKey>,
    pub new_denoms_h: Vec<HashCode>,
    pub coin_evs: Vec<BlindedMessage>,
    pub link_sigs: Vec<EddsaSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealSuccessJson {
    pub ev_sigs: Vec<EvSigJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvSigJson {
    pub ev_sig: BlindedSignature,
}

/// One refresh session in `GET /coins/{coin_pub}/link`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSessionJson {
    pub transfer_pub: TransferPublicKey,
    pub new_coins: Vec<LinkCoinJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCoinJson {
    pub denom_pub: DenominationPublicKey,
    pub ev_sig: BlindedSignature,
    pub link_sig: EddsaSignature,
}

/// `POST /coins/{coin_pub}/recoup`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoupRequestJson {
    pub denom_pub_hash: HashCode,
    pub denom_sig: RsaSignature,
    pub coin_sig: EddsaSignature,
    pub coin_blind_key_secret: BlindingKeySecret,
    pub refreshed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoupSuccessJson {
    pub refreshed: bool,
    #[serde(default)]
    pub reserve_pub: Option<ReservePublicKey>,
    #[serde(default)]
    pub old_coin_pub: Option<CoinPublicKey>,
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
    pub timestamp: Timestamp,
    pub amount: Amount,
}

/// `POST /deposit-confirmation` on an auditor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositConfirmationReport {
    pub h_wire: HashCode,
    pub h_contract_terms: HashCode,
    pub exchange_timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub amount_without_fee: Amount,
    pub coin_pub: CoinPublicKey,
    pub merchant_pub: MerchantPublicKey,
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
    pub master_pub: MasterPublicKey,
    pub ep_start: Timestamp,
    pub ep_expire: Timestamp,
    pub ep_end: Timestamp,
    pub master_sig: EddsaSignature,
}

/// Error body `{"code": n, "hint": "..."}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorJson {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub hint: String,
}

impl ErrorJson {
    pub fn from_body(body: &Value) -> Self {
        serde_json::from_value(body.clone()).unwrap_or_default()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.code)
    }
}

/// Parse a typed body, reporting failures as `Malformed`
pub fn parse<T: serde::de::DeserializeOwned>(body: &Value, what: &str) -> Result<T, ProtocolError> {
    serde_json::from_value(body.clone())
        .map_err(|e| ProtocolError::Malformed(format!("{}: {}", what, e)))
}

/// Serialize a request body
pub fn to_body<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::CallerError(e.to_string()))
}

/// Translate a reply the operation has no success or proof handling for
pub fn unexpected_reply(response: &HttpResponse, operation: &str) -> ProtocolError {
    let error = ErrorJson::from_body(&response.body);
    match response.status {
        403 => {
            tracing::error!(
                "{} rejected as badly signed (code {}): {}",
                operation,
                error.code,
                error.hint
            );
            ProtocolError::Forbidden {
                code: error.code,
                hint: error.hint,
            }
        }
        400..=499 => {
            tracing::info!(
                "{} rejected with status {} (code {}): {}",
                operation,
                response.status,
                error.code,
                error.hint
            );
            ProtocolError::Rejected {
                status: response.status,
                code: error.code,
                hint: error.hint,
            }
        }
        status if status >= 500 => ProtocolError::Transient {
            attempts: 1,
            reason: format!("status {} code {}", status, error.code),
        },
        status => ProtocolError::Malformed(format!(
            "unexpected status {} for {}",
            status, operation
        )),
    }
}
