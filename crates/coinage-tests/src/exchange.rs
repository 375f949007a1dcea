//! In-process exchange
//!
//! [`ExchangeSim`] answers the client's requests the way an exchange would:
//! it checks every signature, keeps coin and reserve histories, refuses
//! overspending with a `409` and the history as proof, and signs its
//! confirmations with an online signing key certified by its master key.
//! Faults (soft database failures, latency, a forged signature) can be
//! injected to exercise the client's error paths.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use coinage_auditor::{DepositLedger, DepositQuery, ExchangeDeposit};
use coinage_client::wire::{
    AuditorDenomJson, AuditorJson, DenomJson, DepositRequestJson, DepositSuccessJson, EvSigJson,
    KeysResponse, LinkCoinJson, LinkSessionJson, MeltRequestJson, MeltSuccessJson, RecoupJson,
    RecoupRequestJson, RecoupSuccessJson, RevealRequestJson, RevealSuccessJson, SignKeyJson,
    WithdrawRequestJson, WithdrawSuccessJson,
};
use coinage_client::{
    CoinHistoryEntry, DenominationInfo, ErrorCode, HttpResponse, ReserveHistoryEntry,
    SigningKeyInfo, Transport, TransportError,
};
use coinage_core::codec::{
    DepositConfirmationPS, DepositRequestPS, ExchangeKeySetPS, LinkDataPS, MeltCommitmentPS,
    MeltConfirmationPS, RecoupConfirmationPS, RecoupRefreshConfirmationPS, RecoupRequestPS,
    SignedRecord, WithdrawRequestPS,
};
use coinage_core::{
    coin_message, verify_reveal, Amount, AuditorPrivateKey, BlindedSignature, CoinPublicKey,
    Currency, DenominationPrivateKey, DenominationPublicKey, EddsaPublicKey, EddsaSignature,
    ExchangePrivateKey, HashCode, HashContext, MasterPrivateKey, MasterPublicKey, RelativeTime,
    ReservePublicKey, RevealCheck, RsaSignature, Timestamp, KAPPA, PROTOCOL_VERSION,
};
use rand::rngs::OsRng;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Base URL the simulated exchange answers on
pub const EXCHANGE_URL: &str = "https://exchange.test/";

/// URL of the auditor that attests every simulated denomination
pub const AUDITOR_URL: &str = "https://auditor.test/";

/// Denomination values, in whole units, the exchange offers
pub const DENOMINATION_VALUES: [u64; 3] = [1, 2, 4];

const RSA_BITS: usize = 512;
const CENT: u32 = 1_000_000;

static RSA_KEYS: OnceLock<Vec<DenominationPrivateKey>> = OnceLock::new();

/// Denomination keys are slow to generate, so every simulator shares one set
fn rsa_keys() -> coinage_core::Result<&'static [DenominationPrivateKey]> {
    if let Some(keys) = RSA_KEYS.get() {
        return Ok(keys);
    }
    let mut rng = ChaCha20Rng::seed_from_u64(0xc014);
    let keys = DENOMINATION_VALUES
        .iter()
        .map(|_| DenominationPrivateKey::generate(&mut rng, RSA_BITS))
        .collect::<coinage_core::Result<Vec<_>>>()?;
    Ok(RSA_KEYS.get_or_init(|| keys))
}

type Reply<T = HttpResponse> = std::result::Result<T, HttpResponse>;

fn error_reply(status: u16, code: ErrorCode, hint: impl Into<String>) -> HttpResponse {
    HttpResponse::new(status, json!({ "code": code.as_u32(), "hint": hint.into() }))
}

fn internal(e: impl std::fmt::Display) -> HttpResponse {
    error_reply(500, ErrorCode::DbHardFailure, e.to_string())
}

fn ok<T: Serialize>(body: &T) -> Reply {
    serde_json::to_value(body)
        .map(|v| HttpResponse::new(200, v))
        .map_err(internal)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Value) -> Reply<T> {
    serde_json::from_value(body.clone())
        .map_err(|e| error_reply(400, ErrorCode::InvalidJson, e.to_string()))
}

fn conflict<T: Serialize>(code: ErrorCode, history: &[T]) -> Reply {
    let history = serde_json::to_value(history).map_err(internal)?;
    Ok(HttpResponse::new(
        409,
        json!({ "code": code.as_u32(), "hint": "conflict", "history": history }),
    ))
}

fn coin_key(segment: &str) -> Reply<EddsaPublicKey> {
    EddsaPublicKey::from_hex(segment)
        .map_err(|e| error_reply(400, ErrorCode::ParameterMalformed, e.to_string()))
}

/// Debits minus credits of a coin history
fn coin_spent(history: &[CoinHistoryEntry], currency: Currency) -> Reply<Amount> {
    let mut debits = Amount::zero(currency);
    let mut credits = Amount::zero(currency);
    for entry in history {
        match entry {
            CoinHistoryEntry::Deposit { amount, .. }
            | CoinHistoryEntry::Melt { amount, .. }
            | CoinHistoryEntry::Recoup { amount, .. }
            | CoinHistoryEntry::RecoupRefresh { amount, .. } => {
                debits = debits.checked_add(amount).map_err(internal)?;
            }
            CoinHistoryEntry::Refund {
                amount, refund_fee, ..
            } => {
                let net = amount.checked_sub(refund_fee).map_err(internal)?;
                credits = credits.checked_add(&net).map_err(internal)?;
            }
            CoinHistoryEntry::OldCoinRecoup { amount, .. } => {
                credits = credits.checked_add(amount).map_err(internal)?;
            }
        }
    }
    debits.checked_sub(&credits).map_err(internal)
}

fn entry_denomination(entry: &CoinHistoryEntry) -> Option<HashCode> {
    match entry {
        CoinHistoryEntry::Deposit { h_denom_pub, .. }
        | CoinHistoryEntry::Melt { h_denom_pub, .. } => Some(*h_denom_pub),
        _ => None,
    }
}

fn reserve_balance(history: &[ReserveHistoryEntry], currency: Currency) -> Reply<Amount> {
    let mut credits = Amount::zero(currency);
    let mut debits = Amount::zero(currency);
    for entry in history {
        match entry {
            ReserveHistoryEntry::Credit { amount, .. }
            | ReserveHistoryEntry::Recoup { amount, .. } => {
                credits = credits.checked_add(amount).map_err(internal)?;
            }
            ReserveHistoryEntry::Withdraw { amount, .. }
            | ReserveHistoryEntry::Closing { amount, .. } => {
                debits = debits.checked_add(amount).map_err(internal)?;
            }
        }
    }
    credits.checked_sub(&debits).map_err(internal)
}

struct SimDenomination {
    private: &'static DenominationPrivateKey,
    info: DenominationInfo,
}

struct MeltSession {
    old_coin_pub: CoinPublicKey,
    amount_with_fee: Amount,
    noreveal_index: u32,
    revealed: Option<Vec<BlindedSignature>>,
}

/// Where a signed envelope came from, for recoup
#[derive(Clone, Copy)]
enum Origin {
    Reserve(ReservePublicKey),
    Refresh(CoinPublicKey),
}

#[derive(Default)]
struct SimState {
    reserves: HashMap<ReservePublicKey, Vec<ReserveHistoryEntry>>,
    coins: HashMap<CoinPublicKey, Vec<CoinHistoryEntry>>,
    melts: HashMap<HashCode, MeltSession>,
    links: HashMap<CoinPublicKey, Vec<LinkSessionJson>>,
    envelopes: HashMap<HashCode, (Origin, BlindedSignature)>,
    deposits: Vec<ExchangeDeposit>,
    revoked: Vec<HashCode>,
    withheld: usize,
    keys_queries: Vec<Option<u64>>,
    soft_failures: u32,
    tamper_next: bool,
    delay: Option<Duration>,
    requests: u64,
}

/// A simulated exchange serving one currency
pub struct ExchangeSim {
    currency: Currency,
    master: MasterPrivateKey,
    signer: ExchangePrivateKey,
    auditor: AuditorPrivateKey,
    signkey: SigningKeyInfo,
    denoms: Vec<SimDenomination>,
    list_issue_date: Timestamp,
    state: Mutex<SimState>,
}

impl ExchangeSim {
    /// Exchange for `KUDOS` with fresh master, signing and auditor keys
    pub fn new() -> coinage_core::Result<Self> {
        let currency = Currency::new("KUDOS")?;
        let master = MasterPrivateKey::generate(&mut OsRng);
        let signer = ExchangePrivateKey::generate(&mut OsRng);
        let auditor = AuditorPrivateKey::generate(&mut OsRng);
        let master_pub = master.public_key();
        let now = Timestamp::now();
        let hour = RelativeTime::from_hours(1);

        let mut signkey = SigningKeyInfo {
            key: signer.public_key(),
            valid_from: now.saturating_sub(hour),
            valid_until: now.saturating_add(RelativeTime::from_hours(24 * 30)),
            valid_legal: now.saturating_add(RelativeTime::from_hours(24 * 365)),
            master_sig: EddsaSignature::new([0u8; 64]),
        };
        signkey.master_sig = signkey.validity_record(&master_pub).sign(&master);

        let fee = Amount::new(currency.as_str(), 0, CENT)?;
        let mut denoms = Vec::new();
        for (i, (private, value)) in rsa_keys()?.iter().zip(DENOMINATION_VALUES).enumerate() {
            let mut info = DenominationInfo {
                key: private.public_key().clone(),
                h_key: private.public_key().hash(),
                value: Amount::new(currency.as_str(), value, 0)?,
                fee_withdraw: fee,
                fee_deposit: fee,
                fee_refresh: fee,
                fee_refund: fee,
                // One second apart, in offering order
                valid_from: now
                    .saturating_sub(hour)
                    .saturating_add(RelativeTime::from_secs(i as u64)),
                withdraw_until: now.saturating_add(RelativeTime::from_hours(24 * 7)),
                expire_deposit: now.saturating_add(RelativeTime::from_hours(24 * 30)),
                expire_legal: now.saturating_add(RelativeTime::from_hours(24 * 365)),
                master_sig: EddsaSignature::new([0u8; 64]),
                revoked: false,
            };
            info.master_sig = info.validity_record(&master_pub).sign(&master);
            denoms.push(SimDenomination { private, info });
        }
        info!(
            "Simulated exchange up with master key {} and {} denominations",
            master_pub.short(),
            denoms.len()
        );

        Ok(Self {
            currency,
            master,
            signer,
            auditor,
            signkey,
            denoms,
            list_issue_date: now,
            state: Mutex::new(SimState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn master_public_key(&self) -> MasterPublicKey {
        self.master.public_key()
    }

    pub fn auditor_public_key(&self) -> EddsaPublicKey {
        self.auditor.public_key()
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Hash of the denomination worth `value` whole units
    pub fn denomination(&self, value: u64) -> Option<HashCode> {
        self.denoms
            .iter()
            .find(|d| d.info.value.value() == value && d.info.value.fraction() == 0)
            .map(|d| d.info.h_key)
    }

    /// Record an incoming wire transfer into `reserve_pub`
    pub fn fund_reserve(&self, reserve_pub: &ReservePublicKey, amount: Amount) {
        let mut state = self.state();
        let history = state.reserves.entry(*reserve_pub).or_default();
        history.push(ReserveHistoryEntry::Credit {
            amount,
            sender_account_url: "payto://iban/DE89370400440532013000".to_string(),
            wire_reference: format!("wire-{}", history.len() + 1),
            timestamp: Timestamp::now(),
        });
        debug!("Reserve {} credited with {}", reserve_pub.short(), amount);
    }

    /// Revoke a denomination; its coins become eligible for recoup
    pub fn revoke(&self, h_denom_pub: &HashCode) {
        let mut state = self.state();
        if !state.revoked.contains(h_denom_pub) {
            state.revoked.push(*h_denom_pub);
            warn!("Denomination {} revoked", h_denom_pub.short());
        }
    }

    /// Leave the newest `count` denominations out of `/keys` replies; 0 offers all
    pub fn withhold_newest(&self, count: usize) {
        self.state().withheld = count.min(self.denoms.len());
    }

    /// The `last_issue_date` (seconds) of every `/keys` request, `None` for full downloads
    pub fn keys_queries(&self) -> Vec<Option<u64>> {
        self.state().keys_queries.clone()
    }

    /// Answer the next `count` requests with a soft database failure
    pub fn fail_next(&self, count: u32) {
        self.state().soft_failures = count;
    }

    /// Delay every reply
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Replace the exchange signature in the next signed reply with garbage
    pub fn tamper_next_signature(&self) {
        self.state().tamper_next = true;
    }

    pub fn request_count(&self) -> u64 {
        self.state().requests
    }

    /// Deposits recorded so far, oldest first
    pub fn deposits(&self) -> Vec<ExchangeDeposit> {
        self.state().deposits.clone()
    }

    /// Drop the recorded deposit of `coin_pub` as a faulty exchange would
    pub fn forget_deposit(&self, coin_pub: &CoinPublicKey) -> bool {
        let mut state = self.state();
        let before = state.deposits.len();
        state.deposits.retain(|d| d.coin_pub != *coin_pub);
        state.deposits.len() != before
    }

    /// The coin's history as the exchange holds it
    pub fn coin_history(&self, coin_pub: &CoinPublicKey) -> Vec<CoinHistoryEntry> {
        self.state().coins.get(coin_pub).cloned().unwrap_or_default()
    }

    pub fn reserve_balance(&self, reserve_pub: &ReservePublicKey) -> Option<Amount> {
        let state = self.state();
        let history = state.reserves.get(reserve_pub)?;
        reserve_balance(history, self.currency).ok()
    }

    fn lookup(&self, h_denom_pub: &HashCode) -> Reply<&SimDenomination> {
        self.denoms
            .iter()
            .find(|d| d.info.h_key == *h_denom_pub)
            .ok_or_else(|| {
                error_reply(
                    404,
                    ErrorCode::DenominationKeyUnknown,
                    format!("denomination {} unknown", h_denom_pub.short()),
                )
            })
    }

    fn lookup_live(&self, state: &SimState, h_denom_pub: &HashCode) -> Reply<&SimDenomination> {
        let denom = self.lookup(h_denom_pub)?;
        if state.revoked.contains(h_denom_pub) {
            return Err(error_reply(
                410,
                ErrorCode::DenominationRevoked,
                format!("denomination {} revoked", h_denom_pub.short()),
            ));
        }
        Ok(denom)
    }

    fn check_coin(denom: &SimDenomination, coin_pub: &CoinPublicKey, sig: &RsaSignature) -> Reply<()> {
        denom
            .info
            .key
            .verify(&coin_message(coin_pub), sig)
            .map_err(|_| {
                error_reply(
                    403,
                    ErrorCode::DenominationSignatureInvalid,
                    "coin not signed by its denomination",
                )
            })
    }

    fn sign<R: SignedRecord>(&self, state: &mut SimState, record: &R) -> EddsaSignature {
        if std::mem::take(&mut state.tamper_next) {
            warn!("Forging exchange signature");
            return EddsaSignature::new([0u8; 64]);
        }
        record.sign(&self.signer)
    }

    /// Pre-dispatch faults; returns a reply when the request must fail
    async fn before_request(&self) -> Option<HttpResponse> {
        let delay = {
            let mut state = self.state();
            state.requests += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.soft_failures > 0 {
            state.soft_failures -= 1;
            return Some(error_reply(500, ErrorCode::DbSoftFailure, "serialization failure"));
        }
        None
    }

    /// Value of `name` in the query string, if present
    fn query_param<'a>(url: &'a str, name: &str) -> Option<&'a str> {
        let (_, query) = url.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    fn route(url: &str) -> Reply<Vec<String>> {
        let path = url.strip_prefix(EXCHANGE_URL).ok_or_else(|| {
            error_reply(404, ErrorCode::None, format!("not this exchange: {}", url))
        })?;
        let path = path.split('?').next().unwrap_or_default();
        Ok(path.split('/').map(str::to_string).collect())
    }

    /// `GET /keys`, restricted to denominations starting at or after `since`
    fn keys_reply(&self, since: Option<u64>) -> Reply {
        let master_pub = self.master.public_key();
        let (revoked, withheld) = {
            let mut state = self.state();
            state.keys_queries.push(since);
            (state.revoked.clone(), state.withheld)
        };
        let cutoff = Timestamp::from_secs(since.unwrap_or(0));
        let offered: Vec<&SimDenomination> = self.denoms[..self.denoms.len() - withheld]
            .iter()
            .filter(|d| d.info.valid_from >= cutoff)
            .collect();
        debug!(
            "Serving {} of {} denominations (since {:?})",
            offered.len(),
            self.denoms.len(),
            since
        );

        let mut hc = HashContext::new();
        for d in &offered {
            hc.update(d.info.h_key.as_bytes());
        }
        let eddsa_sig = ExchangeKeySetPS {
            list_issue_date: self.list_issue_date,
            hc: hc.finish(),
        }
        .sign(&self.signer);

        let response = KeysResponse {
            version: PROTOCOL_VERSION.to_string(),
            master_public_key: master_pub,
            list_issue_date: self.list_issue_date,
            reserve_closing_delay: RelativeTime::from_hours(24 * 28),
            signkeys: vec![SignKeyJson {
                key: self.signkey.key,
                master_sig: self.signkey.master_sig,
                stamp_start: self.signkey.valid_from,
                stamp_expire: self.signkey.valid_until,
                stamp_end: self.signkey.valid_legal,
            }],
            denoms: offered
                .iter()
                .map(|d| DenomJson {
                    master_sig: d.info.master_sig,
                    stamp_start: d.info.valid_from,
                    stamp_expire_withdraw: d.info.withdraw_until,
                    stamp_expire_deposit: d.info.expire_deposit,
                    stamp_expire_legal: d.info.expire_legal,
                    value: d.info.value,
                    fee_withdraw: d.info.fee_withdraw,
                    fee_deposit: d.info.fee_deposit,
                    fee_refresh: d.info.fee_refresh,
                    fee_refund: d.info.fee_refund,
                    denom_pub: d.info.key.clone(),
                })
                .collect(),
            auditors: vec![AuditorJson {
                auditor_pub: self.auditor.public_key(),
                auditor_url: AUDITOR_URL.to_string(),
                denomination_keys: offered
                    .iter()
                    .map(|d| AuditorDenomJson {
                        denom_pub_h: d.info.h_key,
                        auditor_sig: d
                            .info
                            .auditor_record(AUDITOR_URL, &master_pub)
                            .sign(&self.auditor),
                    })
                    .collect(),
            }],
            recoup: revoked
                .into_iter()
                .map(|h_denom_pub| RecoupJson { h_denom_pub })
                .collect(),
            eddsa_pub: Some(self.signer.public_key()),
            eddsa_sig: Some(eddsa_sig),
            expires: None,
        };
        let mut reply = ok(&response)?;
        reply.expires = Some(Timestamp::now().saturating_add(RelativeTime::from_hours(1)));
        Ok(reply)
    }

    fn withdraw(&self, reserve_pub: ReservePublicKey, body: &Value) -> Reply {
        let req: WithdrawRequestJson = parse_body(body)?;
        let mut state = self.state();
        let denom = self.lookup_live(&state, &req.denom_pub_hash)?;
        let amount_with_fee = denom
            .info
            .value
            .checked_add(&denom.info.fee_withdraw)
            .map_err(internal)?;
        let h_coin_envelope = req.coin_ev.hash();
        WithdrawRequestPS {
            reserve_pub,
            amount_with_fee,
            h_denom_pub: denom.info.h_key,
            h_coin_envelope,
        }
        .verify(&reserve_pub, &req.reserve_sig)
        .map_err(|_| {
            error_reply(403, ErrorCode::ReserveSignatureInvalid, "bad reserve signature")
        })?;

        if let Some((_, ev_sig)) = state.envelopes.get(&h_coin_envelope) {
            debug!("Replaying withdrawal of envelope {}", h_coin_envelope.short());
            return ok(&WithdrawSuccessJson {
                ev_sig: ev_sig.clone(),
            });
        }

        let history = state.reserves.get(&reserve_pub).ok_or_else(|| {
            error_reply(404, ErrorCode::None, format!("reserve {} unknown", reserve_pub.short()))
        })?;
        let balance = reserve_balance(history, self.currency)?;
        if balance < amount_with_fee {
            info!(
                "Reserve {} holds {}, withdrawal needs {}",
                reserve_pub.short(),
                balance,
                amount_with_fee
            );
            return conflict(ErrorCode::ReserveInsufficientFunds, history);
        }

        let ev_sig = denom.private.sign_blinded(&req.coin_ev).map_err(internal)?;
        let fee_withdraw = denom.info.fee_withdraw;
        let h_denom_pub = denom.info.h_key;
        if let Some(history) = state.reserves.get_mut(&reserve_pub) {
            history.push(ReserveHistoryEntry::Withdraw {
                amount: amount_with_fee,
                withdraw_fee: fee_withdraw,
                h_denom_pub,
                h_coin_envelope,
                reserve_sig: req.reserve_sig,
            });
        }
        state
            .envelopes
            .insert(h_coin_envelope, (Origin::Reserve(reserve_pub), ev_sig.clone()));
        ok(&WithdrawSuccessJson { ev_sig })
    }

    fn deposit(&self, coin_pub: CoinPublicKey, body: &Value) -> Reply {
        let req: DepositRequestJson = parse_body(body)?;
        let mut state = self.state();
        let denom = self.lookup_live(&state, &req.denom_pub_hash)?;
        Self::check_coin(denom, &coin_pub, &req.ub_sig)?;
        if req.wire.h_wire() != req.h_wire {
            return Err(error_reply(
                400,
                ErrorCode::ParameterMalformed,
                "wire details do not match h_wire",
            ));
        }
        DepositRequestPS {
            h_contract_terms: req.h_contract_terms,
            h_wire: req.h_wire,
            h_denom_pub: denom.info.h_key,
            wallet_timestamp: req.timestamp,
            refund_deadline: req.refund_deadline,
            amount_with_fee: req.contribution,
            deposit_fee: denom.info.fee_deposit,
            merchant: req.merchant_pub,
            coin_pub,
        }
        .verify(&coin_pub, &req.coin_sig)
        .map_err(|_| error_reply(403, ErrorCode::CoinSignatureInvalid, "bad deposit permission"))?;
        let amount_without_fee = req
            .contribution
            .checked_sub(&denom.info.fee_deposit)
            .map_err(|e| error_reply(400, ErrorCode::ParameterMalformed, e.to_string()))?;

        let history = state.coins.entry(coin_pub).or_default();
        if history
            .iter()
            .filter_map(entry_denomination)
            .any(|h| h != denom.info.h_key)
        {
            return conflict(ErrorCode::CoinConflictingDenomination, history);
        }
        let spent = coin_spent(history, self.currency)?;
        let total = spent.checked_add(&req.contribution).map_err(internal)?;
        if total > denom.info.value {
            info!(
                "Coin {} already spent {}, refusing deposit of {}",
                coin_pub.short(),
                spent,
                req.contribution
            );
            return conflict(ErrorCode::DepositInsufficientFunds, history);
        }
        history.push(CoinHistoryEntry::Deposit {
            amount: req.contribution,
            deposit_fee: denom.info.fee_deposit,
            h_contract_terms: req.h_contract_terms,
            h_wire: req.h_wire,
            h_denom_pub: denom.info.h_key,
            timestamp: req.timestamp,
            refund_deadline: req.refund_deadline,
            merchant_pub: req.merchant_pub,
            coin_sig: req.coin_sig,
        });

        let exchange_timestamp = Timestamp::now();
        state.deposits.push(ExchangeDeposit {
            coin_pub,
            h_contract_terms: req.h_contract_terms,
            merchant_pub: req.merchant_pub,
            h_wire: req.h_wire,
            refund_deadline: req.refund_deadline,
            exchange_timestamp,
            amount_with_fee: req.contribution,
        });
        let record = DepositConfirmationPS {
            h_contract_terms: req.h_contract_terms,
            h_wire: req.h_wire,
            exchange_timestamp,
            refund_deadline: req.refund_deadline,
            amount_without_fee,
            coin_pub,
            merchant: req.merchant_pub,
        };
        let exchange_sig = self.sign(&mut state, &record);
        ok(&DepositSuccessJson {
            exchange_sig,
            exchange_pub: self.signer.public_key(),
            exchange_timestamp,
        })
    }

    fn melt(&self, coin_pub: CoinPublicKey, body: &Value) -> Reply {
        let req: MeltRequestJson = parse_body(body)?;
        if req.coin_pub != coin_pub {
            return Err(error_reply(400, ErrorCode::ParameterMalformed, "coin_pub mismatch"));
        }
        let mut state = self.state();
        let denom = self.lookup_live(&state, &req.denom_pub_hash)?;
        Self::check_coin(denom, &coin_pub, &req.denom_sig)?;
        MeltCommitmentPS {
            rc: req.rc,
            h_denom_pub: denom.info.h_key,
            amount_with_fee: req.value_with_fee,
            melt_fee: denom.info.fee_refresh,
            coin_pub,
        }
        .verify(&coin_pub, &req.confirm_sig)
        .map_err(|_| error_reply(403, ErrorCode::CoinSignatureInvalid, "bad melt signature"))?;

        let known = state.melts.get(&req.rc).map(|s| s.noreveal_index);
        let noreveal_index = match known {
            Some(index) => {
                debug!("Melt {} seen before, same answer", req.rc.short());
                index
            }
            None => {
                let history = state.coins.entry(coin_pub).or_default();
                if history
                    .iter()
                    .filter_map(entry_denomination)
                    .any(|h| h != denom.info.h_key)
                {
                    return conflict(ErrorCode::CoinConflictingDenomination, history);
                }
                let spent = coin_spent(history, self.currency)?;
                let total = spent.checked_add(&req.value_with_fee).map_err(internal)?;
                if total > denom.info.value {
                    return conflict(ErrorCode::DepositInsufficientFunds, history);
                }
                history.push(CoinHistoryEntry::Melt {
                    amount: req.value_with_fee,
                    melt_fee: denom.info.fee_refresh,
                    rc: req.rc,
                    h_denom_pub: denom.info.h_key,
                    coin_sig: req.confirm_sig,
                });
                let noreveal_index = rand::thread_rng().gen_range(0..KAPPA as u32);
                state.melts.insert(
                    req.rc,
                    MeltSession {
                        old_coin_pub: coin_pub,
                        amount_with_fee: req.value_with_fee,
                        noreveal_index,
                        revealed: None,
                    },
                );
                noreveal_index
            }
        };

        let record = MeltConfirmationPS {
            rc: req.rc,
            noreveal_index,
        };
        let exchange_sig = self.sign(&mut state, &record);
        ok(&MeltSuccessJson {
            noreveal_index,
            exchange_sig,
            exchange_pub: self.signer.public_key(),
        })
    }

    fn reveal(&self, rc: HashCode, body: &Value) -> Reply {
        let req: RevealRequestJson = parse_body(body)?;
        let mut state = self.state();
        let (old_coin_pub, amount_with_fee, noreveal_index) = match state.melts.get(&rc) {
            Some(MeltSession {
                revealed: Some(ev_sigs),
                ..
            }) => {
                let ev_sigs = ev_sigs
                    .iter()
                    .map(|ev_sig| EvSigJson {
                        ev_sig: ev_sig.clone(),
                    })
                    .collect();
                return ok(&RevealSuccessJson { ev_sigs });
            }
            Some(session) => (
                session.old_coin_pub,
                session.amount_with_fee,
                session.noreveal_index,
            ),
            None => {
                return Err(error_reply(
                    404,
                    ErrorCode::RefreshSessionUnknown,
                    format!("no melt with commitment {}", rc.short()),
                ))
            }
        };

        let mut denoms = Vec::with_capacity(req.new_denoms_h.len());
        for h in &req.new_denoms_h {
            denoms.push(self.lookup_live(&state, h)?);
        }
        if req.coin_evs.len() != denoms.len() || req.link_sigs.len() != denoms.len() {
            return Err(error_reply(
                400,
                ErrorCode::ParameterMalformed,
                "envelope, signature and denomination counts differ",
            ));
        }
        let keys: Vec<DenominationPublicKey> = denoms.iter().map(|d| d.info.key.clone()).collect();
        verify_reveal(&RevealCheck {
            rc: &rc,
            old_coin_pub: &old_coin_pub,
            amount_with_fee: &amount_with_fee,
            noreveal_index,
            withheld_transfer_pub: &req.transfer_pub,
            transfer_privs: &req.transfer_privs,
            new_denoms: &keys,
            withheld_coin_evs: &req.coin_evs,
        })
        .map_err(|e| {
            warn!("Reveal of {} does not match the commitment: {}", rc.short(), e);
            error_reply(409, ErrorCode::RefreshCommitmentViolation, e.to_string())
        })?;

        let mut ev_sigs = Vec::with_capacity(denoms.len());
        let mut new_coins = Vec::with_capacity(denoms.len());
        for ((denom, coin_ev), link_sig) in denoms.iter().zip(&req.coin_evs).zip(&req.link_sigs) {
            LinkDataPS {
                old_coin_pub,
                h_denom_pub: denom.info.h_key,
                transfer_pub: req.transfer_pub,
                coin_envelope_hash: coin_ev.hash(),
            }
            .verify(&old_coin_pub, link_sig)
            .map_err(|_| error_reply(403, ErrorCode::CoinSignatureInvalid, "bad link signature"))?;
            let ev_sig = denom.private.sign_blinded(coin_ev).map_err(internal)?;
            new_coins.push(LinkCoinJson {
                denom_pub: denom.info.key.clone(),
                ev_sig: ev_sig.clone(),
                link_sig: *link_sig,
            });
            ev_sigs.push(ev_sig);
        }

        for (coin_ev, ev_sig) in req.coin_evs.iter().zip(&ev_sigs) {
            state
                .envelopes
                .insert(coin_ev.hash(), (Origin::Refresh(old_coin_pub), ev_sig.clone()));
        }
        state
            .links
            .entry(old_coin_pub)
            .or_default()
            .push(LinkSessionJson {
                transfer_pub: req.transfer_pub,
                new_coins,
            });
        if let Some(session) = state.melts.get_mut(&rc) {
            session.revealed = Some(ev_sigs.clone());
        }
        info!("Refresh {} revealed, {} fresh coins", rc.short(), ev_sigs.len());
        ok(&RevealSuccessJson {
            ev_sigs: ev_sigs
                .into_iter()
                .map(|ev_sig| EvSigJson { ev_sig })
                .collect(),
        })
    }

    fn link(&self, coin_pub: CoinPublicKey) -> Reply {
        match self.state().links.get(&coin_pub) {
            Some(sessions) => ok(sessions),
            None => Err(error_reply(
                404,
                ErrorCode::LinkCoinUnknown,
                format!("coin {} was never refreshed", coin_pub.short()),
            )),
        }
    }

    fn recoup(&self, coin_pub: CoinPublicKey, body: &Value) -> Reply {
        let req: RecoupRequestJson = parse_body(body)?;
        let denom = self.lookup(&req.denom_pub_hash)?;
        let mut state = self.state();
        if !state.revoked.contains(&denom.info.h_key) {
            return Err(error_reply(
                404,
                ErrorCode::RecoupNotEligible,
                "denomination not revoked",
            ));
        }
        Self::check_coin(denom, &coin_pub, &req.denom_sig)?;
        RecoupRequestPS {
            coin_pub,
            h_denom_pub: denom.info.h_key,
            coin_blind: req.coin_blind_key_secret.clone(),
        }
        .verify(&coin_pub, &req.coin_sig)
        .map_err(|_| error_reply(403, ErrorCode::CoinSignatureInvalid, "bad recoup signature"))?;

        let coin_ev = denom
            .info
            .key
            .blind(&coin_message(&coin_pub), &req.coin_blind_key_secret)
            .map_err(internal)?;
        let origin = match state.envelopes.get(&coin_ev.hash()) {
            Some((origin, _)) => *origin,
            None => {
                return Err(error_reply(
                    404,
                    ErrorCode::RecoupNotEligible,
                    "coin was never signed by this exchange",
                ))
            }
        };
        let refreshed = matches!(origin, Origin::Refresh(_));
        if refreshed != req.refreshed {
            return Err(error_reply(
                400,
                ErrorCode::RecoupRefreshedMismatch,
                format!("coin refreshed: {}", refreshed),
            ));
        }

        let history = state.coins.entry(coin_pub).or_default();
        let spent = coin_spent(history, self.currency)?;
        let remaining = denom.info.value.checked_sub(&spent).map_err(internal)?;
        if remaining.is_zero() {
            return conflict(ErrorCode::DepositInsufficientFunds, history);
        }

        let timestamp = Timestamp::now();
        let exchange_pub = self.signer.public_key();
        let reply = match origin {
            Origin::Reserve(reserve_pub) => {
                let record = RecoupConfirmationPS {
                    timestamp,
                    recoup_amount: remaining,
                    coin_pub,
                    reserve_pub,
                };
                let exchange_sig = self.sign(&mut state, &record);
                state
                    .coins
                    .entry(coin_pub)
                    .or_default()
                    .push(CoinHistoryEntry::Recoup {
                        amount: remaining,
                        timestamp,
                        reserve_pub,
                        exchange_pub,
                        exchange_sig,
                    });
                state
                    .reserves
                    .entry(reserve_pub)
                    .or_default()
                    .push(ReserveHistoryEntry::Recoup {
                        amount: remaining,
                        timestamp,
                        coin_pub,
                        exchange_pub,
                        exchange_sig,
                    });
                RecoupSuccessJson {
                    refreshed,
                    reserve_pub: Some(reserve_pub),
                    old_coin_pub: None,
                    exchange_sig,
                    exchange_pub,
                    timestamp,
                    amount: remaining,
                }
            }
            Origin::Refresh(old_coin_pub) => {
                let record = RecoupRefreshConfirmationPS {
                    timestamp,
                    recoup_amount: remaining,
                    coin_pub,
                    old_coin_pub,
                };
                let exchange_sig = self.sign(&mut state, &record);
                state
                    .coins
                    .entry(coin_pub)
                    .or_default()
                    .push(CoinHistoryEntry::RecoupRefresh {
                        amount: remaining,
                        timestamp,
                        old_coin_pub,
                        exchange_pub,
                        exchange_sig,
                    });
                state
                    .coins
                    .entry(old_coin_pub)
                    .or_default()
                    .push(CoinHistoryEntry::OldCoinRecoup {
                        amount: remaining,
                        timestamp,
                        coin_pub,
                        exchange_pub,
                        exchange_sig,
                    });
                RecoupSuccessJson {
                    refreshed,
                    reserve_pub: None,
                    old_coin_pub: Some(old_coin_pub),
                    exchange_sig,
                    exchange_pub,
                    timestamp,
                    amount: remaining,
                }
            }
        };
        info!("Recouped {} from coin {}", remaining, coin_pub.short());
        ok(&reply)
    }

    fn dispatch_get(&self, url: &str) -> Reply {
        let segments = Self::route(url)?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        match segments.as_slice() {
            ["keys"] => {
                let since = Self::query_param(url, "last_issue_date")
                    .map(|v| {
                        v.parse::<u64>().map_err(|e| {
                            error_reply(400, ErrorCode::ParameterMalformed, e.to_string())
                        })
                    })
                    .transpose()?;
                self.keys_reply(since)
            }
            ["coins", coin, "link"] => self.link(coin_key(coin)?),
            _ => Err(error_reply(404, ErrorCode::None, format!("no route for GET {}", url))),
        }
    }

    fn dispatch_post(&self, url: &str, body: &Value) -> Reply {
        let segments = Self::route(url)?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        match segments.as_slice() {
            ["reserves", reserve, "withdraw"] => self.withdraw(coin_key(reserve)?, body),
            ["coins", coin, "deposit"] => self.deposit(coin_key(coin)?, body),
            ["coins", coin, "melt"] => self.melt(coin_key(coin)?, body),
            ["coins", coin, "recoup"] => self.recoup(coin_key(coin)?, body),
            ["refreshes", rc, "reveal"] => {
                let rc = HashCode::from_hex(rc)
                    .map_err(|e| error_reply(400, ErrorCode::ParameterMalformed, e.to_string()))?;
                self.reveal(rc, body)
            }
            _ => Err(error_reply(404, ErrorCode::None, format!("no route for POST {}", url))),
        }
    }
}

#[async_trait]
impl Transport for ExchangeSim {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        if let Some(failure) = self.before_request().await {
            return Ok(failure);
        }
        debug!("GET {}", url);
        Ok(self.dispatch_get(url).unwrap_or_else(|reply| reply))
    }

    async fn post(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        if let Some(failure) = self.before_request().await {
            return Ok(failure);
        }
        debug!("POST {}", url);
        Ok(self.dispatch_post(url, body).unwrap_or_else(|reply| reply))
    }
}

impl DepositLedger for ExchangeSim {
    fn find_deposit(&self, query: &DepositQuery) -> coinage_auditor::Result<Option<ExchangeDeposit>> {
        Ok(self
            .state()
            .deposits
            .iter()
            .find(|d| query.matches(d))
            .cloned())
    }
}
