//! Exchange key set: denominations, signing keys, auditors, revocations
//!
//! A key set only ever grows. Each `/keys` download is merged into a new
//! [`KeySet`] value; keys omitted by later downloads stay known. A merge
//! either verifies and applies the whole response or fails without
//! touching anything.

use std::collections::HashSet;

use coinage_core::codec::{
    AuditorDenomPS, DenomKeyValidityPS, ExchangeKeySetPS, SignKeyValidityPS, SignedRecord,
};
use coinage_core::{
    Amount, AuditorPublicKey, Currency, DenominationPublicKey, EddsaSignature, ExchangePublicKey,
    HashCode, HashContext, MasterPublicKey, RelativeTime, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{ProtocolError, Result};
use crate::version::check_version;
use crate::wire::{
    parse, AuditorDenomJson, AuditorJson, DenomJson, KeysResponse, RecoupJson, SignKeyJson,
};

/// Slack applied on both ends of a signing key's validity window
pub const SIGNING_KEY_GRACE: RelativeTime = RelativeTime::from_hours(1);

/// A denomination with its fee structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenominationInfo {
    pub key: DenominationPublicKey,
    pub h_key: HashCode,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub fee_deposit: Amount,
    pub fee_refresh: Amount,
    pub fee_refund: Amount,
    pub valid_from: Timestamp,
    pub withdraw_until: Timestamp,
    pub expire_deposit: Timestamp,
    pub expire_legal: Timestamp,
    pub master_sig: EddsaSignature,
    pub revoked: bool,
}

impl DenominationInfo {
    fn from_json(d: &DenomJson) -> Self {
        Self {
            h_key: d.denom_pub.hash(),
            key: d.denom_pub.clone(),
            value: d.value,
            fee_withdraw: d.fee_withdraw,
            fee_deposit: d.fee_deposit,
            fee_refresh: d.fee_refresh,
            fee_refund: d.fee_refund,
            valid_from: d.stamp_start,
            withdraw_until: d.stamp_expire_withdraw,
            expire_deposit: d.stamp_expire_deposit,
            expire_legal: d.stamp_expire_legal,
            master_sig: d.master_sig,
            revoked: false,
        }
    }

    fn to_json(&self) -> DenomJson {
        DenomJson {
            master_sig: self.master_sig,
            stamp_start: self.valid_from,
            stamp_expire_withdraw: self.withdraw_until,
            stamp_expire_deposit: self.expire_deposit,
            stamp_expire_legal: self.expire_legal,
            value: self.value,
            fee_withdraw: self.fee_withdraw,
            fee_deposit: self.fee_deposit,
            fee_refresh: self.fee_refresh,
            fee_refund: self.fee_refund,
            denom_pub: self.key.clone(),
        }
    }

    /// Field-for-field equality ignoring `revoked`
    pub fn same_key(&self, other: &DenominationInfo) -> bool {
        Self {
            revoked: false,
            ..self.clone()
        } == Self {
            revoked: false,
            ..other.clone()
        }
    }

    /// The record the master key signs for this denomination
    pub fn validity_record(&self, master: &MasterPublicKey) -> DenomKeyValidityPS {
        DenomKeyValidityPS {
            master: *master,
            start: self.valid_from,
            expire_withdraw: self.withdraw_until,
            expire_deposit: self.expire_deposit,
            expire_legal: self.expire_legal,
            value: self.value,
            fee_withdraw: self.fee_withdraw,
            fee_deposit: self.fee_deposit,
            fee_refresh: self.fee_refresh,
            fee_refund: self.fee_refund,
            denom_hash: self.h_key,
        }
    }

    /// The record an auditor signs for this denomination
    pub fn auditor_record(&self, auditor_url: &str, master: &MasterPublicKey) -> AuditorDenomPS {
        AuditorDenomPS {
            auditor_url_hash: HashCode::of(auditor_url.as_bytes()),
            master: *master,
            start: self.valid_from,
            expire_withdraw: self.withdraw_until,
            expire_deposit: self.expire_deposit,
            expire_legal: self.expire_legal,
            value: self.value,
            fee_withdraw: self.fee_withdraw,
            fee_deposit: self.fee_deposit,
            fee_refresh: self.fee_refresh,
            fee_refund: self.fee_refund,
            denom_hash: self.h_key,
        }
    }

    pub fn can_withdraw(&self, at: Timestamp) -> bool {
        !self.revoked && at >= self.valid_from && at < self.withdraw_until
    }

    pub fn can_deposit(&self, at: Timestamp) -> bool {
        !self.revoked && at >= self.valid_from && at < self.expire_deposit
    }
}

/// An online signing key of the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeyInfo {
    pub key: ExchangePublicKey,
    pub valid_from: Timestamp,
    pub valid_until: Timestamp,
    pub valid_legal: Timestamp,
    pub master_sig: EddsaSignature,
}

impl SigningKeyInfo {
    fn from_json(s: &SignKeyJson) -> Self {
        Self {
            key: s.key,
            valid_from: s.stamp_start,
            valid_until: s.stamp_expire,
            valid_legal: s.stamp_end,
            master_sig: s.master_sig,
        }
    }

    fn to_json(&self) -> SignKeyJson {
        SignKeyJson {
            key: self.key,
            master_sig: self.master_sig,
            stamp_start: self.valid_from,
            stamp_expire: self.valid_until,
            stamp_end: self.valid_legal,
        }
    }

    pub fn validity_record(&self, master: &MasterPublicKey) -> SignKeyValidityPS {
        SignKeyValidityPS {
            master_public_key: *master,
            start: self.valid_from,
            expire: self.valid_until,
            end: self.valid_legal,
            signkey_pub: self.key,
        }
    }
}

/// One auditor signature on one denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditorAttestation {
    pub h_denom_pub: HashCode,
    pub auditor_sig: EddsaSignature,
}

/// An auditor and everything it has attested so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditorInfo {
    pub auditor_pub: AuditorPublicKey,
    pub auditor_url: String,
    pub attestations: Vec<AuditorAttestation>,
}

impl AuditorInfo {
    pub fn attests(&self, h_denom_pub: &HashCode) -> bool {
        self.attestations
            .iter()
            .any(|a| a.h_denom_pub == *h_denom_pub)
    }
}

/// Everything known about an exchange's keys
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeySet {
    pub master_public_key: Option<MasterPublicKey>,
    pub list_issue_date: Timestamp,
    pub last_denom_issue_date: Timestamp,
    pub reserve_closing_delay: RelativeTime,
    pub denominations: Vec<DenominationInfo>,
    pub signing_keys: Vec<SigningKeyInfo>,
    pub auditors: Vec<AuditorInfo>,
    pub expires: Timestamp,
}

impl KeySet {
    /// An empty set that will accept only `master` as the master key
    pub fn with_master(master: Option<MasterPublicKey>) -> Self {
        Self {
            master_public_key: master,
            ..Default::default()
        }
    }

    /// Merge a raw `/keys` response into a new key set
    pub fn merge(&self, raw: &Value, verify_signatures: bool) -> Result<KeySet> {
        let response: KeysResponse = parse(raw, "key set")?;
        let compat = check_version(&response.version)?;
        if !compat.is_compatible() {
            return Err(ProtocolError::Malformed(format!(
                "exchange version {} is {:?}",
                response.version, compat
            )));
        }

        let master = response.master_public_key;
        if let Some(known) = &self.master_public_key {
            if *known != master {
                error!("Exchange master key changed from {}", known.short());
                return Err(ProtocolError::Malformed(
                    "master public key differs from the known one".to_string(),
                ));
            }
        }

        let new_denoms: Vec<DenominationInfo> =
            response.denoms.iter().map(DenominationInfo::from_json).collect();
        let new_signkeys: Vec<SigningKeyInfo> =
            response.signkeys.iter().map(SigningKeyInfo::from_json).collect();

        if verify_signatures {
            self.verify_response(&response, &master, &new_denoms, &new_signkeys)?;
        }

        let mut merged = self.clone();
        merged.master_public_key = Some(master);
        merged.list_issue_date = response.list_issue_date;
        merged.reserve_closing_delay = response.reserve_closing_delay;
        if let Some(expires) = response.expires {
            merged.expires = expires;
        }

        for denom in new_denoms {
            merged.last_denom_issue_date = merged.last_denom_issue_date.max(denom.valid_from);
            match merged.denomination(&denom.h_key) {
                Some(existing) if existing.same_key(&denom) => {}
                Some(_) => {
                    return Err(ProtocolError::Malformed(format!(
                        "denomination {} changed its details",
                        denom.h_key.short()
                    )))
                }
                None => merged.denominations.push(denom),
            }
        }

        for signkey in new_signkeys {
            match merged.signing_key(&signkey.key) {
                Some(existing) if *existing == signkey => {}
                Some(_) => {
                    return Err(ProtocolError::Malformed(format!(
                        "signing key {} changed its details",
                        signkey.key.short()
                    )))
                }
                None => merged.signing_keys.push(signkey),
            }
        }

        for auditor in &response.auditors {
            merged.merge_auditor(auditor)?;
        }

        let revoked: Vec<HashCode> = response.recoup.iter().map(|r| r.h_denom_pub).collect();
        merged.apply_revocations(&revoked);

        debug!(
            "Merged key set: {} denominations, {} signing keys, {} auditors",
            merged.denominations.len(),
            merged.signing_keys.len(),
            merged.auditors.len()
        );
        Ok(merged)
    }

    fn verify_response(
        &self,
        response: &KeysResponse,
        master: &MasterPublicKey,
        new_denoms: &[DenominationInfo],
        new_signkeys: &[SigningKeyInfo],
    ) -> Result<()> {
        for signkey in new_signkeys {
            signkey
                .validity_record(master)
                .verify(master, &signkey.master_sig)
                .map_err(|_| {
                    error!("Master signature on signing key {} is invalid", signkey.key.short());
                    ProtocolError::Malformed(format!(
                        "bad master signature on signing key {}",
                        signkey.key.short()
                    ))
                })?;
        }

        let mut hc = HashContext::new();
        for denom in new_denoms {
            denom
                .validity_record(master)
                .verify(master, &denom.master_sig)
                .map_err(|_| {
                    error!("Master signature on denomination {} is invalid", denom.h_key.short());
                    ProtocolError::Malformed(format!(
                        "bad master signature on denomination {}",
                        denom.h_key.short()
                    ))
                })?;
            hc.update(denom.h_key.as_bytes());
        }

        for auditor in &response.auditors {
            for attestation in &auditor.denomination_keys {
                let denom = new_denoms
                    .iter()
                    .find(|d| d.h_key == attestation.denom_pub_h)
                    .or_else(|| self.denomination(&attestation.denom_pub_h));
                let Some(denom) = denom else {
                    continue;
                };
                denom
                    .auditor_record(&auditor.auditor_url, master)
                    .verify(&auditor.auditor_pub, &attestation.auditor_sig)
                    .map_err(|_| {
                        ProtocolError::Malformed(format!(
                            "bad signature of auditor {} on denomination {}",
                            auditor.auditor_url,
                            denom.h_key.short()
                        ))
                    })?;
            }
        }

        let (exchange_pub, exchange_sig) = match (&response.eddsa_pub, &response.eddsa_sig) {
            (Some(key), Some(sig)) => (key, sig),
            _ => {
                return Err(ProtocolError::Malformed(
                    "key set is not signed".to_string(),
                ))
            }
        };
        let listed = new_signkeys.iter().any(|s| s.key == *exchange_pub)
            || self.signing_key(exchange_pub).is_some();
        if !listed {
            return Err(ProtocolError::Malformed(format!(
                "key set signed by unlisted key {}",
                exchange_pub.short()
            )));
        }
        ExchangeKeySetPS {
            list_issue_date: response.list_issue_date,
            hc: hc.finish(),
        }
        .verify(exchange_pub, exchange_sig)
        .map_err(|_| {
            error!("Exchange signature over the key set is invalid");
            ProtocolError::Malformed("bad exchange signature over the key set".to_string())
        })
    }

    fn merge_auditor(&mut self, auditor: &AuditorJson) -> Result<()> {
        let known: HashSet<HashCode> = self.denominations.iter().map(|d| d.h_key).collect();
        let attestations = auditor
            .denomination_keys
            .iter()
            .filter(|a| {
                let ok = known.contains(&a.denom_pub_h);
                if !ok {
                    warn!(
                        "Auditor {} attests unknown denomination {}, ignoring",
                        auditor.auditor_url,
                        a.denom_pub_h.short()
                    );
                }
                ok
            })
            .map(|a| AuditorAttestation {
                h_denom_pub: a.denom_pub_h,
                auditor_sig: a.auditor_sig,
            });

        let index = match self
            .auditors
            .iter()
            .position(|a| a.auditor_pub == auditor.auditor_pub)
        {
            Some(index) => {
                if self.auditors[index].auditor_url != auditor.auditor_url {
                    return Err(ProtocolError::Malformed(format!(
                        "auditor {} changed its URL",
                        auditor.auditor_pub.short()
                    )));
                }
                index
            }
            None => {
                self.auditors.push(AuditorInfo {
                    auditor_pub: auditor.auditor_pub,
                    auditor_url: auditor.auditor_url.clone(),
                    attestations: Vec::new(),
                });
                self.auditors.len() - 1
            }
        };
        let entry = &mut self.auditors[index];
        for attestation in attestations {
            if !entry.attests(&attestation.h_denom_pub) {
                entry.attestations.push(attestation);
            }
        }
        Ok(())
    }

    /// Fail with `Malformed` unless every denomination value and fee is in `currency`
    pub fn check_currency(&self, currency: Currency) -> Result<()> {
        for denom in &self.denominations {
            let amounts = [
                denom.value,
                denom.fee_withdraw,
                denom.fee_deposit,
                denom.fee_refresh,
                denom.fee_refund,
            ];
            if let Some(foreign) = amounts.iter().find(|a| a.currency() != currency) {
                error!(
                    "Denomination {} is in {}, expected {}",
                    denom.h_key.short(),
                    foreign.currency(),
                    currency
                );
                return Err(ProtocolError::Malformed(format!(
                    "denomination {} uses currency {} instead of {}",
                    denom.h_key.short(),
                    foreign.currency(),
                    currency
                )));
            }
        }
        Ok(())
    }

    /// Mark listed denominations revoked; unknown hashes are ignored
    pub fn apply_revocations(&mut self, hashes: &[HashCode]) {
        for h in hashes {
            match self.denominations.iter_mut().find(|d| d.h_key == *h) {
                Some(denom) => {
                    if !denom.revoked {
                        warn!("Denomination {} has been revoked", h.short());
                    }
                    denom.revoked = true;
                }
                None => debug!("Ignoring revocation of unknown denomination {}", h.short()),
            }
        }
    }

    pub fn denomination(&self, h_key: &HashCode) -> Option<&DenominationInfo> {
        self.denominations.iter().find(|d| d.h_key == *h_key)
    }

    /// Withdrawable denomination of exactly `value`, newest first
    pub fn find_denomination_by_value(
        &self,
        value: &Amount,
        at: Timestamp,
    ) -> Option<&DenominationInfo> {
        self.denominations
            .iter()
            .filter(|d| d.value == *value && d.can_withdraw(at))
            .max_by_key(|d| d.valid_from)
    }

    pub fn signing_key(&self, key: &ExchangePublicKey) -> Option<&SigningKeyInfo> {
        self.signing_keys.iter().find(|s| s.key == *key)
    }

    /// Listed and within its validity window, one hour of slack on each side
    pub fn is_current_signing_key(&self, key: &ExchangePublicKey, at: Timestamp) -> bool {
        self.signing_key(key).is_some_and(|s| {
            at >= s.valid_from.saturating_sub(SIGNING_KEY_GRACE)
                && at <= s.valid_until.saturating_add(SIGNING_KEY_GRACE)
        })
    }

    /// Auditors that have attested `h_denom_pub`
    pub fn auditors_for(&self, h_denom_pub: &HashCode) -> Vec<&AuditorInfo> {
        self.auditors
            .iter()
            .filter(|a| a.attests(h_denom_pub))
            .collect()
    }

    /// True once the cache lifetime minus `margin` has passed
    pub fn needs_refresh(&self, now: Timestamp, margin: RelativeTime) -> bool {
        self.expires.saturating_sub(margin) <= now
    }

    /// Serialize as an unsigned `/keys` document with an `expires` field
    pub fn to_cache(&self) -> Result<Value> {
        let master = self.master_public_key.ok_or_else(|| {
            ProtocolError::CallerError("cannot cache a key set without master key".to_string())
        })?;
        let response = KeysResponse {
            version: coinage_core::PROTOCOL_VERSION.to_string(),
            master_public_key: master,
            list_issue_date: self.list_issue_date,
            reserve_closing_delay: self.reserve_closing_delay,
            signkeys: self.signing_keys.iter().map(SigningKeyInfo::to_json).collect(),
            denoms: self.denominations.iter().map(DenominationInfo::to_json).collect(),
            auditors: self
                .auditors
                .iter()
                .map(|a| AuditorJson {
                    auditor_pub: a.auditor_pub,
                    auditor_url: a.auditor_url.clone(),
                    denomination_keys: a
                        .attestations
                        .iter()
                        .map(|att| AuditorDenomJson {
                            denom_pub_h: att.h_denom_pub,
                            auditor_sig: att.auditor_sig,
                        })
                        .collect(),
                })
                .collect(),
            recoup: self
                .denominations
                .iter()
                .filter(|d| d.revoked)
                .map(|d| RecoupJson {
                    h_denom_pub: d.h_key,
                })
                .collect(),
            eddsa_pub: None,
            eddsa_sig: None,
            expires: Some(self.expires),
        };
        Ok(serde_json::to_value(response)?)
    }

    /// Rebuild a key set from [`KeySet::to_cache`] output without checking signatures
    pub fn from_cache(master: Option<MasterPublicKey>, cached: &Value) -> Result<KeySet> {
        KeySet::with_master(master).merge(cached, false)
    }
}
