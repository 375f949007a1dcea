//! Signed key-set fixtures for unit tests

use std::sync::OnceLock;

use coinage_core::codec::{ExchangeKeySetPS, SignedRecord};
use coinage_core::{
    Amount, AuditorPrivateKey, DenominationPrivateKey, ExchangePrivateKey, HashContext,
    MasterPrivateKey, RelativeTime, Timestamp,
};
use rand::rngs::OsRng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::Value;

use crate::keys::{DenominationInfo, SigningKeyInfo};
use crate::wire::{AuditorDenomJson, AuditorJson, DenomJson, KeysResponse, SignKeyJson};

pub const AUDITOR_URL: &str = "https://auditor.test/";

fn rsa_keys() -> &'static Vec<DenominationPrivateKey> {
    static KEYS: OnceLock<Vec<DenominationPrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = ChaCha20Rng::seed_from_u64(0x5eed);
        (0..3)
            .map(|_| DenominationPrivateKey::generate(&mut rng, 512).unwrap())
            .collect()
    })
}

pub fn kudos(s: &str) -> Amount {
    format!("KUDOS:{}", s).parse().unwrap()
}

/// A master key, one signing key, one auditor, and up to three denominations
pub struct KeyFixture {
    pub master: MasterPrivateKey,
    pub signer: ExchangePrivateKey,
    pub auditor: AuditorPrivateKey,
    pub now: Timestamp,
    pub denoms: Vec<DenominationInfo>,
    pub signkey: SigningKeyInfo,
    kept: Vec<usize>,
}

impl KeyFixture {
    pub fn new(count: usize) -> Self {
        let master = MasterPrivateKey::generate(&mut OsRng);
        let signer = ExchangePrivateKey::generate(&mut OsRng);
        let auditor = AuditorPrivateKey::generate(&mut OsRng);
        let now = Timestamp::from_secs(1_700_000_000);
        let day = RelativeTime::from_hours(24);
        let master_pub = master.public_key();

        let denoms = rsa_keys()
            .iter()
            .take(count)
            .enumerate()
            .map(|(i, key)| {
                let mut info = DenominationInfo {
                    key: key.public_key().clone(),
                    h_key: key.public_key().hash(),
                    value: kudos(&(i + 1).to_string()),
                    fee_withdraw: kudos("0.01"),
                    fee_deposit: kudos("0.01"),
                    fee_refresh: kudos("0.01"),
                    fee_refund: kudos("0.01"),
                    valid_from: now
                        .saturating_sub(day)
                        .saturating_add(RelativeTime::from_secs(i as u64)),
                    withdraw_until: now.saturating_add(RelativeTime::from_hours(24 * 30)),
                    expire_deposit: now.saturating_add(RelativeTime::from_hours(24 * 60)),
                    expire_legal: now.saturating_add(RelativeTime::from_hours(24 * 365)),
                    master_sig: coinage_core::EddsaSignature::new([0u8; 64]),
                    revoked: false,
                };
                info.master_sig = info.validity_record(&master_pub).sign(&master);
                info
            })
            .collect();

        let mut signkey = SigningKeyInfo {
            key: signer.public_key(),
            valid_from: now.saturating_sub(day),
            valid_until: now.saturating_add(RelativeTime::from_hours(24 * 30)),
            valid_legal: now.saturating_add(RelativeTime::from_hours(24 * 365)),
            master_sig: coinage_core::EddsaSignature::new([0u8; 64]),
        };
        signkey.master_sig = signkey.validity_record(&master_pub).sign(&master);

        Self {
            master,
            signer,
            auditor,
            now,
            denoms,
            signkey,
            kept: (0..count).collect(),
        }
    }

    pub fn denom_priv(&self, index: usize) -> &'static DenominationPrivateKey {
        &rsa_keys()[index]
    }

    /// Restrict later responses to the given denominations
    pub fn keep_denoms(&mut self, indices: &[usize]) {
        self.kept = indices.to_vec();
    }

    pub fn response(&self) -> Value {
        let master_pub = self.master.public_key();
        let denoms: Vec<&DenominationInfo> = self.kept.iter().map(|i| &self.denoms[*i]).collect();

        let mut hc = HashContext::new();
        for d in &denoms {
            hc.update(d.h_key.as_bytes());
        }
        let list_issue_date = self.now;
        let key_set_sig = ExchangeKeySetPS {
            list_issue_date,
            hc: hc.finish(),
        }
        .sign(&self.signer);

        let response = KeysResponse {
            version: "9:0:0".to_string(),
            master_public_key: master_pub,
            list_issue_date,
            reserve_closing_delay: RelativeTime::from_hours(24 * 28),
            signkeys: vec![SignKeyJson {
                key: self.signkey.key,
                master_sig: self.signkey.master_sig,
                stamp_start: self.signkey.valid_from,
                stamp_expire: self.signkey.valid_until,
                stamp_end: self.signkey.valid_legal,
            }],
            denoms: denoms
                .iter()
                .map(|d| DenomJson {
                    master_sig: d.master_sig,
                    stamp_start: d.valid_from,
                    stamp_expire_withdraw: d.withdraw_until,
                    stamp_expire_deposit: d.expire_deposit,
                    stamp_expire_legal: d.expire_legal,
                    value: d.value,
                    fee_withdraw: d.fee_withdraw,
                    fee_deposit: d.fee_deposit,
                    fee_refresh: d.fee_refresh,
                    fee_refund: d.fee_refund,
                    denom_pub: d.key.clone(),
                })
                .collect(),
            auditors: vec![AuditorJson {
                auditor_pub: self.auditor.public_key(),
                auditor_url: AUDITOR_URL.to_string(),
                denomination_keys: denoms
                    .iter()
                    .map(|d| AuditorDenomJson {
                        denom_pub_h: d.h_key,
                        auditor_sig: d.auditor_record(AUDITOR_URL, &master_pub).sign(&self.auditor),
                    })
                    .collect(),
            }],
            recoup: Vec::new(),
            eddsa_pub: Some(self.signer.public_key()),
            eddsa_sig: Some(key_set_sig),
            expires: None,
        };
        serde_json::to_value(response).unwrap()
    }
}
