//! Recoup: reclaiming the value of coins of a revoked denomination

use coinage_core::codec::{
    RecoupConfirmationPS, RecoupRefreshConfirmationPS, RecoupRequestPS, SignedRecord,
};
use coinage_core::{
    Amount, BlindingKeySecret, Coin, CoinPrivateKey, CoinPublicKey, EddsaSignature,
    ExchangePublicKey, HashCode, ReservePublicKey, Timestamp,
};
use tracing::{debug, error};

use crate::error::{ProtocolError, Result};
use crate::history::verify_double_spending_proof;
use crate::keys::KeySet;
use crate::transport::HttpResponse;
use crate::wire::{parse, unexpected_reply, RecoupRequestJson, RecoupSuccessJson};

/// A signed recoup request
#[derive(Debug, Clone)]
pub struct PreparedRecoup {
    pub request: RecoupRequestJson,
    pub coin_pub: CoinPublicKey,
    pub h_denom_pub: HashCode,
    pub was_refreshed: bool,
}

impl PreparedRecoup {
    pub fn path(&self) -> String {
        format!("coins/{}/recoup", self.coin_pub.to_hex())
    }
}

/// Sign a recoup request binding the coin to its denomination and blinding key
pub fn build_recoup_request(
    keys: &KeySet,
    coin: &Coin,
    coin_priv: &CoinPrivateKey,
    blinding_key: &BlindingKeySecret,
    was_refreshed: bool,
) -> Result<PreparedRecoup> {
    if coin_priv.public_key() != coin.coin_pub {
        return Err(ProtocolError::CallerError(
            "coin private key does not match the coin".to_string(),
        ));
    }
    let denom = keys.denomination(&coin.h_denom_pub).ok_or_else(|| {
        ProtocolError::CallerError(format!("unknown denomination {}", coin.h_denom_pub.short()))
    })?;
    coin.verify(&denom.key).map_err(ProtocolError::caller)?;

    let coin_sig = RecoupRequestPS {
        coin_pub: coin.coin_pub,
        h_denom_pub: denom.h_key,
        coin_blind: blinding_key.clone(),
    }
    .sign(coin_priv);

    Ok(PreparedRecoup {
        request: RecoupRequestJson {
            denom_pub_hash: denom.h_key,
            denom_sig: coin.denom_sig.clone(),
            coin_sig,
            coin_blind_key_secret: blinding_key.clone(),
            refreshed: was_refreshed,
        },
        coin_pub: coin.coin_pub,
        h_denom_pub: denom.h_key,
        was_refreshed,
    })
}

/// Where the recouped value went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoupTarget {
    /// Back into the reserve the coin was withdrawn from
    Reserve(ReservePublicKey),
    /// Onto the coin the recouped coin was refreshed from
    OldCoin(CoinPublicKey),
}

/// Exchange's signed confirmation of a recoup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoupReceipt {
    pub target: RecoupTarget,
    pub amount: Amount,
    pub timestamp: Timestamp,
    pub exchange_pub: ExchangePublicKey,
    pub exchange_sig: EddsaSignature,
}

fn verify_recoup_confirmation(
    keys: &KeySet,
    prepared: &PreparedRecoup,
    reply: &RecoupSuccessJson,
) -> Result<RecoupReceipt> {
    if !keys.is_current_signing_key(&reply.exchange_pub, reply.timestamp) {
        error!(
            "Recoup confirmed by key {} which is not a current signing key",
            reply.exchange_pub.short()
        );
        return Err(ProtocolError::SignatureInvalid(format!(
            "exchange key {} is not a current signing key",
            reply.exchange_pub.short()
        )));
    }

    let (target, checked) = if prepared.was_refreshed {
        let old_coin_pub = reply.old_coin_pub.ok_or_else(|| {
            ProtocolError::Malformed("recoup reply lacks old_coin_pub".to_string())
        })?;
        let checked = RecoupRefreshConfirmationPS {
            timestamp: reply.timestamp,
            recoup_amount: reply.amount,
            coin_pub: prepared.coin_pub,
            old_coin_pub,
        }
        .verify(&reply.exchange_pub, &reply.exchange_sig);
        (RecoupTarget::OldCoin(old_coin_pub), checked)
    } else {
        let reserve_pub = reply.reserve_pub.ok_or_else(|| {
            ProtocolError::Malformed("recoup reply lacks reserve_pub".to_string())
        })?;
        let checked = RecoupConfirmationPS {
            timestamp: reply.timestamp,
            recoup_amount: reply.amount,
            coin_pub: prepared.coin_pub,
            reserve_pub,
        }
        .verify(&reply.exchange_pub, &reply.exchange_sig);
        (RecoupTarget::Reserve(reserve_pub), checked)
    };
    checked.map_err(|_| {
        error!("Exchange recoup confirmation signature is invalid");
        ProtocolError::SignatureInvalid("recoup confirmation".to_string())
    })?;

    Ok(RecoupReceipt {
        target,
        amount: reply.amount,
        timestamp: reply.timestamp,
        exchange_pub: reply.exchange_pub,
        exchange_sig: reply.exchange_sig,
    })
}

#[derive(serde::Deserialize)]
struct RecoupConflictJson {
    history: Vec<serde_json::Value>,
}

/// Interpret the exchange's reply to a recoup
pub fn handle_recoup_response(
    keys: &KeySet,
    prepared: &PreparedRecoup,
    response: &HttpResponse,
) -> Result<RecoupReceipt> {
    if let Some(refreshed) = response.body.get("refreshed").and_then(|v| v.as_bool()) {
        if refreshed != prepared.was_refreshed {
            return Err(ProtocolError::Malformed(format!(
                "recoup reply says refreshed={}, request said {}",
                refreshed, prepared.was_refreshed
            )));
        }
    }

    match response.status {
        200 => {
            let reply: RecoupSuccessJson = parse(&response.body, "recoup reply")?;
            let receipt = verify_recoup_confirmation(keys, prepared, &reply)?;
            debug!(
                "Recouped {} from coin {}",
                receipt.amount,
                prepared.coin_pub.short()
            );
            Ok(receipt)
        }
        409 => {
            let conflict: RecoupConflictJson = parse(&response.body, "recoup conflict")?;
            let denom = keys.denomination(&prepared.h_denom_pub).ok_or_else(|| {
                ProtocolError::Malformed("denomination vanished from key set".to_string())
            })?;
            // Any remaining value could be recouped, so the history must use it all up
            let smallest = Amount::new(denom.value.currency().as_str(), 0, 1)
                .map_err(ProtocolError::caller)?;
            let spent = verify_double_spending_proof(
                keys,
                denom,
                &prepared.coin_pub,
                &smallest,
                &conflict.history,
            )?;
            Err(ProtocolError::Conflict(format!(
                "coin {} already spent {} of {}",
                prepared.coin_pub.short(),
                spent,
                denom.value
            )))
        }
        _ => Err(unexpected_reply(response, "recoup")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::CoinHistoryEntry;
    use crate::testing::{kudos, KeyFixture};
    use coinage_core::{MerchantPrivateKey, PlanchetSecrets};
    use rand::rngs::OsRng;
    use serde_json::json;

    struct Setup {
        fx: KeyFixture,
        keys: KeySet,
        secrets: PlanchetSecrets,
        coin: Coin,
    }

    fn setup() -> Setup {
        let fx = KeyFixture::new(1);
        let mut keys = KeySet::default().merge(&fx.response(), true).unwrap();
        let h = keys.denominations[0].h_key;
        keys.apply_revocations(&[h]);
        let secrets = PlanchetSecrets::generate(&mut OsRng);
        let key = fx.denom_priv(0);
        let detail = secrets.prepare(key.public_key()).unwrap();
        let coin = secrets
            .finalize(key.public_key(), &key.sign_blinded(&detail.coin_ev).unwrap())
            .unwrap();
        Setup {
            fx,
            keys,
            secrets,
            coin,
        }
    }

    fn prepared(s: &Setup, refreshed: bool) -> PreparedRecoup {
        build_recoup_request(
            &s.keys,
            &s.coin,
            &s.secrets.coin_priv,
            &s.secrets.blinding_key,
            refreshed,
        )
        .unwrap()
    }

    #[test]
    fn test_request_signed_by_coin() {
        let s = setup();
        let p = prepared(&s, false);
        RecoupRequestPS {
            coin_pub: s.coin.coin_pub,
            h_denom_pub: s.coin.h_denom_pub,
            coin_blind: s.secrets.blinding_key.clone(),
        }
        .verify(&s.coin.coin_pub, &p.request.coin_sig)
        .unwrap();
        assert!(p.path().starts_with("coins/"));
    }

    #[test]
    fn test_reserve_credit_confirmed() {
        let s = setup();
        let p = prepared(&s, false);
        let reserve_pub = coinage_core::ReservePrivateKey::generate(&mut OsRng).public_key();
        let sig = RecoupConfirmationPS {
            timestamp: s.fx.now,
            recoup_amount: kudos("1"),
            coin_pub: s.coin.coin_pub,
            reserve_pub,
        }
        .sign(&s.fx.signer);
        let response = HttpResponse::new(
            200,
            json!({
                "refreshed": false,
                "reserve_pub": reserve_pub,
                "exchange_sig": sig,
                "exchange_pub": s.fx.signer.public_key(),
                "timestamp": s.fx.now,
                "amount": kudos("1"),
            }),
        );
        let receipt = handle_recoup_response(&s.keys, &p, &response).unwrap();
        assert_eq!(receipt.target, RecoupTarget::Reserve(reserve_pub));

        // The same signature cannot vouch for a different amount
        let mut inflated = response.clone();
        inflated.body["amount"] = json!(kudos("2"));
        assert!(matches!(
            handle_recoup_response(&s.keys, &p, &inflated),
            Err(ProtocolError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_refreshed_flag_mismatch_is_malformed() {
        let s = setup();
        let p = prepared(&s, false);
        for status in [200, 409, 404] {
            let response = HttpResponse::new(status, json!({ "refreshed": true }));
            assert!(matches!(
                handle_recoup_response(&s.keys, &p, &response),
                Err(ProtocolError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_fully_spent_coin_conflict() {
        let s = setup();
        let p = prepared(&s, false);
        let deposit = |amount: &str| {
            let merchant = MerchantPrivateKey::generate(&mut OsRng).public_key();
            let amount = kudos(amount);
            let coin_sig = crate::deposit::sign_deposit_permission(
                &amount,
                &kudos("0.01"),
                &HashCode::of(b"wire"),
                &HashCode::of(b"contract"),
                &s.coin.h_denom_pub,
                &s.secrets.coin_priv,
                s.fx.now,
                &merchant,
                s.fx.now,
            );
            serde_json::to_value(CoinHistoryEntry::Deposit {
                amount,
                deposit_fee: kudos("0.01"),
                h_contract_terms: HashCode::of(b"contract"),
                h_wire: HashCode::of(b"wire"),
                h_denom_pub: s.coin.h_denom_pub,
                timestamp: s.fx.now,
                refund_deadline: s.fx.now,
                merchant_pub: merchant,
                coin_sig,
            })
            .unwrap()
        };

        let spent = HttpResponse::new(409, json!({ "history": [deposit("1")] }));
        assert!(matches!(
            handle_recoup_response(&s.keys, &p, &spent),
            Err(ProtocolError::Conflict(_))
        ));

        let partly = HttpResponse::new(409, json!({ "history": [deposit("0.5")] }));
        assert!(matches!(
            handle_recoup_response(&s.keys, &p, &partly),
            Err(ProtocolError::ProofInvalid(_))
        ));
    }
}
