//! Withdrawing blind-signed coins from a reserve

use coinage_core::codec::{SignedRecord, WithdrawRequestPS};
use coinage_core::{
    Amount, BlindedMessage, Coin, HashCode, PlanchetSecrets, ReservePrivateKey, ReservePublicKey,
    Timestamp,
};
use tracing::{debug, error};

use crate::error::{ProtocolError, Result};
use crate::history::verify_reserve_history;
use crate::keys::KeySet;
use crate::transport::HttpResponse;
use crate::wire::{parse, unexpected_reply, WithdrawRequestJson, WithdrawSuccessJson};

/// A signed withdraw request and the secrets to finish the coin with
#[derive(Debug, Clone)]
pub struct PreparedWithdraw {
    pub reserve_pub: ReservePublicKey,
    pub h_denom_pub: HashCode,
    pub secrets: PlanchetSecrets,
    pub amount_with_fee: Amount,
    pub request: WithdrawRequestJson,
}

impl PreparedWithdraw {
    pub fn path(&self) -> String {
        format!("reserves/{}/withdraw", self.reserve_pub.to_hex())
    }

    pub fn coin_ev(&self) -> &BlindedMessage {
        &self.request.coin_ev
    }
}

/// Blind a planchet for `h_denom_pub` and sign the withdrawal with the reserve key
pub fn prepare_withdraw(
    keys: &KeySet,
    h_denom_pub: &HashCode,
    reserve_priv: &ReservePrivateKey,
    secrets: PlanchetSecrets,
    now: Timestamp,
) -> Result<PreparedWithdraw> {
    let denom = keys.denomination(h_denom_pub).ok_or_else(|| {
        ProtocolError::CallerError(format!("unknown denomination {}", h_denom_pub.short()))
    })?;
    if denom.revoked {
        return Err(ProtocolError::CallerError(format!(
            "denomination {} is revoked",
            h_denom_pub.short()
        )));
    }
    if !denom.can_withdraw(now) {
        return Err(ProtocolError::CallerError(format!(
            "denomination {} is not withdrawable at {}",
            h_denom_pub.short(),
            now
        )));
    }

    let amount_with_fee = denom
        .value
        .checked_add(&denom.fee_withdraw)
        .map_err(ProtocolError::caller)?;
    let detail = secrets.prepare(&denom.key).map_err(ProtocolError::caller)?;
    let reserve_pub = reserve_priv.public_key();
    let reserve_sig = WithdrawRequestPS {
        reserve_pub,
        amount_with_fee,
        h_denom_pub: denom.h_key,
        h_coin_envelope: detail.h_coin_envelope(),
    }
    .sign(reserve_priv);

    Ok(PreparedWithdraw {
        reserve_pub,
        h_denom_pub: denom.h_key,
        secrets,
        amount_with_fee,
        request: WithdrawRequestJson {
            denom_pub_hash: denom.h_key,
            coin_ev: detail.coin_ev,
            reserve_sig,
        },
    })
}

#[derive(serde::Deserialize)]
struct ReserveConflictJson {
    history: Vec<serde_json::Value>,
}

/// Interpret the exchange's reply to a withdrawal
pub fn handle_withdraw_response(
    keys: &KeySet,
    prepared: &PreparedWithdraw,
    response: &HttpResponse,
) -> Result<Coin> {
    let denom = keys.denomination(&prepared.h_denom_pub).ok_or_else(|| {
        ProtocolError::Malformed("denomination vanished from key set".to_string())
    })?;
    match response.status {
        200 => {
            let reply: WithdrawSuccessJson = parse(&response.body, "withdraw reply")?;
            let coin = prepared
                .secrets
                .finalize(&denom.key, &reply.ev_sig)
                .map_err(|e| {
                    error!("Exchange returned an invalid blind signature: {}", e);
                    ProtocolError::SignatureInvalid(format!("withdrawn coin: {}", e))
                })?;
            debug!("Withdrew coin {} of {}", coin.coin_pub.short(), denom.value);
            Ok(coin)
        }
        409 => {
            let conflict: ReserveConflictJson = parse(&response.body, "reserve conflict")?;
            let balance = verify_reserve_history(
                keys,
                &prepared.reserve_pub,
                prepared.amount_with_fee.currency(),
                &conflict.history,
            )?;
            if balance >= prepared.amount_with_fee {
                error!(
                    "Exchange claims insufficient funds but reserve {} holds {}",
                    prepared.reserve_pub.short(),
                    balance
                );
                return Err(ProtocolError::ProofInvalid(format!(
                    "reserve balance {} covers {}",
                    balance, prepared.amount_with_fee
                )));
            }
            Err(ProtocolError::Conflict(format!(
                "reserve {} holds {}, withdrawal needs {}",
                prepared.reserve_pub.short(),
                balance,
                prepared.amount_with_fee
            )))
        }
        _ => Err(unexpected_reply(response, "withdraw")),
    }
}
