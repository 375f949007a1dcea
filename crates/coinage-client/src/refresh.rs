//! Refreshing a coin: melt, reveal and link
//!
//! A refresh melts (part of) an old coin into fresh coins that the old
//! coin's owner, and only the owner, can later re-derive through link.
//! The steps are ordered by their inputs: a reveal needs the
//! [`MeltOutcome`] the exchange returned for the same [`MeltPlan`].

use coinage_core::codec::{LinkDataPS, MeltCommitmentPS, MeltConfirmationPS, SignedRecord};
use coinage_core::{
    compute_rc, derive_branch, transfer_secret_for_link, Amount, Coin, CoinPrivateKey,
    CoinPublicKey, DenominationPublicKey, EddsaSignature, ExchangePublicKey, HashCode,
    PlanchetSecrets, RefreshBranch, Timestamp, TransferPrivateKey, KAPPA,
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{ProtocolError, Result};
use crate::history::verify_double_spending_proof;
use crate::keys::KeySet;
use crate::transport::HttpResponse;
use crate::wire::{
    parse, unexpected_reply, LinkSessionJson, MeltRequestJson, MeltSuccessJson,
    RevealRequestJson, RevealSuccessJson,
};

/// Everything a wallet must keep between melt and reveal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltPlan {
    pub old_coin_priv: CoinPrivateKey,
    pub old_coin: Coin,
    /// Melted amount including the refresh fee
    pub melt_amount: Amount,
    pub melt_fee: Amount,
    pub new_denoms: Vec<DenominationPublicKey>,
    pub new_denom_hashes: Vec<HashCode>,
    pub transfer_privs: Vec<TransferPrivateKey>,
    pub branches: Vec<RefreshBranch>,
    pub rc: HashCode,
}

impl MeltPlan {
    pub fn old_coin_pub(&self) -> CoinPublicKey {
        self.old_coin.coin_pub
    }

    pub fn melt_path(&self) -> String {
        format!("coins/{}/melt", self.old_coin.coin_pub.to_hex())
    }

    pub fn reveal_path(&self) -> String {
        format!("refreshes/{}/reveal", self.rc.to_hex())
    }
}

/// Pick transfer keys, derive all branches and compute the commitment
pub fn prepare_melt<R: RngCore + CryptoRng>(
    keys: &KeySet,
    old_coin_priv: &CoinPrivateKey,
    old_coin: &Coin,
    melt_amount: &Amount,
    new_denom_hashes: &[HashCode],
    now: Timestamp,
    rng: &mut R,
) -> Result<MeltPlan> {
    if old_coin_priv.public_key() != old_coin.coin_pub {
        return Err(ProtocolError::CallerError(
            "coin private key does not match the coin".to_string(),
        ));
    }
    if new_denom_hashes.is_empty() {
        return Err(ProtocolError::CallerError(
            "refresh without fresh coins".to_string(),
        ));
    }
    let old_denom = keys.denomination(&old_coin.h_denom_pub).ok_or_else(|| {
        ProtocolError::CallerError(format!(
            "unknown denomination {}",
            old_coin.h_denom_pub.short()
        ))
    })?;
    if !old_denom.can_deposit(now) {
        return Err(ProtocolError::CallerError(format!(
            "denomination {} can no longer be melted",
            old_denom.h_key.short()
        )));
    }
    old_coin.verify(&old_denom.key).map_err(ProtocolError::caller)?;
    if *melt_amount > old_denom.value {
        return Err(ProtocolError::CallerError(format!(
            "melt of {} exceeds coin value {}",
            melt_amount, old_denom.value
        )));
    }

    let mut new_denoms = Vec::with_capacity(new_denom_hashes.len());
    let mut required = old_denom.fee_refresh;
    for h in new_denom_hashes {
        let denom = keys.denomination(h).ok_or_else(|| {
            ProtocolError::CallerError(format!("unknown denomination {}", h.short()))
        })?;
        if denom.revoked || !denom.can_withdraw(now) {
            return Err(ProtocolError::CallerError(format!(
                "denomination {} is not available for fresh coins",
                h.short()
            )));
        }
        required = required
            .checked_add(&denom.value)
            .and_then(|a| a.checked_add(&denom.fee_withdraw))
            .map_err(ProtocolError::caller)?;
        new_denoms.push(denom.key.clone());
    }
    if required.compare(melt_amount).map_err(ProtocolError::caller)?
        == std::cmp::Ordering::Greater
    {
        return Err(ProtocolError::CallerError(format!(
            "fresh coins and fees need {}, melting only {}",
            required, melt_amount
        )));
    }

    let transfer_privs: Vec<TransferPrivateKey> =
        (0..KAPPA).map(|_| TransferPrivateKey::generate(rng)).collect();
    let branches = transfer_privs
        .iter()
        .map(|t| derive_branch(t, &old_coin.coin_pub, &new_denoms))
        .collect::<coinage_core::Result<Vec<_>>>()
        .map_err(ProtocolError::caller)?;
    let transfer_pubs: Vec<_> = branches.iter().map(|b| b.transfer_pub).collect();
    let coin_evs: Vec<_> = branches.iter().map(|b| b.coin_evs.clone()).collect();
    let rc = compute_rc(
        &transfer_pubs,
        new_denom_hashes,
        &coin_evs,
        melt_amount,
        &old_coin.coin_pub,
    );
    debug!(
        "Prepared melt of {} from coin {} into {} coins, rc {}",
        melt_amount,
        old_coin.coin_pub.short(),
        new_denoms.len(),
        rc.short()
    );

    Ok(MeltPlan {
        old_coin_priv: old_coin_priv.clone(),
        old_coin: old_coin.clone(),
        melt_amount: *melt_amount,
        melt_fee: old_denom.fee_refresh,
        new_denoms,
        new_denom_hashes: new_denom_hashes.to_vec(),
        transfer_privs,
        branches,
        rc,
    })
}

/// The signed melt request for `plan`
pub fn melt_request(plan: &MeltPlan) -> MeltRequestJson {
    let confirm_sig = MeltCommitmentPS {
        rc: plan.rc,
        h_denom_pub: plan.old_coin.h_denom_pub,
        amount_with_fee: plan.melt_amount,
        melt_fee: plan.melt_fee,
        coin_pub: plan.old_coin.coin_pub,
    }
    .sign(&plan.old_coin_priv);

    MeltRequestJson {
        coin_pub: plan.old_coin.coin_pub,
        denom_pub_hash: plan.old_coin.h_denom_pub,
        denom_sig: plan.old_coin.denom_sig.clone(),
        confirm_sig,
        value_with_fee: plan.melt_amount,
        rc: plan.rc,
    }
}

/// The exchange's choice of the branch that stays secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltOutcome {
    pub noreveal_index: u32,
    pub exchange_pub: ExchangePublicKey,
    pub exchange_sig: EddsaSignature,
}

#[derive(Deserialize)]
struct MeltConflictJson {
    history: Vec<serde_json::Value>,
}

/// Interpret the exchange's reply to a melt
pub fn handle_melt_response(
    keys: &KeySet,
    plan: &MeltPlan,
    response: &HttpResponse,
) -> Result<MeltOutcome> {
    match response.status {
        200 => {
            let reply: MeltSuccessJson = parse(&response.body, "melt reply")?;
            if reply.noreveal_index as usize >= KAPPA {
                return Err(ProtocolError::Malformed(format!(
                    "noreveal index {} out of range",
                    reply.noreveal_index
                )));
            }
            if keys.signing_key(&reply.exchange_pub).is_none() {
                error!(
                    "Melt confirmed by unknown exchange key {}",
                    reply.exchange_pub.short()
                );
                return Err(ProtocolError::SignatureInvalid(format!(
                    "exchange key {} is not listed",
                    reply.exchange_pub.short()
                )));
            }
            MeltConfirmationPS {
                rc: plan.rc,
                noreveal_index: reply.noreveal_index,
            }
            .verify(&reply.exchange_pub, &reply.exchange_sig)
            .map_err(|_| {
                error!("Exchange melt confirmation signature is invalid");
                ProtocolError::SignatureInvalid("melt confirmation".to_string())
            })?;
            debug!(
                "Melt {} accepted, branch {} stays secret",
                plan.rc.short(),
                reply.noreveal_index
            );
            Ok(MeltOutcome {
                noreveal_index: reply.noreveal_index,
                exchange_pub: reply.exchange_pub,
                exchange_sig: reply.exchange_sig,
            })
        }
        409 => {
            let conflict: MeltConflictJson = parse(&response.body, "melt conflict")?;
            let denom = keys.denomination(&plan.old_coin.h_denom_pub).ok_or_else(|| {
                ProtocolError::Malformed("denomination vanished from key set".to_string())
            })?;
            let spent = verify_double_spending_proof(
                keys,
                denom,
                &plan.old_coin.coin_pub,
                &plan.melt_amount,
                &conflict.history,
            )?;
            Err(ProtocolError::Conflict(format!(
                "coin {} already spent {} of {}",
                plan.old_coin.coin_pub.short(),
                spent,
                denom.value
            )))
        }
        _ => Err(unexpected_reply(response, "melt")),
    }
}

/// Disclose every branch except the one the exchange kept secret
pub fn build_reveal_request(plan: &MeltPlan, outcome: &MeltOutcome) -> Result<RevealRequestJson> {
    let noreveal = outcome.noreveal_index as usize;
    let kept = plan.branches.get(noreveal).ok_or_else(|| {
        ProtocolError::CallerError(format!("noreveal index {} out of range", noreveal))
    })?;

    let transfer_privs = plan
        .transfer_privs
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != noreveal)
        .map(|(_, t)| t.clone())
        .collect();
    let link_sigs = plan
        .new_denom_hashes
        .iter()
        .zip(&kept.coin_evs)
        .map(|(h_denom_pub, coin_ev)| {
            LinkDataPS {
                old_coin_pub: plan.old_coin.coin_pub,
                h_denom_pub: *h_denom_pub,
                transfer_pub: kept.transfer_pub,
                coin_envelope_hash: coin_ev.hash(),
            }
            .sign(&plan.old_coin_priv)
        })
        .collect();

    Ok(RevealRequestJson {
        transfer_pub: kept.transfer_pub,
        transfer_privs,
        new_denoms_h: plan.new_denom_hashes.clone(),
        coin_evs: kept.coin_evs.clone(),
        link_sigs,
    })
}

/// Unblind the fresh coins from the exchange's reveal reply
pub fn handle_reveal_response(
    plan: &MeltPlan,
    outcome: &MeltOutcome,
    response: &HttpResponse,
) -> Result<Vec<Coin>> {
    if response.status != 200 {
        return Err(unexpected_reply(response, "reveal"));
    }
    let reply: RevealSuccessJson = parse(&response.body, "reveal reply")?;
    let branch = plan
        .branches
        .get(outcome.noreveal_index as usize)
        .ok_or_else(|| ProtocolError::CallerError("noreveal index out of range".to_string()))?;
    if reply.ev_sigs.len() != plan.new_denoms.len() {
        return Err(ProtocolError::Malformed(format!(
            "{} signatures for {} fresh coins",
            reply.ev_sigs.len(),
            plan.new_denoms.len()
        )));
    }

    let coins = reply
        .ev_sigs
        .iter()
        .zip(&branch.planchets)
        .zip(&plan.new_denoms)
        .map(|((sig, planchet), denom)| {
            planchet.finalize(denom, &sig.ev_sig).map_err(|e| {
                error!("Exchange returned an invalid signature on a fresh coin: {}", e);
                ProtocolError::SignatureInvalid(format!("fresh coin: {}", e))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    debug!("Refresh {} produced {} coins", plan.rc.short(), coins.len());
    Ok(coins)
}

/// A fresh coin recovered through link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedCoin {
    pub secrets: PlanchetSecrets,
    pub coin: Coin,
}

/// Recover every coin refreshed from the old coin
///
/// Sessions and their coins are returned flattened, in the order the
/// exchange listed them. One bad entry fails the whole link.
pub fn handle_link_response(
    old_coin_priv: &CoinPrivateKey,
    response: &HttpResponse,
) -> Result<Vec<LinkedCoin>> {
    if response.status != 200 {
        return Err(unexpected_reply(response, "link"));
    }
    let sessions: Vec<LinkSessionJson> = parse(&response.body, "link reply")?;
    let old_coin_pub = old_coin_priv.public_key();

    let mut linked = Vec::new();
    for session in &sessions {
        let secret = transfer_secret_for_link(old_coin_priv, &session.transfer_pub)
            .map_err(|e| ProtocolError::Malformed(format!("transfer key: {}", e)))?;
        for (index, entry) in session.new_coins.iter().enumerate() {
            let secrets = PlanchetSecrets::derive(&secret, index as u32)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            let detail = secrets
                .prepare(&entry.denom_pub)
                .map_err(|e| ProtocolError::Malformed(format!("denomination key: {}", e)))?;

            LinkDataPS {
                old_coin_pub,
                h_denom_pub: detail.h_denom_pub,
                transfer_pub: session.transfer_pub,
                coin_envelope_hash: detail.h_coin_envelope(),
            }
            .verify(&old_coin_pub, &entry.link_sig)
            .map_err(|_| {
                error!("Link data for coin {} carries a bad link signature", old_coin_pub.short());
                ProtocolError::SignatureInvalid("link signature".to_string())
            })?;

            let coin = secrets.finalize(&entry.denom_pub, &entry.ev_sig).map_err(|e| {
                error!("Exchange returned an invalid signature on a linked coin: {}", e);
                ProtocolError::SignatureInvalid(format!("linked coin: {}", e))
            })?;
            linked.push(LinkedCoin { secrets, coin });
        }
    }
    debug!(
        "Linked {} coins from {} sessions of coin {}",
        linked.len(),
        sessions.len(),
        old_coin_pub.short()
    );
    Ok(linked)
}
