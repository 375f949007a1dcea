//! Refresh commitment and the cut-and-choose reveal check
//!
//! A melting wallet prepares [`KAPPA`] branches. Each branch has its own
//! transfer key, and from the transfer secret it derives one planchet per
//! requested denomination. The commitment `rc` hashes, in this order:
//!
//! 1. every branch's transfer public key
//! 2. the hash of every new denomination
//! 3. every branch's coin envelopes, branch-major
//! 4. the melted amount including fee (binary amount encoding)
//! 5. the old coin's public key
//!
//! After the exchange picks `noreveal_index`, the wallet reveals the
//! transfer private keys of the other branches. The exchange rebuilds
//! those branches and must arrive at the same `rc`.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::blind::{BlindedMessage, DenominationPublicKey};
use crate::crypto::{transfer_secret_for_melt, CoinPublicKey, TransferPrivateKey, TransferPublicKey};
use crate::error::{CoreError, Result};
use crate::planchet::PlanchetSecrets;
use crate::types::{HashCode, HashContext};
use crate::KAPPA;

/// One cut-and-choose branch as seen by its creator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshBranch {
    pub transfer_pub: TransferPublicKey,
    pub planchets: Vec<PlanchetSecrets>,
    pub coin_evs: Vec<BlindedMessage>,
}

/// Derive every planchet of a branch from its transfer key
pub fn derive_branch(
    transfer_priv: &TransferPrivateKey,
    old_coin_pub: &CoinPublicKey,
    new_denoms: &[DenominationPublicKey],
) -> Result<RefreshBranch> {
    let secret = transfer_secret_for_melt(transfer_priv, old_coin_pub)?;
    let mut planchets = Vec::with_capacity(new_denoms.len());
    let mut coin_evs = Vec::with_capacity(new_denoms.len());
    for (index, denom) in new_denoms.iter().enumerate() {
        let planchet = PlanchetSecrets::derive(&secret, index as u32)?;
        coin_evs.push(planchet.prepare(denom)?.coin_ev);
        planchets.push(planchet);
    }
    Ok(RefreshBranch {
        transfer_pub: transfer_priv.public_key(),
        planchets,
        coin_evs,
    })
}

/// Compute the refresh commitment `rc`
pub fn compute_rc(
    transfer_pubs: &[TransferPublicKey],
    new_denom_hashes: &[HashCode],
    coin_evs: &[Vec<BlindedMessage>],
    amount_with_fee: &Amount,
    old_coin_pub: &CoinPublicKey,
) -> HashCode {
    let mut ctx = HashContext::new();
    for transfer_pub in transfer_pubs {
        ctx.update(transfer_pub.as_bytes());
    }
    for h_denom in new_denom_hashes {
        ctx.update(h_denom.as_bytes());
    }
    for branch in coin_evs {
        for coin_ev in branch {
            ctx.update(&coin_ev.0);
        }
    }
    ctx.update(&amount_with_fee.to_bytes());
    ctx.update(old_coin_pub.as_bytes());
    ctx.finish()
}

/// Everything the exchange holds when checking a reveal
#[derive(Debug, Clone, Copy)]
pub struct RevealCheck<'a> {
    pub rc: &'a HashCode,
    pub old_coin_pub: &'a CoinPublicKey,
    pub amount_with_fee: &'a Amount,
    pub noreveal_index: u32,
    pub withheld_transfer_pub: &'a TransferPublicKey,
    /// Revealed keys, ascending branch order skipping the withheld one
    pub transfer_privs: &'a [TransferPrivateKey],
    pub new_denoms: &'a [DenominationPublicKey],
    pub withheld_coin_evs: &'a [BlindedMessage],
}

/// Rebuild all branches from a reveal and compare against `rc`
pub fn verify_reveal(check: &RevealCheck<'_>) -> Result<()> {
    let noreveal = check.noreveal_index as usize;
    if noreveal >= KAPPA {
        return Err(CoreError::CommitmentMismatch(format!(
            "noreveal index {} out of range",
            noreveal
        )));
    }
    if check.transfer_privs.len() != KAPPA - 1 {
        return Err(CoreError::CommitmentMismatch(format!(
            "expected {} transfer keys, got {}",
            KAPPA - 1,
            check.transfer_privs.len()
        )));
    }
    if check.withheld_coin_evs.len() != check.new_denoms.len() {
        return Err(CoreError::CommitmentMismatch(format!(
            "{} envelopes for {} denominations",
            check.withheld_coin_evs.len(),
            check.new_denoms.len()
        )));
    }

    let mut revealed = check.transfer_privs.iter();
    let mut transfer_pubs = Vec::with_capacity(KAPPA);
    let mut coin_evs = Vec::with_capacity(KAPPA);
    for branch in 0..KAPPA {
        if branch == noreveal {
            transfer_pubs.push(*check.withheld_transfer_pub);
            coin_evs.push(check.withheld_coin_evs.to_vec());
            continue;
        }
        let transfer_priv = revealed
            .next()
            .ok_or_else(|| CoreError::CommitmentMismatch("missing transfer key".to_string()))?;
        let rebuilt = derive_branch(transfer_priv, check.old_coin_pub, check.new_denoms)?;
        transfer_pubs.push(rebuilt.transfer_pub);
        coin_evs.push(rebuilt.coin_evs);
    }

    let hashes: Vec<HashCode> = check.new_denoms.iter().map(|d| d.hash()).collect();
    let rc = compute_rc(
        &transfer_pubs,
        &hashes,
        &coin_evs,
        check.amount_with_fee,
        check.old_coin_pub,
    );
    if rc != *check.rc {
        return Err(CoreError::CommitmentMismatch(
            "revealed branches do not match the commitment".to_string(),
        ));
    }
    Ok(())
}
