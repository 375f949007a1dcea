//! Deposit permissions and exchange deposit confirmations

use coinage_core::codec::{DepositConfirmationPS, DepositRequestPS, SignedRecord};
use coinage_core::{
    Amount, Coin, CoinPrivateKey, CoinPublicKey, EddsaSignature, ExchangePublicKey, HashCode,
    MerchantPublicKey, Timestamp,
};
use tracing::{debug, error};

use crate::error::{ProtocolError, Result};
use crate::history::verify_double_spending_proof;
use crate::keys::KeySet;
use crate::transport::HttpResponse;
use crate::wire::{parse, unexpected_reply, DepositRequestJson, DepositSuccessJson, WireAccount};

/// Sign the coin owner's permission to deposit `amount` (fee included)
#[allow(clippy::too_many_arguments)]
pub fn sign_deposit_permission(
    amount: &Amount,
    deposit_fee: &Amount,
    h_wire: &HashCode,
    h_contract_terms: &HashCode,
    h_denom_pub: &HashCode,
    coin_priv: &CoinPrivateKey,
    wallet_timestamp: Timestamp,
    merchant_pub: &MerchantPublicKey,
    refund_deadline: Timestamp,
) -> EddsaSignature {
    DepositRequestPS {
        h_contract_terms: *h_contract_terms,
        h_wire: *h_wire,
        h_denom_pub: *h_denom_pub,
        wallet_timestamp,
        refund_deadline,
        amount_with_fee: *amount,
        deposit_fee: *deposit_fee,
        merchant: *merchant_pub,
        coin_pub: coin_priv.public_key(),
    }
    .sign(coin_priv)
}

/// What the wallet knows when it deposits a coin
#[derive(Debug, Clone)]
pub struct DepositParams {
    /// Contribution of this coin, deposit fee included
    pub amount: Amount,
    pub wire: WireAccount,
    pub h_contract_terms: HashCode,
    pub coin: Coin,
    pub coin_priv: CoinPrivateKey,
    pub wallet_timestamp: Timestamp,
    pub merchant_pub: MerchantPublicKey,
    pub refund_deadline: Timestamp,
    pub wire_deadline: Timestamp,
}

/// A checked deposit request and what is needed to verify the reply
#[derive(Debug, Clone)]
pub struct PreparedDeposit {
    pub request: DepositRequestJson,
    pub coin_pub: CoinPublicKey,
    pub amount: Amount,
    pub deposit_fee: Amount,
    pub amount_without_fee: Amount,
}

impl PreparedDeposit {
    pub fn path(&self) -> String {
        format!("coins/{}/deposit", self.coin_pub.to_hex())
    }
}

/// Validate deposit parameters and sign the deposit permission
pub fn prepare_deposit(keys: &KeySet, params: &DepositParams) -> Result<PreparedDeposit> {
    let coin_pub = params.coin_priv.public_key();
    if coin_pub != params.coin.coin_pub {
        return Err(ProtocolError::CallerError(
            "coin private key does not match the coin".to_string(),
        ));
    }
    let denom = keys.denomination(&params.coin.h_denom_pub).ok_or_else(|| {
        ProtocolError::CallerError(format!(
            "unknown denomination {}",
            params.coin.h_denom_pub.short()
        ))
    })?;
    if !denom.can_deposit(params.wallet_timestamp) {
        return Err(ProtocolError::CallerError(format!(
            "denomination {} cannot be deposited at {}",
            denom.h_key.short(),
            params.wallet_timestamp
        )));
    }
    params.coin.verify(&denom.key).map_err(ProtocolError::caller)?;

    if params.amount.compare(&denom.value).map_err(ProtocolError::caller)?
        == std::cmp::Ordering::Greater
    {
        return Err(ProtocolError::CallerError(format!(
            "deposit of {} exceeds coin value {}",
            params.amount, denom.value
        )));
    }
    let amount_without_fee = params
        .amount
        .checked_sub(&denom.fee_deposit)
        .map_err(|_| {
            ProtocolError::CallerError(format!(
                "deposit of {} does not cover the fee {}",
                params.amount, denom.fee_deposit
            ))
        })?;
    if params.refund_deadline > params.wire_deadline {
        return Err(ProtocolError::CallerError(
            "refund deadline is after the wire deadline".to_string(),
        ));
    }

    let h_wire = params.wire.h_wire();
    let coin_sig = sign_deposit_permission(
        &params.amount,
        &denom.fee_deposit,
        &h_wire,
        &params.h_contract_terms,
        &denom.h_key,
        &params.coin_priv,
        params.wallet_timestamp,
        &params.merchant_pub,
        params.refund_deadline,
    );

    Ok(PreparedDeposit {
        request: DepositRequestJson {
            contribution: params.amount,
            wire: params.wire.clone(),
            h_wire,
            h_contract_terms: params.h_contract_terms,
            denom_pub_hash: denom.h_key,
            ub_sig: params.coin.denom_sig.clone(),
            timestamp: params.wallet_timestamp,
            merchant_pub: params.merchant_pub,
            refund_deadline: params.refund_deadline,
            wire_transfer_deadline: params.wire_deadline,
            coin_sig,
        },
        coin_pub,
        amount: params.amount,
        deposit_fee: denom.fee_deposit,
        amount_without_fee,
    })
}

/// Exchange's signed acknowledgement of a deposit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositReceipt {
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: ExchangePublicKey,
    pub exchange_timestamp: Timestamp,
    pub amount_without_fee: Amount,
}

/// The record the exchange signs to confirm `prepared`
pub fn confirmation_record(
    prepared: &PreparedDeposit,
    exchange_timestamp: Timestamp,
) -> DepositConfirmationPS {
    DepositConfirmationPS {
        h_contract_terms: prepared.request.h_contract_terms,
        h_wire: prepared.request.h_wire,
        exchange_timestamp,
        refund_deadline: prepared.request.refund_deadline,
        amount_without_fee: prepared.amount_without_fee,
        coin_pub: prepared.coin_pub,
        merchant: prepared.request.merchant_pub,
    }
}

/// Check the exchange's confirmation of a deposit
pub fn verify_deposit_confirmation(
    keys: &KeySet,
    prepared: &PreparedDeposit,
    body: &serde_json::Value,
) -> Result<DepositReceipt> {
    let reply: DepositSuccessJson = parse(body, "deposit confirmation")?;
    if !keys.is_current_signing_key(&reply.exchange_pub, reply.exchange_timestamp) {
        error!(
            "Deposit confirmed by key {} which is not a current signing key",
            reply.exchange_pub.short()
        );
        return Err(ProtocolError::SignatureInvalid(format!(
            "exchange key {} is not a current signing key",
            reply.exchange_pub.short()
        )));
    }
    confirmation_record(prepared, reply.exchange_timestamp)
        .verify(&reply.exchange_pub, &reply.exchange_sig)
        .map_err(|_| {
            error!("Exchange deposit confirmation signature is invalid");
            ProtocolError::SignatureInvalid("deposit confirmation".to_string())
        })?;

    Ok(DepositReceipt {
        exchange_sig: reply.exchange_sig,
        exchange_pub: reply.exchange_pub,
        exchange_timestamp: reply.exchange_timestamp,
        amount_without_fee: prepared.amount_without_fee,
    })
}

#[derive(serde::Deserialize)]
struct ConflictJson {
    history: Vec<serde_json::Value>,
}

/// Interpret the exchange's reply to a deposit
pub fn handle_deposit_response(
    keys: &KeySet,
    prepared: &PreparedDeposit,
    response: &HttpResponse,
) -> Result<DepositReceipt> {
    match response.status {
        200 => verify_deposit_confirmation(keys, prepared, &response.body),
        409 => {
            let conflict: ConflictJson = parse(&response.body, "deposit conflict")?;
            let denom = keys
                .denomination(&prepared.request.denom_pub_hash)
                .ok_or_else(|| {
                    ProtocolError::Malformed("denomination vanished from key set".to_string())
                })?;
            let spent = verify_double_spending_proof(
                keys,
                denom,
                &prepared.coin_pub,
                &prepared.amount,
                &conflict.history,
            )?;
            debug!(
                "Deposit of coin {} refused, {} already spent",
                prepared.coin_pub.short(),
                spent
            );
            Err(ProtocolError::Conflict(format!(
                "coin {} already spent {} of {}",
                prepared.coin_pub.short(),
                spent,
                denom.value
            )))
        }
        _ => Err(unexpected_reply(response, "deposit")),
    }
}
