//! Replay of coin and reserve histories sent as conflict proofs
//!
//! When the exchange refuses a deposit, melt or withdrawal with `409`, it
//! attaches the transaction history it holds. Every entry carries its own
//! signature. Replaying the history tells whether the refusal is justified;
//! an unjustified refusal is itself a protocol violation.

use coinage_core::codec::{
    DepositRequestPS, MeltCommitmentPS, RecoupConfirmationPS, RecoupRefreshConfirmationPS,
    RefundPS, ReserveClosedPS, SignedRecord, WithdrawRequestPS,
};
use coinage_core::{
    Amount, CoinPublicKey, EddsaSignature, ExchangePublicKey, HashCode, MerchantPublicKey,
    ReservePublicKey, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{ProtocolError, Result};
use crate::keys::{DenominationInfo, KeySet};
use crate::wire::parse;

/// One entry of a coin's transaction history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoinHistoryEntry {
    #[serde(rename = "DEPOSIT")]
    Deposit {
        amount: Amount,
        deposit_fee: Amount,
        h_contract_terms: HashCode,
        h_wire: HashCode,
        h_denom_pub: HashCode,
        timestamp: Timestamp,
        refund_deadline: Timestamp,
        merchant_pub: MerchantPublicKey,
        coin_sig: EddsaSignature,
    },
    #[serde(rename = "MELT")]
    Melt {
        amount: Amount,
        melt_fee: Amount,
        rc: HashCode,
        h_denom_pub: HashCode,
        coin_sig: EddsaSignature,
    },
    #[serde(rename = "REFUND")]
    Refund {
        amount: Amount,
        refund_fee: Amount,
        h_contract_terms: HashCode,
        merchant_pub: MerchantPublicKey,
        rtransaction_id: u64,
        merchant_sig: EddsaSignature,
    },
    #[serde(rename = "RECOUP")]
    Recoup {
        amount: Amount,
        timestamp: Timestamp,
        reserve_pub: ReservePublicKey,
        exchange_pub: ExchangePublicKey,
        exchange_sig: EddsaSignature,
    },
    #[serde(rename = "RECOUP-REFRESH")]
    RecoupRefresh {
        amount: Amount,
        timestamp: Timestamp,
        old_coin_pub: CoinPublicKey,
        exchange_pub: ExchangePublicKey,
        exchange_sig: EddsaSignature,
    },
    #[serde(rename = "OLD-COIN-RECOUP")]
    OldCoinRecoup {
        amount: Amount,
        timestamp: Timestamp,
        coin_pub: CoinPublicKey,
        exchange_pub: ExchangePublicKey,
        exchange_sig: EddsaSignature,
    },
}

/// Result of replaying a coin history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinHistorySummary {
    /// Debits minus credits
    pub total_spent: Amount,
    /// Denomination hashes the coin was used under
    pub denominations: Vec<HashCode>,
}

fn proof_invalid(what: &str) -> ProtocolError {
    error!("Conflict proof contains an invalid {}", what);
    ProtocolError::ProofInvalid(format!("invalid {} in history", what))
}

fn check_exchange_sig<R: SignedRecord>(
    keys: &KeySet,
    record: &R,
    exchange_pub: &ExchangePublicKey,
    exchange_sig: &EddsaSignature,
) -> Result<()> {
    if keys.signing_key(exchange_pub).is_none() {
        return Err(ProtocolError::ProofInvalid(format!(
            "history signed by unknown exchange key {}",
            exchange_pub.short()
        )));
    }
    record
        .verify(exchange_pub, exchange_sig)
        .map_err(|_| proof_invalid("exchange signature"))
}

/// Replay a coin history, verifying every entry
pub fn verify_coin_history(
    keys: &KeySet,
    denom: &DenominationInfo,
    coin_pub: &CoinPublicKey,
    history: &[Value],
) -> Result<CoinHistorySummary> {
    let currency = denom.value.currency();
    let mut debits = Amount::zero(currency);
    let mut credits = Amount::zero(currency);
    let mut denominations = Vec::new();

    let add = |acc: &mut Amount, amount: &Amount| -> Result<()> {
        *acc = acc
            .checked_add(amount)
            .map_err(|e| ProtocolError::ProofInvalid(format!("history total: {}", e)))?;
        Ok(())
    };

    for raw in history {
        let entry: CoinHistoryEntry = parse(raw, "coin history entry")?;
        match &entry {
            CoinHistoryEntry::Deposit {
                amount,
                deposit_fee,
                h_contract_terms,
                h_wire,
                h_denom_pub,
                timestamp,
                refund_deadline,
                merchant_pub,
                coin_sig,
            } => {
                DepositRequestPS {
                    h_contract_terms: *h_contract_terms,
                    h_wire: *h_wire,
                    h_denom_pub: *h_denom_pub,
                    wallet_timestamp: *timestamp,
                    refund_deadline: *refund_deadline,
                    amount_with_fee: *amount,
                    deposit_fee: *deposit_fee,
                    merchant: *merchant_pub,
                    coin_pub: *coin_pub,
                }
                .verify(coin_pub, coin_sig)
                .map_err(|_| proof_invalid("deposit signature"))?;
                denominations.push(*h_denom_pub);
                add(&mut debits, amount)?;
            }
            CoinHistoryEntry::Melt {
                amount,
                melt_fee,
                rc,
                h_denom_pub,
                coin_sig,
            } => {
                MeltCommitmentPS {
                    rc: *rc,
                    h_denom_pub: *h_denom_pub,
                    amount_with_fee: *amount,
                    melt_fee: *melt_fee,
                    coin_pub: *coin_pub,
                }
                .verify(coin_pub, coin_sig)
                .map_err(|_| proof_invalid("melt signature"))?;
                denominations.push(*h_denom_pub);
                add(&mut debits, amount)?;
            }
            CoinHistoryEntry::Refund {
                amount,
                refund_fee,
                h_contract_terms,
                merchant_pub,
                rtransaction_id,
                merchant_sig,
            } => {
                RefundPS {
                    h_contract_terms: *h_contract_terms,
                    coin_pub: *coin_pub,
                    merchant: *merchant_pub,
                    rtransaction_id: *rtransaction_id,
                    refund_amount: *amount,
                    refund_fee: *refund_fee,
                }
                .verify(merchant_pub, merchant_sig)
                .map_err(|_| proof_invalid("refund signature"))?;
                let net = amount
                    .checked_sub(refund_fee)
                    .map_err(|_| ProtocolError::ProofInvalid("refund fee exceeds refund".into()))?;
                add(&mut credits, &net)?;
            }
            CoinHistoryEntry::Recoup {
                amount,
                timestamp,
                reserve_pub,
                exchange_pub,
                exchange_sig,
            } => {
                let record = RecoupConfirmationPS {
                    timestamp: *timestamp,
                    recoup_amount: *amount,
                    coin_pub: *coin_pub,
                    reserve_pub: *reserve_pub,
                };
                check_exchange_sig(keys, &record, exchange_pub, exchange_sig)?;
                add(&mut debits, amount)?;
            }
            CoinHistoryEntry::RecoupRefresh {
                amount,
                timestamp,
                old_coin_pub,
                exchange_pub,
                exchange_sig,
            } => {
                let record = RecoupRefreshConfirmationPS {
                    timestamp: *timestamp,
                    recoup_amount: *amount,
                    coin_pub: *coin_pub,
                    old_coin_pub: *old_coin_pub,
                };
                check_exchange_sig(keys, &record, exchange_pub, exchange_sig)?;
                add(&mut debits, amount)?;
            }
            CoinHistoryEntry::OldCoinRecoup {
                amount,
                timestamp,
                coin_pub: new_coin_pub,
                exchange_pub,
                exchange_sig,
            } => {
                let record = RecoupRefreshConfirmationPS {
                    timestamp: *timestamp,
                    recoup_amount: *amount,
                    coin_pub: *new_coin_pub,
                    old_coin_pub: *coin_pub,
                };
                check_exchange_sig(keys, &record, exchange_pub, exchange_sig)?;
                add(&mut credits, amount)?;
            }
        }
    }

    let total_spent = debits
        .checked_sub(&credits)
        .map_err(|_| ProtocolError::ProofInvalid("history credits exceed debits".to_string()))?;
    debug!(
        "Replayed {} history entries for coin {}: spent {}",
        history.len(),
        coin_pub.short(),
        total_spent
    );
    Ok(CoinHistorySummary {
        total_spent,
        denominations,
    })
}

/// Check that a coin history justifies refusing to spend `amount`
///
/// The proof holds if spending `amount` on top of the history would exceed
/// the denomination value, or if the history binds the coin to another
/// denomination. Returns the replayed total on success and `ProofInvalid`
/// otherwise.
pub fn verify_double_spending_proof(
    keys: &KeySet,
    denom: &DenominationInfo,
    coin_pub: &CoinPublicKey,
    amount: &Amount,
    history: &[Value],
) -> Result<Amount> {
    let summary = verify_coin_history(keys, denom, coin_pub, history)?;

    if summary.denominations.iter().any(|h| *h != denom.h_key) {
        debug!("Coin {} was used under another denomination", coin_pub.short());
        return Ok(summary.total_spent);
    }

    let with_new = summary
        .total_spent
        .checked_add(amount)
        .map_err(|e| ProtocolError::ProofInvalid(e.to_string()))?;
    if with_new > denom.value {
        return Ok(summary.total_spent);
    }
    error!(
        "Exchange claims a double spend of coin {} but history only spends {}",
        coin_pub.short(),
        summary.total_spent
    );
    Err(ProtocolError::ProofInvalid(format!(
        "history spends {} of {}, request for {} fits",
        summary.total_spent, denom.value, amount
    )))
}

/// One entry of a reserve's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReserveHistoryEntry {
    /// Incoming wire transfer, vouched for by the exchange's bank
    #[serde(rename = "CREDIT")]
    Credit {
        amount: Amount,
        sender_account_url: String,
        wire_reference: String,
        timestamp: Timestamp,
    },
    #[serde(rename = "WITHDRAW")]
    Withdraw {
        amount: Amount,
        withdraw_fee: Amount,
        h_denom_pub: HashCode,
        h_coin_envelope: HashCode,
        reserve_sig: EddsaSignature,
    },
    #[serde(rename = "RECOUP")]
    Recoup {
        amount: Amount,
        timestamp: Timestamp,
        coin_pub: CoinPublicKey,
        exchange_pub: ExchangePublicKey,
        exchange_sig: EddsaSignature,
    },
    #[serde(rename = "CLOSING")]
    Closing {
        amount: Amount,
        closing_fee: Amount,
        timestamp: Timestamp,
        h_wire: HashCode,
        exchange_pub: ExchangePublicKey,
        exchange_sig: EddsaSignature,
    },
}

/// Replay a reserve history and return the remaining balance
pub fn verify_reserve_history(
    keys: &KeySet,
    reserve_pub: &ReservePublicKey,
    currency: coinage_core::Currency,
    history: &[Value],
) -> Result<Amount> {
    let mut credits = Amount::zero(currency);
    let mut debits = Amount::zero(currency);
    let add = |acc: &mut Amount, amount: &Amount| -> Result<()> {
        *acc = acc
            .checked_add(amount)
            .map_err(|e| ProtocolError::ProofInvalid(format!("reserve total: {}", e)))?;
        Ok(())
    };

    for raw in history {
        let entry: ReserveHistoryEntry = parse(raw, "reserve history entry")?;
        match &entry {
            ReserveHistoryEntry::Credit { amount, .. } => add(&mut credits, amount)?,
            ReserveHistoryEntry::Withdraw {
                amount,
                withdraw_fee: _,
                h_denom_pub,
                h_coin_envelope,
                reserve_sig,
            } => {
                WithdrawRequestPS {
                    reserve_pub: *reserve_pub,
                    amount_with_fee: *amount,
                    h_denom_pub: *h_denom_pub,
                    h_coin_envelope: *h_coin_envelope,
                }
                .verify(reserve_pub, reserve_sig)
                .map_err(|_| proof_invalid("withdraw signature"))?;
                add(&mut debits, amount)?;
            }
            ReserveHistoryEntry::Recoup {
                amount,
                timestamp,
                coin_pub,
                exchange_pub,
                exchange_sig,
            } => {
                let record = RecoupConfirmationPS {
                    timestamp: *timestamp,
                    recoup_amount: *amount,
                    coin_pub: *coin_pub,
                    reserve_pub: *reserve_pub,
                };
                check_exchange_sig(keys, &record, exchange_pub, exchange_sig)?;
                add(&mut credits, amount)?;
            }
            ReserveHistoryEntry::Closing {
                amount,
                closing_fee,
                timestamp,
                h_wire,
                exchange_pub,
                exchange_sig,
            } => {
                let record = ReserveClosedPS {
                    timestamp: *timestamp,
                    closing_amount: *amount,
                    closing_fee: *closing_fee,
                    reserve_pub: *reserve_pub,
                    h_wire: *h_wire,
                };
                check_exchange_sig(keys, &record, exchange_pub, exchange_sig)?;
                add(&mut debits, amount)?;
            }
        }
    }

    credits
        .checked_sub(&debits)
        .map_err(|_| ProtocolError::ProofInvalid("reserve history overdrawn".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{kudos, KeyFixture};
    use coinage_core::{CoinPrivateKey, MerchantPrivateKey};
    use rand::rngs::OsRng;
    use serde_json::json;

    fn deposit_entry(
        coin: &CoinPrivateKey,
        h_denom_pub: HashCode,
        amount: &str,
        merchant: &MerchantPrivateKey,
    ) -> Value {
        let record = DepositRequestPS {
            h_contract_terms: HashCode::of(b"contract"),
            h_wire: HashCode::of(b"wire"),
            h_denom_pub,
            wallet_timestamp: Timestamp::from_secs(1),
            refund_deadline: Timestamp::from_secs(2),
            amount_with_fee: kudos(amount),
            deposit_fee: kudos("0.01"),
            merchant: merchant.public_key(),
            coin_pub: coin.public_key(),
        };
        serde_json::to_value(CoinHistoryEntry::Deposit {
            amount: record.amount_with_fee,
            deposit_fee: record.deposit_fee,
            h_contract_terms: record.h_contract_terms,
            h_wire: record.h_wire,
            h_denom_pub,
            timestamp: record.wallet_timestamp,
            refund_deadline: record.refund_deadline,
            merchant_pub: record.merchant,
            coin_sig: record.sign(coin),
        })
        .unwrap()
    }

    fn setup() -> (KeyFixture, KeySet) {
        let fx = KeyFixture::new(2);
        let keys = KeySet::default().merge(&fx.response(), true).unwrap();
        (fx, keys)
    }

    #[test]
    fn test_double_spend_proof_holds() {
        let (_fx, keys) = setup();
        let denom = keys.denominations[1].clone(); // KUDOS:2
        let coin = CoinPrivateKey::generate(&mut OsRng);
        let merchant = MerchantPrivateKey::generate(&mut OsRng);
        let history = vec![deposit_entry(&coin, denom.h_key, "1.5", &merchant)];

        let spent = verify_double_spending_proof(
            &keys,
            &denom,
            &coin.public_key(),
            &kudos("1"),
            &history,
        )
        .unwrap();
        assert_eq!(spent, kudos("1.5"));
    }

    #[test]
    fn test_proof_that_leaves_room_is_invalid() {
        let (_fx, keys) = setup();
        let denom = keys.denominations[1].clone();
        let coin = CoinPrivateKey::generate(&mut OsRng);
        let merchant = MerchantPrivateKey::generate(&mut OsRng);
        let history = vec![deposit_entry(&coin, denom.h_key, "0.5", &merchant)];

        assert!(matches!(
            verify_double_spending_proof(&keys, &denom, &coin.public_key(), &kudos("1"), &history),
            Err(ProtocolError::ProofInvalid(_))
        ));
    }

    #[test]
    fn test_conflicting_denomination_proof_holds() {
        let (_fx, keys) = setup();
        let denom = keys.denominations[1].clone();
        let other = keys.denominations[0].h_key;
        let coin = CoinPrivateKey::generate(&mut OsRng);
        let merchant = MerchantPrivateKey::generate(&mut OsRng);
        let history = vec![deposit_entry(&coin, other, "0.1", &merchant)];

        assert!(verify_double_spending_proof(
            &keys,
            &denom,
            &coin.public_key(),
            &kudos("0.1"),
            &history
        )
        .is_ok());
    }

    #[test]
    fn test_refund_credits_net_of_fee() {
        let (_fx, keys) = setup();
        let denom = keys.denominations[1].clone();
        let coin = CoinPrivateKey::generate(&mut OsRng);
        let merchant = MerchantPrivateKey::generate(&mut OsRng);
        let refund = RefundPS {
            h_contract_terms: HashCode::of(b"contract"),
            coin_pub: coin.public_key(),
            merchant: merchant.public_key(),
            rtransaction_id: 1,
            refund_amount: kudos("1"),
            refund_fee: kudos("0.01"),
        };
        let history = vec![
            deposit_entry(&coin, denom.h_key, "1.5", &merchant),
            serde_json::to_value(CoinHistoryEntry::Refund {
                amount: refund.refund_amount,
                refund_fee: refund.refund_fee,
                h_contract_terms: refund.h_contract_terms,
                merchant_pub: refund.merchant,
                rtransaction_id: 1,
                merchant_sig: refund.sign(&merchant),
            })
            .unwrap(),
        ];
        let summary = verify_coin_history(&keys, &denom, &coin.public_key(), &history).unwrap();
        assert_eq!(summary.total_spent, kudos("0.51"));
    }

    #[test]
    fn test_forged_entry_and_unknown_type() {
        let (_fx, keys) = setup();
        let denom = keys.denominations[1].clone();
        let coin = CoinPrivateKey::generate(&mut OsRng);
        let other_coin = CoinPrivateKey::generate(&mut OsRng);
        let merchant = MerchantPrivateKey::generate(&mut OsRng);

        let forged = vec![deposit_entry(&other_coin, denom.h_key, "2", &merchant)];
        assert!(matches!(
            verify_coin_history(&keys, &denom, &coin.public_key(), &forged),
            Err(ProtocolError::ProofInvalid(_))
        ));

        let unknown = vec![json!({"type": "GIFT", "amount": "KUDOS:1"})];
        assert!(matches!(
            verify_coin_history(&keys, &denom, &coin.public_key(), &unknown),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_reserve_history_balance() {
        let (fx, keys) = setup();
        let reserve = coinage_core::ReservePrivateKey::generate(&mut OsRng);
        let withdraw = WithdrawRequestPS {
            reserve_pub: reserve.public_key(),
            amount_with_fee: kudos("1.01"),
            h_denom_pub: keys.denominations[0].h_key,
            h_coin_envelope: HashCode::of(b"ev"),
        };
        let history = vec![
            serde_json::to_value(ReserveHistoryEntry::Credit {
                amount: kudos("5"),
                sender_account_url: "payto://iban/DE89370400440532013000".to_string(),
                wire_reference: "1".to_string(),
                timestamp: fx.now,
            })
            .unwrap(),
            serde_json::to_value(ReserveHistoryEntry::Withdraw {
                amount: withdraw.amount_with_fee,
                withdraw_fee: kudos("0.01"),
                h_denom_pub: withdraw.h_denom_pub,
                h_coin_envelope: withdraw.h_coin_envelope,
                reserve_sig: withdraw.sign(&reserve),
            })
            .unwrap(),
        ];
        let balance = verify_reserve_history(
            &keys,
            &reserve.public_key(),
            kudos("0").currency(),
            &history,
        )
        .unwrap();
        assert_eq!(balance, kudos("3.99"));
    }
}
