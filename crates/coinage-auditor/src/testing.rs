//! Ledger fixtures for unit tests

use coinage_client::DepositConfirmationReport;
use coinage_core::{
    Amount, CoinPrivateKey, EddsaSignature, ExchangePrivateKey, HashCode, MasterPrivateKey,
    MerchantPrivateKey, Timestamp,
};

use crate::ledger::{ExchangeDeposit, StoredConfirmation};

pub fn kudos(s: &str) -> Amount {
    format!("KUDOS:{}", s).parse().unwrap()
}

/// Confirmation of 1 KUDOS on row `row_id`, one coin per row
pub fn confirmation(row_id: u64) -> StoredConfirmation {
    let master = MasterPrivateKey::from_bytes([1u8; 32]).public_key();
    let exchange = ExchangePrivateKey::from_bytes([2u8; 32]).public_key();
    let merchant = MerchantPrivateKey::from_bytes([3u8; 32]).public_key();
    let mut coin_seed = [4u8; 32];
    coin_seed[..8].copy_from_slice(&row_id.to_be_bytes());
    let coin_pub = CoinPrivateKey::from_bytes(coin_seed).public_key();
    let at = Timestamp::from_secs(1_700_000_000 + row_id);

    StoredConfirmation {
        row_id,
        report: DepositConfirmationReport {
            h_wire: HashCode::of(b"payto://iban/DE89370400440532013000"),
            h_contract_terms: HashCode::of(&row_id.to_be_bytes()),
            exchange_timestamp: at,
            refund_deadline: at,
            amount_without_fee: kudos("1"),
            coin_pub,
            merchant_pub: merchant,
            exchange_sig: EddsaSignature::new([0u8; 64]),
            exchange_pub: exchange,
            master_pub: master,
            ep_start: Timestamp::from_secs(1_600_000_000),
            ep_expire: Timestamp::from_secs(1_800_000_000),
            ep_end: Timestamp::from_secs(1_900_000_000),
            master_sig: EddsaSignature::new([0u8; 64]),
        },
    }
}

/// The exchange-side record matching `stored`
pub fn deposit_for(stored: &StoredConfirmation) -> ExchangeDeposit {
    let r = &stored.report;
    ExchangeDeposit {
        coin_pub: r.coin_pub,
        h_contract_terms: r.h_contract_terms,
        merchant_pub: r.merchant_pub,
        h_wire: r.h_wire,
        refund_deadline: r.refund_deadline,
        exchange_timestamp: r.exchange_timestamp,
        amount_with_fee: kudos("1.01"),
    }
}
