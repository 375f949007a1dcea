//! File-backed deposit audit passes

use std::path::Path;

use coinage_auditor::{
    append_json_line, DepositConfirmationChecker, ExchangeDeposit, JsonLinesConfirmations,
    JsonLinesDeposits, ProgressStore, StoredConfirmation,
};
use coinage_client::DepositConfirmationReport;
use coinage_core::{
    Amount, CoinPrivateKey, Currency, EddsaSignature, ExchangePrivateKey, HashCode,
    MasterPrivateKey, MasterPublicKey, MerchantPrivateKey, Timestamp,
};

fn kudos(s: &str) -> Amount {
    format!("KUDOS:{}", s).parse().unwrap()
}

fn master() -> MasterPublicKey {
    MasterPrivateKey::from_bytes([7u8; 32]).public_key()
}

fn stored(row_id: u64) -> StoredConfirmation {
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&row_id.to_be_bytes());
    seed[31] = 0xc0;
    let at = Timestamp::from_secs(1_700_000_000 + row_id * 60);
    StoredConfirmation {
        row_id,
        report: DepositConfirmationReport {
            h_wire: HashCode::of(b"payto://iban/DE89370400440532013000\0salt"),
            h_contract_terms: HashCode::of(format!("order-{}", row_id).as_bytes()),
            exchange_timestamp: at,
            refund_deadline: at,
            amount_without_fee: kudos("0.5"),
            coin_pub: CoinPrivateKey::from_bytes(seed).public_key(),
            merchant_pub: MerchantPrivateKey::from_bytes([8u8; 32]).public_key(),
            exchange_sig: EddsaSignature::new([0u8; 64]),
            exchange_pub: ExchangePrivateKey::from_bytes([9u8; 32]).public_key(),
            master_pub: master(),
            ep_start: Timestamp::from_secs(1_600_000_000),
            ep_expire: Timestamp::from_secs(1_800_000_000),
            ep_end: Timestamp::from_secs(1_900_000_000),
            master_sig: EddsaSignature::new([0u8; 64]),
        },
    }
}

fn exchange_side(c: &StoredConfirmation) -> ExchangeDeposit {
    ExchangeDeposit {
        coin_pub: c.report.coin_pub,
        h_contract_terms: c.report.h_contract_terms,
        merchant_pub: c.report.merchant_pub,
        h_wire: c.report.h_wire,
        refund_deadline: c.report.refund_deadline,
        exchange_timestamp: c.report.exchange_timestamp,
        amount_with_fee: kudos("0.51"),
    }
}

fn run_pass(dir: &Path) -> coinage_auditor::DepositCheckReport {
    let store = ProgressStore::new(dir.join("progress.json"));
    let confirmations = JsonLinesConfirmations::new(dir.join("merchant.jsonl"));
    let deposits = JsonLinesDeposits::open(&dir.join("exchange.jsonl")).unwrap();
    let checker = DepositConfirmationChecker::new(
        master(),
        Currency::new("KUDOS").unwrap(),
        &confirmations,
        &deposits,
    );
    let report = checker.run(store.load().unwrap()).unwrap();
    store.save(&report.progress).unwrap();
    report
}

#[test]
fn test_one_missing_out_of_hundred() {
    let dir = tempfile::tempdir().unwrap();
    let merchant = dir.path().join("merchant.jsonl");
    let exchange = dir.path().join("exchange.jsonl");

    for row in 1..=100 {
        let c = stored(row);
        append_json_line(&merchant, &c).unwrap();
        if row != 57 {
            append_json_line(&exchange, &exchange_side(&c)).unwrap();
        }
    }

    let report = run_pass(dir.path());
    assert_eq!(report.rows_checked, 100);
    assert_eq!(report.missed_count, 1);
    assert_eq!(report.missed_amount, kudos("0.5"));
    assert_eq!(report.missing[0].row_id, 57);
    assert_eq!(report.progress.last_row_id, 56);

    // Still missing on the next pass, which only looks from row 57 on
    let report = run_pass(dir.path());
    assert_eq!(report.rows_checked, 44);
    assert_eq!(report.missed_count, 1);
    assert_eq!(report.progress.last_row_id, 56);

    // Once the exchange records the deposit, the pass completes
    append_json_line(&exchange, &exchange_side(&stored(57))).unwrap();
    let report = run_pass(dir.path());
    assert_eq!(report.missed_count, 0);
    assert_eq!(report.progress.last_row_id, 100);

    let report = run_pass(dir.path());
    assert_eq!(report.rows_checked, 0);
    assert_eq!(report.progress.last_row_id, 100);
}

#[test]
fn test_unreadable_ledger_keeps_progress() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProgressStore::new(dir.path().join("progress.json"));
    store
        .save(&coinage_auditor::ProgressMarker { last_row_id: 12 })
        .unwrap();

    let deposits_path = dir.path().join("exchange.jsonl");
    std::fs::write(&deposits_path, "").unwrap();
    let deposits = JsonLinesDeposits::open(&deposits_path).unwrap();
    assert!(deposits.is_empty());

    // The merchant ledger does not exist
    let confirmations = JsonLinesConfirmations::new(dir.path().join("missing.jsonl"));
    let checker = DepositConfirmationChecker::new(
        master(),
        Currency::new("KUDOS").unwrap(),
        &confirmations,
        &deposits,
    );
    assert!(checker.run(store.load().unwrap()).is_err());
    assert_eq!(store.load().unwrap().last_row_id, 12);
}
