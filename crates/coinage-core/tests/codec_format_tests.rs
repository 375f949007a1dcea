//! Byte-layout tests for the signed record formats

use coinage_core::codec::{
    DenomKeyValidityPS, DepositRequestPS, ExchangeKeySetPS, LinkDataPS, MeltCommitmentPS,
    MeltConfirmationPS, RecoupRequestPS, RefundPS, SignKeyValidityPS, SignedRecord,
    WithdrawRequestPS, RECORD_HEADER_SIZE,
};
use coinage_core::{
    Amount, BlindingKeySecret, EddsaPublicKey, HashCode, Purpose, Timestamp, TransferPublicKey,
};

const HASH: usize = 64;
const KEY: usize = 32;
const AMOUNT: usize = 24;
const TIME: usize = 8;

fn kudos(s: &str) -> Amount {
    format!("KUDOS:{}", s).parse().unwrap()
}

fn key(b: u8) -> EddsaPublicKey {
    EddsaPublicKey::new([b; 32])
}

fn header(bytes: &[u8]) -> (u32, u32) {
    (
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
    )
}

#[test]
fn test_deposit_request_layout() {
    let record = DepositRequestPS {
        h_contract_terms: HashCode::of(b"c"),
        h_wire: HashCode::of(b"w"),
        h_denom_pub: HashCode::of(b"d"),
        wallet_timestamp: Timestamp::from_secs(10),
        refund_deadline: Timestamp::from_secs(20),
        amount_with_fee: kudos("5"),
        deposit_fee: kudos("0.01"),
        merchant: key(1),
        coin_pub: key(2),
    };
    let bytes = record.encode();
    let size = RECORD_HEADER_SIZE + 3 * HASH + 2 * TIME + 2 * AMOUNT + 2 * KEY;
    assert_eq!(header(&bytes), (size as u32, 1201));

    // Coin key is the final field
    assert_eq!(&bytes[size - KEY..], &[2u8; 32]);
    // Wallet timestamp follows the three hashes
    let ts_offset = RECORD_HEADER_SIZE + 3 * HASH;
    assert_eq!(&bytes[ts_offset..ts_offset + TIME], &10_000_000u64.to_be_bytes());
}

#[test]
fn test_purpose_codes() {
    let rc = HashCode::of(b"rc");
    let cases: Vec<(Vec<u8>, Purpose, usize)> = vec![
        (
            SignKeyValidityPS {
                master_public_key: key(1),
                start: Timestamp::from_secs(1),
                expire: Timestamp::from_secs(2),
                end: Timestamp::from_secs(3),
                signkey_pub: key(2),
            }
            .encode(),
            Purpose::MasterSigningKeyValidity,
            2 * KEY + 3 * TIME,
        ),
        (
            DenomKeyValidityPS {
                master: key(1),
                start: Timestamp::from_secs(1),
                expire_withdraw: Timestamp::from_secs(2),
                expire_deposit: Timestamp::from_secs(3),
                expire_legal: Timestamp::from_secs(4),
                value: kudos("1"),
                fee_withdraw: kudos("0"),
                fee_deposit: kudos("0"),
                fee_refresh: kudos("0"),
                fee_refund: kudos("0"),
                denom_hash: HashCode::of(b"denom"),
            }
            .encode(),
            Purpose::MasterDenominationKeyValidity,
            KEY + 4 * TIME + 5 * AMOUNT + HASH,
        ),
        (
            ExchangeKeySetPS {
                list_issue_date: Timestamp::from_secs(5),
                hc: HashCode::of(b"hc"),
            }
            .encode(),
            Purpose::ExchangeKeySet,
            TIME + HASH,
        ),
        (
            WithdrawRequestPS {
                reserve_pub: key(3),
                amount_with_fee: kudos("1.01"),
                h_denom_pub: HashCode::of(b"d"),
                h_coin_envelope: HashCode::of(b"ev"),
            }
            .encode(),
            Purpose::WalletReserveWithdraw,
            KEY + AMOUNT + 2 * HASH,
        ),
        (
            MeltCommitmentPS {
                rc,
                h_denom_pub: HashCode::of(b"d"),
                amount_with_fee: kudos("2"),
                melt_fee: kudos("0.1"),
                coin_pub: key(4),
            }
            .encode(),
            Purpose::WalletCoinMelt,
            2 * HASH + 2 * AMOUNT + KEY,
        ),
        (
            MeltConfirmationPS {
                rc,
                noreveal_index: 2,
            }
            .encode(),
            Purpose::ExchangeConfirmMelt,
            HASH + 4,
        ),
        (
            LinkDataPS {
                old_coin_pub: key(5),
                h_denom_pub: HashCode::of(b"d"),
                transfer_pub: TransferPublicKey([6u8; 32]),
                coin_envelope_hash: HashCode::of(b"ev"),
            }
            .encode(),
            Purpose::WalletCoinLink,
            2 * KEY + 2 * HASH,
        ),
        (
            RecoupRequestPS {
                coin_pub: key(7),
                h_denom_pub: HashCode::of(b"d"),
                coin_blind: BlindingKeySecret([8u8; 32]),
            }
            .encode(),
            Purpose::WalletCoinRecoup,
            2 * KEY + HASH,
        ),
        (
            RefundPS {
                h_contract_terms: HashCode::of(b"c"),
                coin_pub: key(7),
                merchant: key(8),
                rtransaction_id: 1,
                refund_amount: kudos("1"),
                refund_fee: kudos("0.01"),
            }
            .encode(),
            Purpose::MerchantRefund,
            HASH + 2 * KEY + 8 + 2 * AMOUNT,
        ),
    ];

    for (bytes, purpose, body) in cases {
        let (size, code) = header(&bytes);
        assert_eq!(code, purpose.as_u32(), "{:?}", purpose);
        assert_eq!(size as usize, RECORD_HEADER_SIZE + body, "{:?}", purpose);
        assert_eq!(bytes.len(), size as usize, "{:?}", purpose);
    }
}

#[test]
fn test_melt_confirmation_index_encoding() {
    let bytes = MeltConfirmationPS {
        rc: HashCode::zero(),
        noreveal_index: 2,
    }
    .encode();
    assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 2]);
    let decoded = MeltConfirmationPS::decode(&bytes).unwrap();
    assert_eq!(decoded.noreveal_index, 2);
}

#[test]
fn test_decode_rejects_bad_currency_padding() {
    let record = WithdrawRequestPS {
        reserve_pub: key(3),
        amount_with_fee: kudos("1"),
        h_denom_pub: HashCode::of(b"d"),
        h_coin_envelope: HashCode::of(b"ev"),
    };
    let mut bytes = record.encode();
    // Last byte of the currency field
    let offset = RECORD_HEADER_SIZE + KEY + AMOUNT - 1;
    bytes[offset] = b'X';
    assert!(WithdrawRequestPS::decode(&bytes).is_err());
}
