//! Property-based tests for coinage-core using proptest
//!
//! These tests verify invariants that should hold for all valid inputs.

use proptest::prelude::*;
use coinage_core::{
    codec::{DepositConfirmationPS, DepositRequestPS, SignedRecord},
    Amount, CoreError, EddsaPrivateKey, EddsaPublicKey, HashCode, Timestamp, FRACTION_BASE,
    MAX_AMOUNT_VALUE,
};

// ============================================
// Arbitrary Implementations
// ============================================

fn arb_amount() -> impl Strategy<Value = Amount> {
    (0u64..=MAX_AMOUNT_VALUE / 4, 0u32..FRACTION_BASE)
        .prop_map(|(value, fraction)| Amount::new("KUDOS", value, fraction).unwrap())
}

fn arb_hash() -> impl Strategy<Value = HashCode> {
    any::<[u8; 32]>().prop_map(|seed| HashCode::of(&seed))
}

fn arb_key() -> impl Strategy<Value = EddsaPrivateKey> {
    any::<[u8; 32]>().prop_map(EddsaPrivateKey::from_bytes)
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    (0u64..4_000_000_000).prop_map(Timestamp::from_secs)
}

fn arb_confirmation() -> impl Strategy<Value = DepositConfirmationPS> {
    (
        arb_hash(),
        arb_hash(),
        arb_timestamp(),
        arb_timestamp(),
        arb_amount(),
        any::<[u8; 32]>(),
        any::<[u8; 32]>(),
    )
        .prop_map(|(contract, wire, ts, refund, amount, coin, merchant)| {
            DepositConfirmationPS {
                h_contract_terms: contract,
                h_wire: wire,
                exchange_timestamp: ts,
                refund_deadline: refund,
                amount_without_fee: amount,
                coin_pub: EddsaPublicKey::new(coin),
                merchant: EddsaPublicKey::new(merchant),
            }
        })
}

// ============================================
// Amount Properties
// ============================================

proptest! {
    #[test]
    fn amount_add_is_commutative(a in arb_amount(), b in arb_amount()) {
        prop_assert_eq!(a.checked_add(&b).unwrap(), b.checked_add(&a).unwrap());
    }

    #[test]
    fn amount_sub_undoes_add(a in arb_amount(), b in arb_amount()) {
        let sum = a.checked_add(&b).unwrap();
        prop_assert_eq!(sum.checked_sub(&b).unwrap(), a);
    }

    #[test]
    fn amount_sub_never_goes_negative(a in arb_amount(), b in arb_amount()) {
        match a.checked_sub(&b) {
            Ok(diff) => prop_assert!(b <= a && diff <= a),
            Err(e) => {
                prop_assert_eq!(e, CoreError::AmountNegative);
                prop_assert!(a < b);
            }
        }
    }

    #[test]
    fn amount_string_form_is_canonical(a in arb_amount()) {
        let text = a.to_string();
        let parsed: Amount = text.parse().unwrap();
        prop_assert_eq!(parsed, a);
        prop_assert!(!text.ends_with('0') || !text.contains('.'));
    }

    #[test]
    fn fee_is_conserved(total in arb_amount(), fee in arb_amount()) {
        prop_assume!(fee <= total);
        let net = total.checked_sub(&fee).unwrap();
        prop_assert_eq!(net.checked_add(&fee).unwrap(), total);
    }
}

// ============================================
// Codec Properties
// ============================================

proptest! {
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..400)) {
        let _ = DepositConfirmationPS::decode(&bytes);
        let _ = DepositRequestPS::decode(&bytes);
    }

    #[test]
    fn encoded_size_matches_header(record in arb_confirmation()) {
        let bytes = record.encode();
        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        prop_assert_eq!(declared, bytes.len());
        prop_assert_eq!(DepositConfirmationPS::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn single_bit_flip_breaks_signature(
        record in arb_confirmation(),
        key in arb_key(),
        bit in 0usize..(8 * 64),
    ) {
        let mut sig = record.sign(&key);
        prop_assert!(record.verify(&key.public_key(), &sig).is_ok());
        sig.0[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(record.verify(&key.public_key(), &sig).is_err());
    }

    #[test]
    fn single_bit_flip_in_record_breaks_signature(
        record in arb_confirmation(),
        key in arb_key(),
        byte in 8usize..200,
    ) {
        let sig = record.sign(&key);
        let mut bytes = record.encode();
        let index = byte % bytes.len();
        bytes[index] ^= 0x01;
        prop_assert!(key.public_key().verify(&bytes, &sig).is_err());
    }
}
