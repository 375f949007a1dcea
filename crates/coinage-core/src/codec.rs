//! Purpose-tagged signed records
//!
//! Every EdDSA signature in the protocol covers a fixed-layout record in
//! network byte order:
//!
//! ```text
//! OFFSET  SIZE  FIELD
//! 0x00    4     size of the whole record, header included (big endian)
//! 0x04    4     purpose (big endian)
//! 0x08    ...   body, fields in declaration order
//! ```
//!
//! Field encodings: hashes 64 bytes, EdDSA and transfer keys 32 bytes,
//! amounts 24 bytes (see [`crate::amount`]), timestamps and durations
//! 8 bytes, integers big endian at their natural width.

use crate::amount::{Amount, AMOUNT_BYTES};
use crate::blind::BlindingKeySecret;
use crate::crypto::{EddsaPrivateKey, EddsaPublicKey, EddsaSignature, TransferPublicKey};
use crate::error::{CoreError, Result};
use crate::time::{RelativeTime, Timestamp};
use crate::types::{HashCode, HASH_SIZE};

/// Size of the record header
pub const RECORD_HEADER_SIZE: usize = 8;

/// Signature purposes, one per record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Purpose {
    MasterSigningKeyValidity = 1024,
    MasterDenominationKeyValidity = 1025,
    ExchangeConfirmDeposit = 1033,
    ExchangeConfirmMelt = 1034,
    ExchangeKeySet = 1035,
    ExchangeReserveClosed = 1038,
    ExchangeConfirmRecoup = 1039,
    ExchangeConfirmRecoupRefresh = 1041,
    AuditorDenominationValidity = 1064,
    MerchantRefund = 1102,
    WalletReserveWithdraw = 1200,
    WalletCoinDeposit = 1201,
    WalletCoinMelt = 1202,
    WalletCoinRecoup = 1203,
    WalletCoinLink = 1204,
}

impl Purpose {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        use Purpose::*;
        [
            MasterSigningKeyValidity,
            MasterDenominationKeyValidity,
            ExchangeConfirmDeposit,
            ExchangeConfirmMelt,
            ExchangeKeySet,
            ExchangeReserveClosed,
            ExchangeConfirmRecoup,
            ExchangeConfirmRecoupRefresh,
            AuditorDenominationValidity,
            MerchantRefund,
            WalletReserveWithdraw,
            WalletCoinDeposit,
            WalletCoinMelt,
            WalletCoinRecoup,
            WalletCoinLink,
        ]
        .into_iter()
        .find(|p| p.as_u32() == value)
    }
}

/// Append-only big endian record builder
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a record body
#[derive(Debug)]
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(CoreError::Truncated {
                need: end,
                have: self.data.len(),
            });
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail unless every byte was consumed
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(CoreError::SizeMismatch {
                declared: self.pos,
                actual: self.data.len(),
            });
        }
        Ok(())
    }
}

/// A fixed-width record field
pub trait Field: Sized {
    fn put(&self, w: &mut RecordWriter);
    fn take(r: &mut RecordReader<'_>) -> Result<Self>;
}

impl Field for u32 {
    fn put(&self, w: &mut RecordWriter) {
        w.put_u32(*self);
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        r.take_array().map(u32::from_be_bytes)
    }
}

impl Field for u64 {
    fn put(&self, w: &mut RecordWriter) {
        w.put_u64(*self);
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        r.take_array().map(u64::from_be_bytes)
    }
}

impl Field for HashCode {
    fn put(&self, w: &mut RecordWriter) {
        w.put_bytes(self.as_bytes());
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        r.take_array::<HASH_SIZE>().map(HashCode::new)
    }
}

impl Field for EddsaPublicKey {
    fn put(&self, w: &mut RecordWriter) {
        w.put_bytes(self.as_bytes());
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        r.take_array().map(EddsaPublicKey::new)
    }
}

impl Field for TransferPublicKey {
    fn put(&self, w: &mut RecordWriter) {
        w.put_bytes(self.as_bytes());
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        r.take_array().map(TransferPublicKey)
    }
}

impl Field for BlindingKeySecret {
    fn put(&self, w: &mut RecordWriter) {
        w.put_bytes(self.as_bytes());
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        r.take_array().map(BlindingKeySecret)
    }
}

impl Field for Amount {
    fn put(&self, w: &mut RecordWriter) {
        w.put_bytes(&self.to_bytes());
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        Amount::from_bytes(&r.take_array::<AMOUNT_BYTES>()?)
    }
}

impl Field for Timestamp {
    fn put(&self, w: &mut RecordWriter) {
        w.put_bytes(&self.to_bytes());
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        r.take_array().map(Timestamp::from_bytes)
    }
}

impl Field for RelativeTime {
    fn put(&self, w: &mut RecordWriter) {
        w.put_u64(self.as_micros());
    }

    fn take(r: &mut RecordReader<'_>) -> Result<Self> {
        u64::take(r).map(RelativeTime::from_micros)
    }
}

/// A record that is signed as a whole
pub trait SignedRecord: Sized {
    const PURPOSE: Purpose;

    fn write_body(&self, w: &mut RecordWriter);

    fn read_body(r: &mut RecordReader<'_>) -> Result<Self>;

    /// Header and body, the exact bytes that get signed
    fn encode(&self) -> Vec<u8> {
        let mut body = RecordWriter::new();
        self.write_body(&mut body);
        let body = body.into_bytes();

        let mut out = RecordWriter::new();
        out.put_u32((RECORD_HEADER_SIZE + body.len()) as u32);
        out.put_u32(Self::PURPOSE.as_u32());
        out.put_bytes(&body);
        out.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = RecordReader::new(bytes);
        let size = u32::take(&mut r)? as usize;
        if size != bytes.len() {
            return Err(CoreError::SizeMismatch {
                declared: size,
                actual: bytes.len(),
            });
        }
        let purpose = u32::take(&mut r)?;
        if purpose != Self::PURPOSE.as_u32() {
            return Err(CoreError::PurposeMismatch {
                expected: Self::PURPOSE.as_u32(),
                got: purpose,
            });
        }
        let record = Self::read_body(&mut r)?;
        r.finish()?;
        Ok(record)
    }

    fn sign(&self, key: &EddsaPrivateKey) -> EddsaSignature {
        key.sign(&self.encode())
    }

    fn verify(&self, key: &EddsaPublicKey, signature: &EddsaSignature) -> Result<()> {
        key.verify(&self.encode(), signature)
    }
}

macro_rules! signed_record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident : $purpose:ident {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl SignedRecord for $name {
            const PURPOSE: Purpose = Purpose::$purpose;

            fn write_body(&self, w: &mut RecordWriter) {
                $( Field::put(&self.$field, w); )*
            }

            fn read_body(r: &mut RecordReader<'_>) -> Result<Self> {
                Ok(Self {
                    $( $field: <$ty as Field>::take(r)?, )*
                })
            }
        }
    };
}

signed_record! {
    /// Master signature over an online signing key
    pub struct SignKeyValidityPS : MasterSigningKeyValidity {
        pub master_public_key: EddsaPublicKey,
        pub start: Timestamp,
        pub expire: Timestamp,
        pub end: Timestamp,
        pub signkey_pub: EddsaPublicKey,
    }
}

signed_record! {
    /// Master signature over a denomination and its fee structure
    pub struct DenomKeyValidityPS : MasterDenominationKeyValidity {
        pub master: EddsaPublicKey,
        pub start: Timestamp,
        pub expire_withdraw: Timestamp,
        pub expire_deposit: Timestamp,
        pub expire_legal: Timestamp,
        pub value: Amount,
        pub fee_withdraw: Amount,
        pub fee_deposit: Amount,
        pub fee_refresh: Amount,
        pub fee_refund: Amount,
        pub denom_hash: HashCode,
    }
}

signed_record! {
    /// Auditor attestation of a denomination
    pub struct AuditorDenomPS : AuditorDenominationValidity {
        /// SHA-512 of the auditor's base URL
        pub auditor_url_hash: HashCode,
        pub master: EddsaPublicKey,
        pub start: Timestamp,
        pub expire_withdraw: Timestamp,
        pub expire_deposit: Timestamp,
        pub expire_legal: Timestamp,
        pub value: Amount,
        pub fee_withdraw: Amount,
        pub fee_deposit: Amount,
        pub fee_refresh: Amount,
        pub fee_refund: Amount,
        pub denom_hash: HashCode,
    }
}

signed_record! {
    /// Exchange signature over one `/keys` response
    pub struct ExchangeKeySetPS : ExchangeKeySet {
        pub list_issue_date: Timestamp,
        /// Hash over the `h_key`s of the denominations in the response
        pub hc: HashCode,
    }
}

signed_record! {
    /// Reserve owner's authorization to withdraw one coin
    pub struct WithdrawRequestPS : WalletReserveWithdraw {
        pub reserve_pub: EddsaPublicKey,
        pub amount_with_fee: Amount,
        pub h_denom_pub: HashCode,
        pub h_coin_envelope: HashCode,
    }
}

signed_record! {
    /// Coin owner's deposit permission
    pub struct DepositRequestPS : WalletCoinDeposit {
        pub h_contract_terms: HashCode,
        pub h_wire: HashCode,
        pub h_denom_pub: HashCode,
        pub wallet_timestamp: Timestamp,
        pub refund_deadline: Timestamp,
        pub amount_with_fee: Amount,
        pub deposit_fee: Amount,
        pub merchant: EddsaPublicKey,
        pub coin_pub: EddsaPublicKey,
    }
}

signed_record! {
    /// Exchange confirmation of a deposit; covers the amount net of fee
    pub struct DepositConfirmationPS : ExchangeConfirmDeposit {
        pub h_contract_terms: HashCode,
        pub h_wire: HashCode,
        pub exchange_timestamp: Timestamp,
        pub refund_deadline: Timestamp,
        pub amount_without_fee: Amount,
        pub coin_pub: EddsaPublicKey,
        pub merchant: EddsaPublicKey,
    }
}

signed_record! {
    /// Coin owner's melt authorization, bound to the refresh commitment
    pub struct MeltCommitmentPS : WalletCoinMelt {
        pub rc: HashCode,
        pub h_denom_pub: HashCode,
        pub amount_with_fee: Amount,
        pub melt_fee: Amount,
        pub coin_pub: EddsaPublicKey,
    }
}

signed_record! {
    /// Exchange's choice of the branch the wallet must not reveal
    pub struct MeltConfirmationPS : ExchangeConfirmMelt {
        pub rc: HashCode,
        pub noreveal_index: u32,
    }
}

signed_record! {
    /// Old coin's signature linking it to one fresh coin envelope
    pub struct LinkDataPS : WalletCoinLink {
        pub old_coin_pub: EddsaPublicKey,
        pub h_denom_pub: HashCode,
        pub transfer_pub: TransferPublicKey,
        pub coin_envelope_hash: HashCode,
    }
}

signed_record! {
    /// Coin owner's recoup request for a revoked denomination
    pub struct RecoupRequestPS : WalletCoinRecoup {
        pub coin_pub: EddsaPublicKey,
        pub h_denom_pub: HashCode,
        pub coin_blind: BlindingKeySecret,
    }
}

signed_record! {
    /// Exchange confirmation that a recoup credited a reserve
    pub struct RecoupConfirmationPS : ExchangeConfirmRecoup {
        pub timestamp: Timestamp,
        pub recoup_amount: Amount,
        pub coin_pub: EddsaPublicKey,
        pub reserve_pub: EddsaPublicKey,
    }
}

signed_record! {
    /// Exchange confirmation that a recoup credited the coin it was refreshed from
    pub struct RecoupRefreshConfirmationPS : ExchangeConfirmRecoupRefresh {
        pub timestamp: Timestamp,
        pub recoup_amount: Amount,
        pub coin_pub: EddsaPublicKey,
        pub old_coin_pub: EddsaPublicKey,
    }
}

signed_record! {
    /// Exchange statement that a reserve was closed and wired back
    pub struct ReserveClosedPS : ExchangeReserveClosed {
        pub timestamp: Timestamp,
        pub closing_amount: Amount,
        pub closing_fee: Amount,
        pub reserve_pub: EddsaPublicKey,
        pub h_wire: HashCode,
    }
}

signed_record! {
    /// Merchant approval of a refund on one coin
    pub struct RefundPS : MerchantRefund {
        pub h_contract_terms: HashCode,
        pub coin_pub: EddsaPublicKey,
        pub merchant: EddsaPublicKey,
        pub rtransaction_id: u64,
        pub refund_amount: Amount,
        pub refund_fee: Amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_confirmation() -> DepositConfirmationPS {
        DepositConfirmationPS {
            h_contract_terms: HashCode::of(b"contract"),
            h_wire: HashCode::of(b"wire"),
            exchange_timestamp: Timestamp::from_secs(1_600_000_000),
            refund_deadline: Timestamp::from_secs(1_600_003_600),
            amount_without_fee: "KUDOS:4.99".parse().unwrap(),
            coin_pub: EddsaPublicKey::new([1u8; 32]),
            merchant: EddsaPublicKey::new([2u8; 32]),
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample_confirmation().encode();
        let expected_len = RECORD_HEADER_SIZE + 64 + 64 + 8 + 8 + 24 + 32 + 32;
        assert_eq!(bytes.len(), expected_len);
        assert_eq!(&bytes[0..4], &(expected_len as u32).to_be_bytes());
        assert_eq!(&bytes[4..8], &1033u32.to_be_bytes());
    }

    #[test]
    fn test_decode_checks_purpose_and_size() {
        let bytes = sample_confirmation().encode();
        assert_eq!(
            DepositConfirmationPS::decode(&bytes).unwrap(),
            sample_confirmation()
        );

        assert!(matches!(
            MeltConfirmationPS::decode(&bytes),
            Err(CoreError::PurposeMismatch { expected: 1034, got: 1033 })
        ));

        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            DepositConfirmationPS::decode(&longer),
            Err(CoreError::SizeMismatch { .. })
        ));
        assert!(DepositConfirmationPS::decode(&bytes[..6]).is_err());
    }

    #[test]
    fn test_signature_binds_every_field() {
        let key = EddsaPrivateKey::from_bytes([5u8; 32]);
        let record = sample_confirmation();
        let sig = record.sign(&key);
        assert!(record.verify(&key.public_key(), &sig).is_ok());

        let mut altered = record.clone();
        altered.amount_without_fee = "KUDOS:5".parse().unwrap();
        assert!(altered.verify(&key.public_key(), &sig).is_err());
    }

    #[test]
    fn test_purpose_lookup() {
        assert_eq!(Purpose::from_u32(1202), Some(Purpose::WalletCoinMelt));
        assert_eq!(Purpose::from_u32(7), None);
    }
}
