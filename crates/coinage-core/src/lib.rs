//! Coinage Core - Amounts, signed records, and cryptographic primitives
//!
//! This crate provides the building blocks shared by the Coinage
//! e-cash protocol engine and the auditor: fixed-point amounts, the
//! purpose-tagged record codec every signature covers, EdDSA and
//! transfer keys, blind RSA denomination keys, planchets, and the
//! refresh commitment.

pub mod amount;
pub mod blind;
pub mod codec;
pub mod commitment;
pub mod crypto;
pub mod error;
pub mod planchet;
pub mod time;
pub mod types;

pub use amount::{Amount, Currency, FRACTION_BASE, MAX_AMOUNT_VALUE};
pub use blind::{
    BlindedMessage, BlindedSignature, BlindingKeySecret, DenominationPrivateKey,
    DenominationPublicKey, RsaSignature,
};
pub use codec::{Purpose, SignedRecord};
pub use commitment::{compute_rc, derive_branch, verify_reveal, RefreshBranch, RevealCheck};
pub use crypto::{
    transfer_secret_for_link, transfer_secret_for_melt, AuditorPrivateKey, AuditorPublicKey,
    CoinPrivateKey, CoinPublicKey, EddsaPrivateKey, EddsaPublicKey, EddsaSignature,
    ExchangePrivateKey, ExchangePublicKey, MasterPrivateKey, MasterPublicKey, MerchantPrivateKey,
    MerchantPublicKey, ReservePrivateKey, ReservePublicKey, TransferPrivateKey,
    TransferPublicKey, TransferSecret,
};
pub use error::{CoreError, Result};
pub use planchet::{coin_message, Coin, PlanchetDetail, PlanchetSecrets};
pub use time::{RelativeTime, Timestamp};
pub use types::{wire_hash, HashCode, HashContext};

/// Number of cut-and-choose branches in a refresh
pub const KAPPA: usize = 3;

/// Protocol version spoken by this implementation (`current:revision:age`)
pub const PROTOCOL_VERSION: &str = "9:0:0";
