//! EdDSA keys, transfer-key ECDH, and key derivation
//!
//! Every online key in the protocol (coins, reserves, merchants, the
//! exchange's signing keys, the master key, auditors) is an Ed25519 key.
//! Role-specific aliases keep call sites readable without multiplying
//! newtypes.
//!
//! Refresh transfer keys are X25519. The ECDH between a coin's Ed25519
//! private key and a transfer public key equals the ECDH between the
//! transfer private key and the coin's public key mapped to Montgomery
//! form, which is what lets the link step rebuild the transfer secret
//! from the old coin alone.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CoreError, Result};
use crate::types::{decode_hex_array, hex_bytes_32};

/// Ed25519 private key (32-byte seed)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EddsaPrivateKey([u8; 32]);

impl EddsaPrivateKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self(seed)
    }

    pub fn from_bytes(seed: [u8; 32]) -> Self {
        Self(seed)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.0)
    }

    pub fn public_key(&self) -> EddsaPublicKey {
        EddsaPublicKey(self.signing_key().verifying_key().to_bytes())
    }

    /// Sign raw bytes
    pub fn sign(&self, message: &[u8]) -> EddsaSignature {
        EddsaSignature(self.signing_key().sign(message).to_bytes())
    }
}

impl fmt::Debug for EddsaPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EddsaPrivateKey")
            .field("public", &self.public_key())
            .field("seed", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for EddsaPrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for EddsaPrivateKey {}

impl Serialize for EddsaPrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        hex_bytes_32::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for EddsaPrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        hex_bytes_32::deserialize(deserializer).map(Self)
    }
}

/// Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EddsaPublicKey(#[serde(with = "hex_bytes_32")] pub [u8; 32]);

impl EddsaPublicKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        decode_hex_array(s).map(Self)
    }

    /// Short display format (first 4 bytes as hex)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CoreError::Crypto(format!("Invalid public key: {}", e)))
    }

    /// Verify a signature over raw bytes
    pub fn verify(&self, message: &[u8], signature: &EddsaSignature) -> Result<()> {
        let key = self.verifying_key()?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig)
            .map_err(|_| CoreError::SignatureVerificationFailed)
    }

    fn to_x25519(self) -> Result<x25519_dalek::PublicKey> {
        let point = self.verifying_key()?.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(point.to_bytes()))
    }
}

impl fmt::Debug for EddsaPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EddsaPublicKey({})", self.short())
    }
}

impl AsRef<[u8]> for EddsaPublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Ed25519 signature (64 bytes: R || s)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EddsaSignature(pub [u8; 64]);

impl EddsaSignature {
    pub fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        decode_hex_array(s).map(Self)
    }
}

impl fmt::Debug for EddsaSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EddsaSignature({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for EddsaSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EddsaSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

pub type CoinPrivateKey = EddsaPrivateKey;
pub type CoinPublicKey = EddsaPublicKey;
pub type ReservePrivateKey = EddsaPrivateKey;
pub type ReservePublicKey = EddsaPublicKey;
pub type MerchantPrivateKey = EddsaPrivateKey;
pub type MerchantPublicKey = EddsaPublicKey;
pub type ExchangePrivateKey = EddsaPrivateKey;
pub type ExchangePublicKey = EddsaPublicKey;
pub type MasterPrivateKey = EddsaPrivateKey;
pub type MasterPublicKey = EddsaPublicKey;
pub type AuditorPrivateKey = EddsaPrivateKey;
pub type AuditorPublicKey = EddsaPublicKey;

/// X25519 private key for one cut-and-choose branch of a refresh
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TransferPrivateKey([u8; 32]);

impl TransferPrivateKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.0)
    }

    pub fn public_key(&self) -> TransferPublicKey {
        TransferPublicKey(x25519_dalek::PublicKey::from(&self.secret()).to_bytes())
    }
}

impl fmt::Debug for TransferPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferPrivateKey")
            .field("public", &self.public_key())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl Serialize for TransferPrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        hex_bytes_32::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for TransferPrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        hex_bytes_32::deserialize(deserializer).map(Self)
    }
}

/// X25519 public key of a refresh transfer branch
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferPublicKey(#[serde(with = "hex_bytes_32")] pub [u8; 32]);

impl TransferPublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TransferPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferPublicKey({})", hex::encode(&self.0[..4]))
    }
}

/// Shared secret of one refresh session, input to planchet derivation
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TransferSecret([u8; 32]);

impl TransferSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn from_shared(shared: &[u8; 32]) -> Result<Self> {
        if shared.iter().all(|b| *b == 0) {
            return Err(CoreError::Crypto(
                "ECDH produced the identity point".to_string(),
            ));
        }
        let mut out = [0u8; 32];
        kdf(shared, b"coinage-transfer-secret", b"transfer", &mut out)?;
        Ok(Self(out))
    }
}

impl fmt::Debug for TransferSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransferSecret([REDACTED])")
    }
}

/// Transfer secret as computed by the melting wallet
pub fn transfer_secret_for_melt(
    transfer_priv: &TransferPrivateKey,
    old_coin_pub: &CoinPublicKey,
) -> Result<TransferSecret> {
    let coin_point = old_coin_pub.to_x25519()?;
    let shared = transfer_priv.secret().diffie_hellman(&coin_point);
    TransferSecret::from_shared(shared.as_bytes())
}

/// Transfer secret as recomputed during link from the old coin's private key
pub fn transfer_secret_for_link(
    old_coin_priv: &CoinPrivateKey,
    transfer_pub: &TransferPublicKey,
) -> Result<TransferSecret> {
    let secret = x25519_dalek::StaticSecret::from(old_coin_priv.signing_key().to_scalar_bytes());
    let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(transfer_pub.0));
    TransferSecret::from_shared(shared.as_bytes())
}

/// HKDF-SHA256 into `out`
pub fn kdf(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, out)
        .map_err(|e| CoreError::Crypto(format!("KDF output too long: {}", e)))
}
