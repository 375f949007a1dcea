//! RSA blind signatures over full-domain-hashed coin identities
//!
//! The wallet hashes the coin public key, maps it into Z_n with a
//! full-domain hash, multiplies in `r^e` for a blinding factor `r` derived
//! from its [`BlindingKeySecret`], and sends the product to the exchange.
//! The exchange's raw RSA signature on the product is unblinded by
//! multiplying with `r^-1`, which yields an ordinary FDH-RSA signature on
//! the coin.
//!
//! Public key encoding (also the input of the denomination hash):
//!
//! ```text
//! OFFSET  SIZE   FIELD
//! 0x00    2      modulus length in bytes (big endian)
//! 0x02    2      exponent length in bytes (big endian)
//! 0x04    n_len  modulus (big endian)
//! ...     e_len  public exponent (big endian)
//! ```

use std::fmt;

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::kdf;
use crate::error::{CoreError, Result};
use crate::types::{hex_bytes_32, hex_vec, HashCode};

/// Smallest modulus size accepted for key generation
pub const MIN_RSA_BITS: usize = 512;

/// Public exponent used for generated keys
pub const RSA_PUBLIC_EXPONENT: u32 = 65537;

/// Miller-Rabin rounds for prime generation
const MILLER_RABIN_ROUNDS: usize = 24;

const SMALL_PRIMES: [u32; 24] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// Denomination public key (RSA modulus and exponent)
#[derive(Clone, PartialEq, Eq)]
pub struct DenominationPublicKey {
    n: BigUint,
    e: BigUint,
}

impl DenominationPublicKey {
    pub fn new(n: BigUint, e: BigUint) -> Result<Self> {
        if n.bits() < MIN_RSA_BITS as u64 || e.is_zero() || e >= n {
            return Err(CoreError::Crypto("Invalid RSA public key".to_string()));
        }
        Ok(Self { n, e })
    }

    /// Modulus size in bytes; every blinded value and signature has this length
    pub fn modulus_len(&self) -> usize {
        ((self.n.bits() + 7) / 8) as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let n = self.n.to_bytes_be();
        let e = self.e.to_bytes_be();
        let mut out = Vec::with_capacity(4 + n.len() + e.len());
        out.extend_from_slice(&(n.len() as u16).to_be_bytes());
        out.extend_from_slice(&(e.len() as u16).to_be_bytes());
        out.extend_from_slice(&n);
        out.extend_from_slice(&e);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(CoreError::Truncated {
                need: 4,
                have: bytes.len(),
            });
        }
        let n_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let e_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let need = 4 + n_len + e_len;
        if bytes.len() != need {
            return Err(CoreError::SizeMismatch {
                declared: need,
                actual: bytes.len(),
            });
        }
        let n = BigUint::from_bytes_be(&bytes[4..4 + n_len]);
        let e = BigUint::from_bytes_be(&bytes[4 + n_len..]);
        Self::new(n, e)
    }

    /// Denomination identity `h_key`
    pub fn hash(&self) -> HashCode {
        HashCode::of(&self.encode())
    }

    fn to_fixed(&self, value: &BigUint) -> Vec<u8> {
        let raw = value.to_bytes_be();
        let mut out = vec![0u8; self.modulus_len()];
        out[self.modulus_len() - raw.len()..].copy_from_slice(&raw);
        out
    }

    fn from_fixed(&self, bytes: &[u8], what: &str) -> Result<BigUint> {
        if bytes.len() != self.modulus_len() {
            return Err(CoreError::Crypto(format!(
                "{} has {} bytes, modulus has {}",
                what,
                bytes.len(),
                self.modulus_len()
            )));
        }
        let value = BigUint::from_bytes_be(bytes);
        if value >= self.n {
            return Err(CoreError::Crypto(format!("{} not reduced modulo n", what)));
        }
        Ok(value)
    }

    /// Full-domain hash of a message hash into Z_n
    fn fdh(&self, message: &HashCode) -> Result<BigUint> {
        let mut expanded = vec![0u8; self.modulus_len()];
        kdf(message.as_bytes(), self.hash().as_bytes(), b"coinage-rsa-fdh", &mut expanded)?;
        Ok(BigUint::from_bytes_be(&expanded) % &self.n)
    }

    fn blinding_factor(&self, secret: &BlindingKeySecret) -> Result<(BigUint, BigUint)> {
        let mut expanded = vec![0u8; self.modulus_len()];
        kdf(&secret.0, self.hash().as_bytes(), b"coinage-rsa-blinding", &mut expanded)?;
        let r = BigUint::from_bytes_be(&expanded) % &self.n;
        if r.is_zero() {
            return Err(CoreError::Crypto("Degenerate blinding factor".to_string()));
        }
        let r_inv = r
            .modinv(&self.n)
            .ok_or_else(|| CoreError::Crypto("Blinding factor not invertible".to_string()))?;
        Ok((r, r_inv))
    }

    /// Blind the hash of a coin public key
    pub fn blind(&self, message: &HashCode, secret: &BlindingKeySecret) -> Result<BlindedMessage> {
        let m = self.fdh(message)?;
        let (r, _) = self.blinding_factor(secret)?;
        let blinded = (m * r.modpow(&self.e, &self.n)) % &self.n;
        Ok(BlindedMessage(self.to_fixed(&blinded)))
    }

    /// Remove the blinding factor from the exchange's signature
    pub fn unblind(
        &self,
        blinded: &BlindedSignature,
        secret: &BlindingKeySecret,
    ) -> Result<RsaSignature> {
        let s = self.from_fixed(&blinded.0, "blinded signature")?;
        let (_, r_inv) = self.blinding_factor(secret)?;
        let unblinded = (s * r_inv) % &self.n;
        Ok(RsaSignature(self.to_fixed(&unblinded)))
    }

    /// Verify an unblinded signature on a message hash
    pub fn verify(&self, message: &HashCode, signature: &RsaSignature) -> Result<()> {
        let s = self.from_fixed(&signature.0, "signature")?;
        let expected = self.fdh(message)?;
        if s.modpow(&self.e, &self.n) == expected {
            Ok(())
        } else {
            Err(CoreError::SignatureVerificationFailed)
        }
    }
}

impl fmt::Debug for DenominationPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DenominationPublicKey({} bits, {})",
            self.n.bits(),
            self.hash().short()
        )
    }
}

impl Serialize for DenominationPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.encode()))
    }
}

impl<'de> Deserialize<'de> for DenominationPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Self::decode(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Denomination private key, held only by the exchange
#[derive(Clone)]
pub struct DenominationPrivateKey {
    public: DenominationPublicKey,
    d: BigUint,
}

impl DenominationPrivateKey {
    /// Generate a fresh RSA key with a modulus of exactly `bits` bits
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, bits: usize) -> Result<Self> {
        if bits < MIN_RSA_BITS {
            return Err(CoreError::Crypto(format!(
                "RSA modulus of {} bits is below the minimum of {}",
                bits, MIN_RSA_BITS
            )));
        }
        let e = BigUint::from(RSA_PUBLIC_EXPONENT);
        loop {
            let p = random_prime(rng, bits / 2);
            let q = random_prime(rng, bits - bits / 2);
            if p == q {
                continue;
            }
            let n = &p * &q;
            if n.bits() != bits as u64 {
                continue;
            }
            let phi = (&p - 1u32) * (&q - 1u32);
            if let Some(d) = e.modinv(&phi) {
                let public = DenominationPublicKey::new(n, e)?;
                return Ok(Self { public, d });
            }
        }
    }

    pub fn public_key(&self) -> &DenominationPublicKey {
        &self.public
    }

    /// Raw RSA signature on a blinded envelope
    pub fn sign_blinded(&self, blinded: &BlindedMessage) -> Result<BlindedSignature> {
        let m = self.public.from_fixed(&blinded.0, "blinded message")?;
        let s = m.modpow(&self.d, &self.public.n);
        Ok(BlindedSignature(self.public.to_fixed(&s)))
    }
}

impl fmt::Debug for DenominationPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DenominationPrivateKey")
            .field("public", &self.public)
            .field("d", &"[REDACTED]")
            .finish()
    }
}

fn random_prime<R: RngCore + CryptoRng>(rng: &mut R, bits: usize) -> BigUint {
    let top_two = (BigUint::one() << (bits - 1)) | (BigUint::one() << (bits - 2));
    loop {
        let candidate = rng.gen_biguint(bits as u64) | &top_two | BigUint::one();
        if is_probable_prime(rng, &candidate) {
            return candidate;
        }
    }
}

fn is_probable_prime<R: RngCore + CryptoRng>(rng: &mut R, n: &BigUint) -> bool {
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    let one = BigUint::one();
    let n_minus_one = n - &one;
    let mut d = n_minus_one.clone();
    let mut s = 0u32;
    while (&d % 2u32).is_zero() {
        d >>= 1;
        s += 1;
    }

    let two = BigUint::from(2u32);
    'witness: for _ in 0..MILLER_RABIN_ROUNDS {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Secret from which the blinding factor of one coin is derived
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BlindingKeySecret(pub [u8; 32]);

impl BlindingKeySecret {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for BlindingKeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlindingKeySecret([REDACTED])")
    }
}

impl Serialize for BlindingKeySecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        hex_bytes_32::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for BlindingKeySecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        hex_bytes_32::deserialize(deserializer).map(Self)
    }
}

/// Blinded coin envelope sent to the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedMessage(#[serde(with = "hex_vec")] pub Vec<u8>);

impl BlindedMessage {
    /// Hash of the envelope, bound into withdraw and link signatures
    pub fn hash(&self) -> HashCode {
        HashCode::of(&self.0)
    }
}

/// Exchange signature on a blinded envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedSignature(#[serde(with = "hex_vec")] pub Vec<u8>);

/// Unblinded denomination signature on a coin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaSignature(#[serde(with = "hex_vec")] pub Vec<u8>);
