//! Hash codes and hex serde helpers

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

use crate::error::{CoreError, Result};

/// Size of a [`HashCode`] in bytes
pub const HASH_SIZE: usize = 64;

/// SHA-512 digest used for every identity hash in the protocol
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashCode(pub [u8; HASH_SIZE]);

impl HashCode {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    /// Hash a single buffer
    pub fn of(data: &[u8]) -> Self {
        Self(Sha512::digest(data).into())
    }

    /// Hash several buffers as one concatenated input
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut ctx = HashContext::new();
        for part in parts {
            ctx.update(part);
        }
        ctx.finish()
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Short display format (first 4 bytes as hex)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({}..)", self.short())
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for HashCode {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for HashCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-512
#[derive(Clone, Default)]
pub struct HashContext(Sha512);

impl HashContext {
    pub fn new() -> Self {
        Self(Sha512::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> HashCode {
        HashCode(self.0.finalize().into())
    }
}

/// Hash of the merchant's wire account: `SHA-512(payto_uri ‖ 0x00 ‖ salt)`
pub fn wire_hash(payto_uri: &str, salt: &str) -> HashCode {
    HashCode::of_parts(&[payto_uri.as_bytes(), &[0u8], salt.as_bytes()])
}

/// Decode a hex string into a fixed-size array
pub fn decode_hex_array<const N: usize>(s: &str) -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    hex::decode_to_slice(s, &mut bytes).map_err(|e| CoreError::Hex(e.to_string()))?;
    Ok(bytes)
}

/// Serde helper for 32-byte arrays as hex strings
pub mod hex_bytes_32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(bytes)
    }
}

/// Serde helper for variable-length byte strings as hex
pub mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_parts_matches_concatenation() {
        let joined = HashCode::of(b"helloworld");
        let parts = HashCode::of_parts(&[b"hello", b"world"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_wire_hash_separates_fields() {
        assert_ne!(wire_hash("payto://x/ab", "c"), wire_hash("payto://x/a", "bc"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let h = HashCode::of(b"denomination");
        assert_eq!(HashCode::from_hex(&h.to_hex()).unwrap(), h);
        assert!(h.to_hex().starts_with(&h.short()));
    }
}
