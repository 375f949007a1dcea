//! Planchets: coin secrets before the exchange has signed them

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::blind::{
    BlindedMessage, BlindedSignature, BlindingKeySecret, DenominationPublicKey, RsaSignature,
};
use crate::crypto::{kdf, CoinPrivateKey, CoinPublicKey, TransferSecret};
use crate::error::Result;
use crate::types::HashCode;

/// Coin private key plus the secret its blinding factor derives from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanchetSecrets {
    pub coin_priv: CoinPrivateKey,
    pub blinding_key: BlindingKeySecret,
}

impl PlanchetSecrets {
    /// Fresh secrets for a withdrawal
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            coin_priv: CoinPrivateKey::generate(rng),
            blinding_key: BlindingKeySecret::generate(rng),
        }
    }

    /// Secrets of the `index`-th fresh coin of a refresh branch
    ///
    /// Both the melting wallet and a linking wallet arrive at the same
    /// transfer secret, so both derive the same coins.
    pub fn derive(transfer_secret: &TransferSecret, index: u32) -> Result<Self> {
        let salt = index.to_be_bytes();
        let mut coin_seed = [0u8; 32];
        kdf(transfer_secret.as_bytes(), &salt, b"coin", &mut coin_seed)?;
        let mut bks = [0u8; 32];
        kdf(transfer_secret.as_bytes(), &salt, b"bks", &mut bks)?;
        Ok(Self {
            coin_priv: CoinPrivateKey::from_bytes(coin_seed),
            blinding_key: BlindingKeySecret(bks),
        })
    }

    pub fn coin_pub(&self) -> CoinPublicKey {
        self.coin_priv.public_key()
    }

    /// Blind the coin for `denom_pub`
    pub fn prepare(&self, denom_pub: &DenominationPublicKey) -> Result<PlanchetDetail> {
        let coin_pub = self.coin_pub();
        let coin_ev = denom_pub.blind(&coin_message(&coin_pub), &self.blinding_key)?;
        Ok(PlanchetDetail {
            h_denom_pub: denom_pub.hash(),
            coin_pub,
            coin_ev,
        })
    }

    /// Unblind the exchange's signature and check it against the denomination
    pub fn finalize(
        &self,
        denom_pub: &DenominationPublicKey,
        blind_sig: &BlindedSignature,
    ) -> Result<Coin> {
        let coin_pub = self.coin_pub();
        let denom_sig = denom_pub.unblind(blind_sig, &self.blinding_key)?;
        denom_pub.verify(&coin_message(&coin_pub), &denom_sig)?;
        Ok(Coin {
            coin_pub,
            h_denom_pub: denom_pub.hash(),
            denom_sig,
        })
    }
}

/// Blinded envelope ready to be sent for signing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanchetDetail {
    pub h_denom_pub: HashCode,
    pub coin_pub: CoinPublicKey,
    pub coin_ev: BlindedMessage,
}

impl PlanchetDetail {
    pub fn h_coin_envelope(&self) -> HashCode {
        self.coin_ev.hash()
    }
}

/// A signed coin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub coin_pub: CoinPublicKey,
    pub h_denom_pub: HashCode,
    pub denom_sig: RsaSignature,
}

impl Coin {
    /// Check the denomination signature
    pub fn verify(&self, denom_pub: &DenominationPublicKey) -> Result<()> {
        denom_pub.verify(&coin_message(&self.coin_pub), &self.denom_sig)
    }
}

/// The message a denomination key signs for a coin
pub fn coin_message(coin_pub: &CoinPublicKey) -> HashCode {
    HashCode::of(coin_pub.as_bytes())
}
