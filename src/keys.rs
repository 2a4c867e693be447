//! Deterministic single-use receive keys (spec §4.5, §1 — "the core
//! requires only the ability to derive deterministic child keypairs on
//! demand"; the HD scheme itself is an external collaborator, but a
//! BIP-39/BIP-32 derivation is what the rest of this corpus's
//! Bitcoin-adjacent repos use, so it is what this crate ships as the
//! default).

use bip32::{DerivationPath, XPrv};
use bip39::Mnemonic;
use chrono::Utc;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Root key material a `Pocket` derives single-use keys from (spec
/// §3.3 `hdMasterKey`).
pub struct HdMasterKey {
    seed: [u8; 64],
}

impl HdMasterKey {
    pub fn from_mnemonic(phrase: &str) -> Result<Self> {
        let mnemonic =
            Mnemonic::parse_normalized(phrase).map_err(|e| Error::Internal(e.to_string()))?;
        let seed = mnemonic.to_seed("");
        Ok(HdMasterKey { seed })
    }

    pub fn generate() -> Result<(Self, String)> {
        let mut entropy = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut entropy);
        let mnemonic = Mnemonic::from_entropy(&entropy).map_err(|e| Error::Internal(e.to_string()))?;
        let phrase = mnemonic.to_string();
        let seed = mnemonic.to_seed("");
        Ok((HdMasterKey { seed }, phrase))
    }

    /// Derives the child keypair at `m/7'/23'/11'/16'/0/<index>` (spec
    /// §4.5's fixed single-use-key path).
    pub fn derive_single_use(&self, index: u32) -> Result<(SecretKey, PublicKey)> {
        let path = DerivationPath::from_str(&format!("m/7'/23'/11'/16'/0/{}", index))
            .map_err(|e| Error::Internal(e.to_string()))?;
        let xprv = XPrv::derive_from_path(&self.seed, &path)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let secret_key = SecretKey::from_slice(&xprv.private_key().to_bytes())
            .map_err(Error::from)?;
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok((secret_key, public_key))
    }
}

/// One derived single-use receive address and its bookkeeping (spec
/// §3.3 `singleUseKeys`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleUseKey {
    pub secret_key_hex: String,
    pub created_at: i64,
    pub used: bool,
}

impl SingleUseKey {
    pub fn new(secret_key: &SecretKey) -> Self {
        SingleUseKey {
            secret_key_hex: hex::encode(secret_key.as_ref()),
            created_at: Utc::now().timestamp(),
            used: false,
        }
    }

    pub fn secret_key(&self) -> Result<SecretKey> {
        SecretKey::from_slice(&hex::decode(&self.secret_key_hex).map_err(|e| Error::Internal(e.to_string()))?)
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_path_dependent() {
        let (master, _) = HdMasterKey::generate().unwrap();
        let (sk0, _) = master.derive_single_use(0).unwrap();
        let (sk0_again, _) = master.derive_single_use(0).unwrap();
        let (sk1, _) = master.derive_single_use(1).unwrap();
        assert_eq!(sk0, sk0_again);
        assert_ne!(sk0, sk1);
    }

    #[test]
    fn mnemonic_round_trips_to_same_seed() {
        let (_master, phrase) = HdMasterKey::generate().unwrap();
        let restored = HdMasterKey::from_mnemonic(&phrase).unwrap();
        let (sk_a, _) = HdMasterKey::from_mnemonic(&phrase).unwrap().derive_single_use(3).unwrap();
        let (sk_b, _) = restored.derive_single_use(3).unwrap();
        assert_eq!(sk_a, sk_b);
    }
}
