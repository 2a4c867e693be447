//! Shared test scaffolding (mirrors the teacher's `test_utils.rs`):
//! keypair/forge/pocket builders reused by both the inline `#[cfg(test)]`
//! unit tests and the end-to-end scenarios under `tests/`. Not gated by
//! `#[cfg(test)]` itself, since the `tests/` binaries compile against
//! this crate as an external consumer and can only see ordinary public
//! items, the same reason the teacher's own `test_utils.rs` ships
//! ungated.

use std::collections::HashSet;
use std::sync::Arc;

use secp256k1::{Secp256k1, SecretKey};

use crate::forge::Forge;
use crate::keys::HdMasterKey;
use crate::messaging::relay::NullRelay;
use crate::pocket::Pocket;
use crate::storage::MemoryStorage;
use crate::token::TokenType;

pub fn gen_keypair() -> SecretKey {
    let secp = Secp256k1::new();
    let (sk, _) = secp.generate_keypair(&mut rand::thread_rng());
    sk
}

/// The x-only pubkey hex for `secret_key` — the encoding every
/// `iss`/`P2PKlock`/issuer-hex field on the wire uses.
pub fn xonly_hex(secret_key: &SecretKey) -> String {
    let secp = Secp256k1::new();
    let keypair = secp256k1::schnorrsig::KeyPair::from_secret_key(&secp, *secret_key);
    let xonly = secp256k1::schnorrsig::PublicKey::from_keypair(&secp, &keypair);
    hex::encode(xonly.serialize())
}

/// A `Forge` wired to a `NullRelay`/`MemoryStorage` pair, for tests that
/// exercise forge logic without a live relay connection.
pub fn new_forge(total_supply: u64, token_type: TokenType) -> (Forge, SecretKey) {
    let sk = gen_keypair();
    let forge = Forge::new(
        sk,
        Arc::new(NullRelay::default()),
        Arc::new(MemoryStorage::new()),
        None,
        total_supply,
        token_type,
        HashSet::new(),
    )
    .expect("forge construction");
    (forge, sk)
}

/// A `Pocket` wired the same way, with a freshly generated HD master key.
pub fn new_pocket() -> (Pocket, SecretKey) {
    let sk = gen_keypair();
    let (hd, _phrase) = HdMasterKey::generate().expect("hd key generation");
    let pocket = Pocket::new(sk, hd, Arc::new(NullRelay::default()), Arc::new(MemoryStorage::new()))
        .expect("pocket construction");
    (pocket, sk)
}
