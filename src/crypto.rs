//! Hashing and Schnorr signing primitives shared by the token and
//! messaging layers. Kept thin and free of protocol policy: callers
//! decide *what* bytes get hashed or signed, this module only wraps
//! `sha2`/`secp256k1` with the hex-string conventions the wire format
//! uses everywhere (spec §3.1).

use secp256k1::schnorrsig::{KeyPair, PublicKey as XOnlyPublicKey, Signature as SchnorrSig};
use secp256k1::{Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// `SHA256(bytes)`.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    buf
}

/// `SHA256(SHA256(s))`. Spec §3.1's token hash applies this to the
/// base64url-encoded payload string (see [`crate::token::Payload::to_b64url`]),
/// not to the raw payload JSON — callers are responsible for passing
/// the right `s`.
pub fn double_sha256_hex(s: &str) -> String {
    let first = sha256(s.as_bytes());
    let second = sha256(&first);
    hex::encode(second)
}

/// `SHA256(hash1 || ":" || timeSlot || ":" || readerPubkey)`, the optional
/// time-sliced binding hash from spec §3.1.
pub fn binding_hash(hash1_hex: &str, time_slot: u64, reader_pubkey_hex: &str) -> String {
    let msg = format!("{}:{}:{}", hash1_hex, time_slot, reader_pubkey_hex);
    hex::encode(sha256(msg.as_bytes()))
}

/// Schnorr-signs the UTF-8 bytes of a hex string (spec §3.1: "the
/// signature is over the UTF-8 bytes of the hex-encoded `token_hash`
/// string, not over the raw hash bytes"). This is preserved for
/// bit-compat with the source protocol; see DESIGN.md / spec §9.
pub fn sign_hex_string(secret_key: &SecretKey, hex_str: &str) -> Result<String> {
    let secp = Secp256k1::new();
    let keypair = KeyPair::from_secret_key(&secp, *secret_key);
    let digest = sha256(hex_str.as_bytes());
    let sig = secp.schnorrsig_sign_no_aux_rand(&msg_from_digest(&digest), &keypair);
    Ok(hex::encode(sig.as_ref()))
}

/// Verifies a Schnorr signature (hex) over the UTF-8 bytes of `hex_str`
/// under the given x-only public key (hex).
pub fn verify_hex_string(pubkey_hex: &str, hex_str: &str, sig_hex: &str) -> Result<bool> {
    let secp = Secp256k1::new();
    let pubkey = XOnlyPublicKey::from_slice(
        &hex::decode(pubkey_hex).map_err(|e| Error::MalformedToken(e.to_string()))?,
    )
    .map_err(Error::from)?;
    let sig_bytes = hex::decode(sig_hex).map_err(|e| Error::MalformedToken(e.to_string()))?;
    let sig = SchnorrSig::from_slice(&sig_bytes).map_err(Error::from)?;
    let digest = sha256(hex_str.as_bytes());
    Ok(secp
        .schnorrsig_verify(&sig, &msg_from_digest(&digest), &pubkey)
        .is_ok())
}

fn msg_from_digest(digest: &[u8; 32]) -> secp256k1::Message {
    secp256k1::Message::from_slice(digest).expect("sha256 digest is always 32 bytes")
}

/// Constant-time byte comparison, used for HTLC hashlock checks
/// (spec §4.1a: "H(secret) == hashlock (constant-time comparison)").
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    consistenttime::ct_u8_slice_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_hash_is_deterministic_and_sensitive_to_input() {
        let h1 = double_sha256_hex(r#"{"a":1}"#);
        let h2 = double_sha256_hex(r#"{"a":1}"#);
        let h3 = double_sha256_hex(r#"{"a":2}"#);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let secp = Secp256k1::new();
        let (secret_key, _) = secp.generate_keypair(&mut rand::thread_rng());
        let keypair = KeyPair::from_secret_key(&secp, secret_key);
        let xonly = XOnlyPublicKey::from_keypair(&secp, &keypair);
        let hash_hex = double_sha256_hex("payload");
        let sig = sign_hex_string(&secret_key, &hash_hex).unwrap();
        assert!(verify_hex_string(&hex::encode(&xonly.serialize()), &hash_hex, &sig).unwrap());
    }

    #[test]
    fn constant_time_eq_rejects_one_byte_difference() {
        let a = sha256(b"s3cret-preimage-0001");
        let mut b = a;
        b[0] ^= 0x01;
        assert!(!constant_time_eq(&a, &b));
        assert!(constant_time_eq(&a, &a));
    }
}
