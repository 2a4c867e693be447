use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{double_sha256_hex, sign_hex_string, verify_hex_string};
use crate::error::{Error, Result};

use super::header::{Header, TokenType};
use super::lock::LockStatus;
use super::payload::Payload;

/// An immutable signed token envelope (spec §3.1). `Token` values are
/// only ever constructed via [`Token::build`] or [`Token::restore`] —
/// both paths guarantee `header.token_hash` is a pure function of
/// `payload`, which is what gives the token its hash identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub header: Header,
    pub payload: Payload,
}

impl Token {
    /// Populates the header and computes `token_hash` from `payload`.
    /// Validates the FUNGIBLE/TAT shape invariant (spec §3.1).
    pub fn build(typ: TokenType, payload: Payload) -> Result<Self> {
        match typ {
            TokenType::Fungible => {
                if payload.amount.map_or(true, |a| a == 0) || payload.token_id.is_some() {
                    return Err(Error::MalformedToken(
                        "FUNGIBLE token requires amount > 0 and no tokenID".to_owned(),
                    ));
                }
            }
            TokenType::Tat => {
                if payload.token_id.is_none() || payload.amount.is_some() {
                    return Err(Error::MalformedToken(
                        "TAT requires tokenID and no amount".to_owned(),
                    ));
                }
            }
        }
        let token_hash = double_sha256_hex(&payload.to_b64url()?);
        Ok(Token {
            header: Header::new(typ, token_hash),
            payload,
        })
    }

    /// The 32-byte token hash, hex-encoded, recomputed from `payload`
    /// (never read from `header` — callers that need the trusted value
    /// should use this, not `self.header.token_hash`). `SHA256(SHA256(
    /// payload_b64url_json_string))` per spec §3.1 — the double hash of
    /// the base64url-encoded payload string, not the raw JSON.
    pub fn recompute_hash(&self) -> Result<String> {
        Ok(double_sha256_hex(&self.payload.to_b64url()?))
    }

    /// Schnorr-signs the UTF-8 bytes of the hex token hash (spec §3.1,
    /// preserved bit-compat quirk noted in spec §9).
    pub fn sign(&self, secret_key: &SecretKey) -> Result<String> {
        sign_hex_string(secret_key, &self.header.token_hash)
    }

    /// Verifies `sig_hex` was produced by `sign` under `issuer_pubkey_hex`.
    pub fn verify_signature(&self, issuer_pubkey_hex: &str, sig_hex: &str) -> Result<bool> {
        verify_hex_string(issuer_pubkey_hex, &self.header.token_hash, sig_hex)
    }

    /// `b64url(header).b64url(payload).hex(sig)`, padding stripped
    /// (spec §3.1).
    pub fn to_jwt(&self, sig_hex: &str) -> Result<String> {
        let header_b64 = base64::encode_config(serde_json::to_vec(&self.header)?, base64::URL_SAFE_NO_PAD);
        let payload_b64 = self.payload.to_b64url()?;
        Ok(format!("{}.{}.{}", header_b64, payload_b64, sig_hex))
    }

    /// Parses a JWT-shaped string; the token hash is recomputed from the
    /// parsed payload and compared to the header value — mismatch fails
    /// with `InvalidTokenHash` (spec §3.1, I4). Does not itself verify
    /// the issuer signature — see [`Token::verify_signature`].
    pub fn restore(jwt: &str) -> Result<(Self, String)> {
        let mut parts = jwt.splitn(3, '.');
        let header_b64 = parts
            .next()
            .ok_or_else(|| Error::MalformedToken("missing header segment".to_owned()))?;
        let payload_b64 = parts
            .next()
            .ok_or_else(|| Error::MalformedToken("missing payload segment".to_owned()))?;
        let sig_hex = parts
            .next()
            .ok_or_else(|| Error::MalformedToken("missing signature segment".to_owned()))?
            .to_owned();

        let header_bytes = base64::decode_config(header_b64, base64::URL_SAFE_NO_PAD)
            .map_err(|e| Error::MalformedToken(e.to_string()))?;
        let payload_bytes = base64::decode_config(payload_b64, base64::URL_SAFE_NO_PAD)
            .map_err(|e| Error::MalformedToken(e.to_string()))?;

        let header: Header = serde_json::from_slice(&header_bytes)?;
        let payload: Payload = serde_json::from_slice(&payload_bytes)?;

        // Hash the base64url segment itself, not the decoded JSON
        // bytes (spec §3.1: "double hash of the base64url-encoded
        // payload string").
        let actual = double_sha256_hex(payload_b64);
        if actual != header.token_hash {
            return Err(Error::InvalidTokenHash {
                claimed: header.token_hash.clone(),
                actual,
            });
        }

        Ok((Token { header, payload }, sig_hex))
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.payload.is_expired(now)
    }

    pub fn lock_status(&self, now: i64) -> LockStatus {
        LockStatus {
            p2pk: self.payload.p2pk_lock.clone(),
            htlc: self.payload.htlc.clone(),
            time_locked_until: self
                .payload
                .time_lock
                .filter(|&until| until > now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Secp256k1;

    fn fungible_payload(iss: &str, amount: u64) -> Payload {
        Payload {
            iss: iss.to_owned(),
            iat: 1_000,
            exp: None,
            amount: Some(amount),
            token_id: None,
            p2pk_lock: None,
            time_lock: None,
            htlc: None,
            data_uri: None,
        }
    }

    #[test]
    fn build_sign_to_jwt_restore_round_trips() {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let xonly = secp256k1::schnorrsig::KeyPair::from_secret_key(&secp, sk);
        let xonly_pk = secp256k1::schnorrsig::PublicKey::from_keypair(&secp, &xonly);
        let _ = pk;

        let token = Token::build(
            TokenType::Fungible,
            fungible_payload(&hex::encode(xonly_pk.serialize()), 100),
        )
        .unwrap();
        let sig = token.sign(&sk).unwrap();
        let jwt = token.to_jwt(&sig).unwrap();

        let (restored, restored_sig) = Token::restore(&jwt).unwrap();
        assert_eq!(restored.payload.amount, Some(100));
        assert_eq!(restored_sig, sig);
        assert!(restored
            .verify_signature(&hex::encode(xonly_pk.serialize()), &restored_sig)
            .unwrap());
    }

    #[test]
    fn tampered_payload_fails_hash_check() {
        let secp = Secp256k1::new();
        let (sk, _) = secp.generate_keypair(&mut rand::thread_rng());
        let token = Token::build(TokenType::Fungible, fungible_payload("ab".repeat(32).as_str(), 10)).unwrap();
        let sig = token.sign(&sk).unwrap();
        let jwt = token.to_jwt(&sig).unwrap();

        let mut parts: Vec<&str> = jwt.split('.').collect();
        let tampered_payload = base64::encode_config(
            br#"{"iss":"aa","iat":1000,"amount":999999}"#,
            base64::URL_SAFE_NO_PAD,
        );
        parts[1] = &tampered_payload;
        let tampered_jwt = parts.join(".");

        assert!(matches!(
            Token::restore(&tampered_jwt),
            Err(Error::InvalidTokenHash { .. })
        ));
    }

    #[test]
    fn fungible_requires_positive_amount_no_token_id() {
        let mut payload = fungible_payload("ab".repeat(32).as_str(), 0);
        assert!(Token::build(TokenType::Fungible, payload.clone()).is_err());
        payload.amount = Some(5);
        payload.token_id = Some(1);
        assert!(Token::build(TokenType::Fungible, payload).is_err());
    }
}
