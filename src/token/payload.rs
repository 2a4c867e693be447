use serde::{Deserialize, Serialize};

use super::lock::HTLC;

/// The token payload (spec §3.1). Field names match the wire JSON
/// exactly, since `token_hash` is a pure function of this struct's
/// serialized form and must stay byte-stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub iss: String,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(rename = "tokenID", skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u64>,
    #[serde(rename = "P2PKlock", skip_serializing_if = "Option::is_none")]
    pub p2pk_lock: Option<String>,
    #[serde(rename = "timeLock", skip_serializing_if = "Option::is_none")]
    pub time_lock: Option<i64>,
    #[serde(rename = "HTLC", skip_serializing_if = "Option::is_none")]
    pub htlc: Option<HTLC>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_uri: Option<String>,
}

impl Payload {
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.exp, Some(exp) if now >= exp)
    }

    /// Canonical JSON string serialized from this payload — the JWT's
    /// middle segment before base64url encoding.
    pub fn canonical_json(&self) -> crate::error::Result<String> {
        serde_json::to_string(self).map_err(crate::error::Error::from)
    }

    /// The base64url-encoded (no padding) JSON string — the exact
    /// bytes `double_sha256_hex` is applied to, both at build time and
    /// on `restore` (spec §3.1: "double hash of the base64url-encoded
    /// payload string", I4).
    pub fn to_b64url(&self) -> crate::error::Result<String> {
        Ok(base64::encode_config(
            self.canonical_json()?.as_bytes(),
            base64::URL_SAFE_NO_PAD,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fungible_payload_round_trips_through_json() {
        let p = Payload {
            iss: "f".repeat(64),
            iat: 1000,
            exp: None,
            amount: Some(50),
            token_id: None,
            p2pk_lock: None,
            time_lock: None,
            htlc: None,
            data_uri: None,
        };
        let json = p.canonical_json().unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, Some(50));
        assert!(!json.contains("tokenID"));
    }
}
