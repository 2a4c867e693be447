use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, sha256};
use crate::error::{Error, Result};

const THIRTY_DAYS_MS: i64 = 30 * 24 * 60 * 60 * 1000;
const ONE_YEAR_MS: i64 = 365 * 24 * 60 * 60 * 1000;
const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashFunction {
    #[serde(rename = "SHA256")]
    Sha256,
}

impl HashFunction {
    fn expected_hex_len(self) -> usize {
        match self {
            HashFunction::Sha256 => 64,
        }
    }

    fn hash(self, secret: &str) -> [u8; 32] {
        match self {
            HashFunction::Sha256 => sha256(secret.as_bytes()),
        }
    }
}

/// Hash-time-locked contract, spec §4.1a.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HTLC {
    pub hashlock: String,
    pub timelock_ms: i64,
    #[serde(rename = "hashFunction")]
    pub hash_function: HashFunction,
}

impl HTLC {
    /// Validates the HTLC is well-formed at creation time: the hashlock
    /// matches the declared function's byte length and the timelock sits
    /// in a sane window (spec §4.1a).
    pub fn new(hashlock: String, timelock_ms: i64, hash_function: HashFunction, now_ms: i64) -> Result<Self> {
        if hashlock.len() != hash_function.expected_hex_len() {
            return Err(Error::InvalidTransaction(format!(
                "hashlock length {} does not match {:?}",
                hashlock.len(),
                hash_function
            )));
        }
        if timelock_ms < now_ms - THIRTY_DAYS_MS || timelock_ms > now_ms + ONE_YEAR_MS {
            return Err(Error::InvalidTransaction(
                "HTLC timelock outside the [-30d, +1y] sanity window".to_owned(),
            ));
        }
        Ok(HTLC {
            hashlock,
            timelock_ms,
            hash_function,
        })
    }

    /// Validates a secret is acceptable at HTLC-creation time: secrets
    /// under 16 characters are rejected (spec §4.1a).
    pub fn validate_secret(secret: &str) -> Result<()> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::InvalidTransaction(format!(
                "HTLC secret must be at least {} characters",
                MIN_SECRET_LEN
            )));
        }
        Ok(())
    }

    /// `now < timelock ⇒ redeemable` (spec §4.1a / §9 — the common
    /// convention, not the source's off-by-one).
    pub fn is_redeemable(&self, now_ms: i64, secret: Option<&str>) -> bool {
        if now_ms >= self.timelock_ms {
            return false;
        }
        match secret {
            Some(s) => constant_time_eq(
                &self.hash_function.hash(s),
                &hex_to_bytes_or_empty(&self.hashlock),
            ),
            None => false,
        }
    }

    /// `now >= timelock ⇒ refundable` (spec §4.1a).
    pub fn is_refundable(&self, now_ms: i64) -> bool {
        now_ms >= self.timelock_ms
    }
}

fn hex_to_bytes_or_empty(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap_or_default()
}

/// Which locks are present/active on a token at a given instant
/// (spec §4.1 `lockStatus`).
#[derive(Debug, Clone, Default)]
pub struct LockStatus {
    pub p2pk: Option<String>,
    pub htlc: Option<HTLC>,
    pub time_locked_until: Option<i64>,
}
