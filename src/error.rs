use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire error code/message pair, as carried in `Response.error` (spec §6/§7).
/// `data` carries the structured reconciliation payload spec §7 calls out
/// for `AlreadySpent` (`{spent: tokenHash, issuer}`); every other variant
/// leaves it `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        ErrorData {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: u16, message: impl Into<String>, data: Value) -> Self {
        ErrorData {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("token hash mismatch: header claims {claimed}, recomputed {actual}")]
    InvalidTokenHash { claimed: String, actual: String },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("token already spent: {hash}")]
    AlreadySpent { hash: String, issuer: String },

    #[error("token expired")]
    Expired,

    #[error("token time-locked")]
    TimeLocked,

    #[error("HTLC neither redeemable nor refundable")]
    Locked,

    #[error("missing or invalid witness at input {0}")]
    BadWitness(usize),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("insufficient funds: needed {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("supply cap exceeded: {circulating} + {amount} > {cap}")]
    SupplyExceeded {
        circulating: u64,
        amount: u64,
        cap: u64,
    },

    #[error("not authorized")]
    Forbidden,

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps a variant to the wire `{code, message}` pair from spec §7,
    /// attaching the `{spent, issuer}` reconciliation payload for
    /// `AlreadySpent` (spec §4.2, §7, §9 scenario 3).
    pub fn to_wire(&self) -> ErrorData {
        match self {
            Error::Forbidden => ErrorData::new(403, self.to_string()),
            Error::MethodNotFound(_) => ErrorData::new(404, self.to_string()),
            Error::AlreadySpent { hash, issuer } => ErrorData::with_data(
                409,
                self.to_string(),
                serde_json::json!({"spent": hash, "issuer": issuer}),
            ),
            Error::Storage(_) | Error::Internal(_) => ErrorData::new(500, self.to_string()),
            _ => ErrorData::new(400, self.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {}", e))
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::Internal(format!("signature error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
