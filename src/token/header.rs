use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// `FUNGIBLE` or `TAT` (spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum TokenType {
    #[strum(serialize = "FUNGIBLE")]
    #[serde(rename = "FUNGIBLE")]
    Fungible,
    #[strum(serialize = "TAT")]
    #[serde(rename = "TAT")]
    Tat,
}

/// The JWT header. `token_hash` is never trusted from the wire — it is
/// always recomputed from the payload on `restore` (spec §3.1, I4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub alg: String,
    pub typ: TokenType,
    pub token_hash: String,
}

impl Header {
    pub fn new(typ: TokenType, token_hash: String) -> Self {
        Header {
            alg: "Schnorr".to_owned(),
            typ,
            token_hash,
        }
    }
}
