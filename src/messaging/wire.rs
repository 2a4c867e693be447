use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorData;

/// The plaintext request/response envelope carried inside a gift-wrapped
/// event (spec §4.4). `params`/`result` are stringified JSON, matching
/// the source wire shape, so a peer can log the raw bytes without first
/// understanding the method's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<u32>,
}

impl Request {
    pub fn new(id: String, method: impl Into<String>, params: &impl Serialize, timestamp: i64) -> serde_json::Result<Self> {
        Ok(Request {
            id,
            method: method.into(),
            params: serde_json::to_string(params)?,
            timestamp,
            ver: None,
        })
    }

    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.params)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<u32>,
}

impl Response {
    pub fn ok(id: String, result: impl Serialize, timestamp: i64) -> serde_json::Result<Self> {
        Ok(Response {
            id,
            result: Some(serde_json::to_value(result)?),
            error: None,
            timestamp,
            ver: None,
        })
    }

    pub fn err(id: String, error: ErrorData, timestamp: i64) -> Self {
        Response {
            id,
            result: None,
            error: Some(error),
            timestamp,
            ver: None,
        }
    }

    pub fn default_ok(id: String, timestamp: i64) -> Self {
        Response {
            id,
            result: Some(serde_json::json!({"status": "ok"})),
            error: None,
            timestamp,
            ver: None,
        }
    }
}
