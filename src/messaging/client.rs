//! Request/response correlation (spec §4.4): a client records a
//! `(requestId -> waiter)` entry before publishing; the default timeout
//! is 30 seconds, after which the entry is removed and a `Timeout`
//! error surfaces.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::wire::Response;
use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Tracks in-flight requests by id. One `Correlator` per peer (spec
/// §4.4, §5: this is one of the "shared resources" a reimplementation
/// must serialize access to — `parking_lot::Mutex` here).
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: String) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    /// Routes a decrypted inbound event carrying `result`/`error` to
    /// its waiter. Returns `true` if a waiter was found (spec §4.4:
    /// "incoming events whose decrypted payload has a matching id ...
    /// are routed to the waiter").
    pub fn resolve(&self, response: Response) -> bool {
        if let Some(tx) = self.pending.lock().remove(&response.id) {
            let _ = tx.send(response);
            true
        } else {
            false
        }
    }

    fn cancel(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    /// Awaits a response for `id` with the default 30s timeout,
    /// deleting the correlation entry on fire (spec §4.4, §5).
    pub async fn wait(&self, id: String) -> Result<Response> {
        let rx = self.register(id.clone());
        match tokio::time::timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Internal("correlator channel dropped".to_owned())),
            Err(_) => {
                self.cancel(&id);
                Err(Error::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wakes_the_matching_waiter() {
        let correlator = Correlator::new();
        let rx = correlator.register("req-1".to_owned());
        let resolved = correlator.resolve(Response {
            id: "req-1".to_owned(),
            result: Some(serde_json::json!({"ok": true})),
            error: None,
            timestamp: 0,
            ver: None,
        });
        assert!(resolved);
        let response = rx.await.unwrap();
        assert_eq!(response.id, "req-1");
    }

    #[tokio::test]
    async fn unmatched_resolve_is_a_noop() {
        let correlator = Correlator::new();
        let resolved = correlator.resolve(Response {
            id: "no-such-request".to_owned(),
            result: None,
            error: None,
            timestamp: 0,
            ver: None,
        });
        assert!(!resolved);
    }
}
