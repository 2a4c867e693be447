//! `PeerCore`: the composed base every specialization (`Forge`,
//! `Pocket`) embeds (spec §9 "reimplement as composition: a `PeerCore`
//! struct embedded in `Forge` and `Pocket`, with method sets
//! implemented on the outer type"). Owns identity, relay access, the
//! dedup structure, the request/response correlator, and the
//! serialized state-save queue — the "shared resources" of spec §5
//! that must be kept behind a single boundary per peer instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use log::{debug, trace, warn};
use nostr::key::{Keys, PublicKey, SecretKey as NostrSecretKey};
use nostr::{Event, Filter, Kind, Timestamp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::client::Correlator;
use super::dedup::{BloomSnapshot, EventDedup};
use super::envelope::{gift_wrap, open_gift_wrap, GIFT_WRAP_KIND};
use super::relay::RelayTransport;
use super::wire::{Request, Response};
use crate::error::{Error, Result};
use crate::storage::SaveQueue;

/// How far back a fresh subscription looks for backlog while the peer
/// was offline (spec §4.4).
const SUBSCRIPTION_LOOKBACK: Duration = Duration::from_secs(3 * 24 * 60 * 60);

pub struct PeerCore {
    keys: Keys,
    relay: Arc<dyn RelayTransport>,
    storage: SaveQueue<Arc<dyn crate::storage::Storage>>,
    pub dedup: EventDedup,
    pub correlator: Correlator,
}

impl PeerCore {
    pub fn new(
        secret_key: secp256k1::SecretKey,
        relay: Arc<dyn RelayTransport>,
        storage: Arc<dyn crate::storage::Storage>,
    ) -> Result<Self> {
        let nostr_sk = NostrSecretKey::from_slice(secret_key.as_ref())
            .map_err(|e| Error::Internal(format!("key conversion: {}", e)))?;
        let keys = Keys::new(nostr_sk);
        Ok(PeerCore {
            keys,
            relay,
            storage: SaveQueue::new(storage),
            dedup: EventDedup::new(),
            correlator: Correlator::new(),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keys.public_key().serialize())
    }

    /// The raw secp256k1 secret key, for signing tokens (`Forge::forge`,
    /// `Forge::transfer`) rather than gift-wrap envelopes.
    pub fn secret_key(&self) -> Result<secp256k1::SecretKey> {
        let nostr_sk = self.keys.secret_key().map_err(|e| Error::Internal(e.to_string()))?;
        secp256k1::SecretKey::from_slice(nostr_sk.as_ref())
            .map_err(|e| Error::Internal(format!("key conversion: {}", e)))
    }

    /// Subscribes this peer's own pubkey (or a single-use key's) to
    /// the gift-wrap kind with the standard 3-day lookback (spec
    /// §4.4). Multiple subscriptions can coexist per spec; callers
    /// keep the returned stream alive for as long as they want it.
    pub async fn subscribe(
        &self,
        pubkey: &PublicKey,
    ) -> Result<(super::relay::SubscriptionId, BoxStream<'static, Event>)> {
        let since = Timestamp::from(
            (Utc::now().timestamp() - SUBSCRIPTION_LOOKBACK.as_secs() as i64).max(0) as u64,
        );
        let filter = Filter::new()
            .kind(Kind::Custom(GIFT_WRAP_KIND))
            .pubkey(*pubkey)
            .since(since);
        self.relay.subscribe(filter).await
    }

    pub async fn close_subscription(&self, sub: super::relay::SubscriptionId) -> Result<()> {
        self.relay.close(sub).await
    }

    /// Opens and dedups one inbound relay event using this peer's
    /// identity key. Decryption/signature failure and replays are
    /// silently dropped, never propagated (spec §7: "decryption
    /// failure on an inbound event is silently dropped ...
    /// signature-verification failure ... drops the event"). Returns
    /// the decrypted wire JSON and verified sender.
    pub fn open_event(&self, event: &Event) -> Option<(serde_json::Value, PublicKey)> {
        let secret_key = self.keys.secret_key().ok()?;
        self.open_event_inner(event, &secret_key)
    }

    /// Same as `open_event`, but decrypts with a caller-supplied secret
    /// key rather than this peer's identity key — the single-use
    /// receive keys a `Pocket` derives (spec §4.5) are subscribed and
    /// opened under their own key, never the pocket's identity key.
    pub fn open_event_with_secret(
        &self,
        event: &Event,
        secret_key: &secp256k1::SecretKey,
    ) -> Option<(serde_json::Value, PublicKey)> {
        let nostr_sk = NostrSecretKey::from_slice(secret_key.as_ref()).ok()?;
        self.open_event_inner(event, &nostr_sk)
    }

    fn open_event_inner(
        &self,
        event: &Event,
        secret_key: &NostrSecretKey,
    ) -> Option<(serde_json::Value, PublicKey)> {
        if !self.dedup.check_and_mark(&event.id.to_string()) {
            trace!("dropping duplicate event {}", event.id);
            return None;
        }
        let opened = match open_gift_wrap(secret_key, event) {
            Ok(o) => o,
            Err(e) => {
                warn!("dropping event {}: gift-wrap open failed: {}", event.id, e);
                return None;
            }
        };
        let value = match serde_json::from_str::<serde_json::Value>(&opened.content) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping event {}: payload not valid JSON: {}", event.id, e);
                return None;
            }
        };
        Some((value, opened.sender))
    }

    /// The x-only pubkey hex a secret key would produce, without
    /// constructing a full `PeerCore` — used by config-driven
    /// constructors that need the pubkey before storage/identity are
    /// wired up (e.g. to look up persisted key material under it).
    pub fn public_key_hex_for(secret_key: &secp256k1::SecretKey) -> Result<String> {
        let nostr_sk = NostrSecretKey::from_slice(secret_key.as_ref())
            .map_err(|e| Error::Internal(format!("key conversion: {}", e)))?;
        Ok(hex::encode(Keys::new(nostr_sk).public_key().serialize()))
    }

    /// Routes a decrypted `Response`-shaped payload to a waiting
    /// request, if any is registered.
    pub fn try_resolve_response(&self, value: &serde_json::Value) -> bool {
        if value.get("result").is_none() && value.get("error").is_none() {
            return false;
        }
        match serde_json::from_value::<Response>(value.clone()) {
            Ok(response) => self.correlator.resolve(response),
            Err(_) => false,
        }
    }

    /// Sends a request to `recipient` and awaits the correlated
    /// response, subject to the default 30s timeout (spec §4.4, §5).
    pub async fn send_request(
        &self,
        recipient: &PublicKey,
        method: &str,
        params: &impl Serialize,
    ) -> Result<Response> {
        let id = Uuid::new_v4().to_string();
        let req = Request::new(id.clone(), method, params, Utc::now().timestamp())
            .map_err(Error::from)?;
        let content = serde_json::to_string(&req).map_err(Error::from)?;
        let event = gift_wrap(&self.keys, recipient, &content)?;
        debug!("publishing request {} ({}) to {}", id, method, recipient);
        self.relay.publish(event).await?;
        self.correlator.wait(id).await
    }

    /// Gift-wraps and publishes a reply addressed to `recipient` (spec
    /// §4.4).
    pub async fn send_reply(&self, recipient: &PublicKey, response: &Response) -> Result<()> {
        let content = serde_json::to_string(response).map_err(Error::from)?;
        let event = gift_wrap(&self.keys, recipient, &content)?;
        self.relay.publish(event).await
    }

    pub async fn save_state<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).map_err(Error::from)?;
        self.storage.save(key, json).await
    }

    pub async fn load_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.load(key).await? {
            Some(s) => Ok(Some(serde_json::from_str(&s).map_err(Error::from)?)),
            None => Ok(None),
        }
    }

    /// Like [`Self::load_state`], but first applies the legacy-dedup
    /// migration rule of spec §6: a loaded state object carrying a
    /// top-level `processedEventIds` array has each entry imported into
    /// `self.dedup`'s Bloom filter before the rest is deserialized into
    /// `T`. `T`'s own schema has no field for that array, so it is
    /// simply not carried forward on the next `save_state` — "deleted
    /// before the next write" falls out of the struct shape rather than
    /// needing an explicit removal step.
    pub async fn load_state_migrating_legacy_dedup<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>> {
        let raw = match self.storage.load(key).await? {
            Some(s) => s,
            None => return Ok(None),
        };
        let mut value: serde_json::Value = serde_json::from_str(&raw).map_err(Error::from)?;
        if let Some(legacy_ids) = value
            .as_object_mut()
            .and_then(|obj| obj.remove("processedEventIds"))
        {
            if let Some(ids) = legacy_ids.as_array() {
                for id in ids.iter().filter_map(|v| v.as_str()) {
                    self.dedup.import_legacy_id(id);
                }
                debug!(
                    "migrated {} legacy processedEventIds entries into the bloom filter for {}",
                    ids.len(),
                    key
                );
            }
        }
        Ok(Some(serde_json::from_value(value).map_err(Error::from)?))
    }

    pub async fn save_dedup_snapshot(&self, key: &str) -> Result<()> {
        self.save_state(key, &self.dedup.snapshot()).await
    }

    pub async fn load_dedup_snapshot(&self, key: &str) -> Result<Option<BloomSnapshot>> {
        self.load_state(key).await
    }
}
