//! The pub/sub relay transport contract (spec §6): `publish`,
//! `subscribe`, `close`. Any service meeting this contract is
//! substitutable — the core never depends on a concrete relay, only on
//! this trait. `NostrRelay` is the one adapter the crate ships, built
//! on `nostr-sdk`, matching spec §6's "the default is an off-the-shelf
//! Nostr-style relay".

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use nostr::{Event, Filter, Keys};
use nostr_sdk::Client;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A single subscription handle, closable independently of the relay
/// connection itself.
pub struct SubscriptionId(pub String);

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribes with `filter`; the returned stream yields events as
    /// they arrive (after an initial backfill of anything the relay
    /// already has matching the filter — spec §4.4's EOSE-then-live
    /// semantics are the relay's concern, not the core's).
    async fn subscribe(&self, filter: Filter) -> Result<(SubscriptionId, BoxStream<'static, Event>)>;

    async fn close(&self, subscription: SubscriptionId) -> Result<()>;
}

/// The default adapter: a `nostr-sdk::Client` wired to one or more
/// relay URLs.
pub struct NostrRelay {
    client: Client,
}

impl NostrRelay {
    pub async fn connect(signer_keys: Keys, relay_urls: &[String]) -> Result<Self> {
        let client = Client::new(&signer_keys);
        for url in relay_urls {
            client
                .add_relay(url.as_str())
                .await
                .map_err(|e| Error::Internal(format!("add_relay {}: {}", url, e)))?;
        }
        client.connect().await;
        Ok(NostrRelay { client })
    }
}

#[async_trait]
impl RelayTransport for NostrRelay {
    async fn publish(&self, event: Event) -> Result<()> {
        self.client
            .send_event(event)
            .await
            .map_err(|e| Error::Internal(format!("publish failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<(SubscriptionId, BoxStream<'static, Event>)> {
        let sub_id = self
            .client
            .subscribe(vec![filter], None)
            .await
            .map_err(|e| Error::Internal(format!("subscribe failed: {}", e)))?;
        let registered_id = sub_id.val.clone();
        let stream = self
            .client
            .notifications()
            .filter_map(move |notification| {
                let registered_id = registered_id.clone();
                async move {
                    match notification {
                        nostr_sdk::RelayPoolNotification::Event {
                            subscription_id,
                            event,
                            ..
                        } if subscription_id == registered_id => Some(*event),
                        _ => None,
                    }
                }
            });
        Ok((SubscriptionId(sub_id.val.to_string()), Box::pin(stream)))
    }

    async fn close(&self, subscription: SubscriptionId) -> Result<()> {
        self.client
            .unsubscribe(subscription.0.parse().map_err(|_| {
                Error::Internal("invalid subscription id".to_owned())
            })?)
            .await;
        Ok(())
    }
}

/// A relay that accepts publishes and never yields any subscribed
/// events — used in unit tests that exercise `Forge`/`Pocket` logic
/// without a live relay connection.
#[derive(Default)]
pub struct NullRelay;

#[async_trait]
impl RelayTransport for NullRelay {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _filter: Filter) -> Result<(SubscriptionId, BoxStream<'static, Event>)> {
        Ok((SubscriptionId("null".to_owned()), Box::pin(futures::stream::empty())))
    }

    async fn close(&self, _subscription: SubscriptionId) -> Result<()> {
        Ok(())
    }
}

/// A relay fake that actually delivers: `publish` hands each event to
/// every currently open subscription whose filter matches it (spec §6's
/// pub/sub contract), the way a real relay fans one published event out
/// to every subscriber it satisfies. `NullRelay`'s always-empty stream
/// can never exercise two concurrent subscriptions sharing one relay/
/// dedup pair (the identity subscription and a single-use receive
/// subscription both opened by one `Pocket`); this one can.
#[derive(Default)]
pub struct FanoutRelay {
    subscriptions: Mutex<Vec<(Filter, mpsc::UnboundedSender<Event>)>>,
}

#[async_trait]
impl RelayTransport for FanoutRelay {
    async fn publish(&self, event: Event) -> Result<()> {
        let subs = self.subscriptions.lock();
        for (filter, tx) in subs.iter() {
            if filter.match_event(&event) {
                let _ = tx.unbounded_send(event.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<(SubscriptionId, BoxStream<'static, Event>)> {
        let (tx, rx) = mpsc::unbounded();
        let id = SubscriptionId(uuid::Uuid::new_v4().to_string());
        self.subscriptions.lock().push((filter, tx));
        Ok((id, Box::pin(rx)))
    }

    async fn close(&self, _subscription: SubscriptionId) -> Result<()> {
        Ok(())
    }
}
