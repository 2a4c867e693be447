//! Encrypted request/response messaging over a pub/sub relay (spec
//! §4.4): the gift-wrapped envelope, the dedup structure, the relay
//! transport contract, request/response correlation, and server-side
//! routing/middleware.

pub mod client;
pub mod dedup;
pub mod envelope;
pub mod middleware;
pub mod peer;
pub mod relay;
pub mod router;
pub mod wire;

pub use client::Correlator;
pub use dedup::EventDedup;
pub use peer::PeerCore;
pub use relay::{FanoutRelay, NostrRelay, NullRelay, RelayTransport, SubscriptionId};
pub use router::{Handler, Outcome, ResponseBuilder, Router};
pub use wire::{Request, Response};
