//! The gift-wrapped relay event: a `Request`/`Response` is serialized,
//! then encrypted so only the declared recipient can read it, then
//! signed by the sender — all in one outer event of a single reserved
//! kind (spec §4.4, §6). Built on the `nostr` crate's own NIP-44
//! encryption and NIP-59 gift-wrap helpers rather than hand-rolled
//! crypto, since this protocol *is* a Nostr dialect (spec §9's
//! "NWPCBase" naming, and `examples/original_source`'s
//! `bigmarh/tat-protocol` provenance, both point at Nostr directly).

use nostr::key::{Keys, PublicKey, SecretKey};
use nostr::{Event as NostrEvent, EventBuilder, Kind};

use crate::error::{Error, Result};

/// The relay event kind this protocol gift-wraps everything inside of.
/// Spec §4.4 calls this "the outer relay event kind is fixed (value
/// 1059 in the source); any single reserved kind suffices" — 1059 is
/// also NIP-59's own gift-wrap kind, so no kind collision is possible
/// with ordinary Nostr traffic.
pub const GIFT_WRAP_KIND: u16 = 1059;

/// A decrypted inbound envelope: the plaintext wire payload plus the
/// verified sender identity (spec §4.4: "decryption yields both the
/// plaintext content and a verified sender identity").
pub struct Opened {
    pub sender: PublicKey,
    pub content: String,
}

/// Encrypts `content` for `recipient` and wraps it in a signed,
/// gift-wrapped kind-1059 event from `sender`.
pub fn gift_wrap(sender: &Keys, recipient: &PublicKey, content: &str) -> Result<NostrEvent> {
    let rumor = EventBuilder::new(Kind::Custom(GIFT_WRAP_KIND as u16), content, [])
        .to_unsigned_event(sender.public_key());
    let wrapped = EventBuilder::gift_wrap(sender, recipient, rumor, [])
        .map_err(|e| Error::Internal(format!("gift wrap failed: {}", e)))?;
    Ok(wrapped)
}

/// Decrypts a gift-wrapped event addressed to `recipient_secret`,
/// returning the inner plaintext and the verified original sender.
/// Decryption failure (wrong recipient, tampered envelope) is not an
/// error condition the caller should propagate — per spec §7 it means
/// "the event is not addressed to us" and the event is silently
/// dropped by the subscription loop that calls this.
pub fn open_gift_wrap(recipient_secret: &SecretKey, event: &NostrEvent) -> Result<Opened> {
    let keys = Keys::new(recipient_secret.clone());
    let unwrapped = event
        .unwrap_gift_wrap(&keys)
        .map_err(|e| Error::Internal(format!("gift unwrap failed: {}", e)))?;
    Ok(Opened {
        sender: unwrapped.sender,
        content: unwrapped.rumor.content,
    })
}
