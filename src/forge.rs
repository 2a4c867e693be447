//! The issuer peer (spec §2 component C, §4.2, §4.3): authoritative
//! spent-token set, supply accounting, and the `forge`/`transfer`/
//! `burn`/`verify` NWPC methods built on [`PeerCore`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info};
use parking_lot::RwLock;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::messaging::middleware::{AuthGate, OnlyAuthorized, OnlyOwner};
use crate::messaging::router::{Handler, Outcome, ResponseBuilder, Router};
use crate::messaging::{PeerCore, RelayTransport, Request, Response};
use crate::storage::{forge_keys_key, forge_state_key, set_from_tagged, tagged_set, Storage, Tagged};
use crate::token::{Token, TokenType};

/// Per-issuer authoritative state (spec §3.2).
pub struct ForgeState {
    pub token_type: TokenType,
    pub owner: String,
    pub authorized_forgers: HashSet<String>,
    pub spent_tokens: HashSet<String>,
    pub total_supply: u64,
    pub circulating_supply: u64,
    pub last_asset_id: u64,
    pub relays: HashSet<String>,
}

impl ForgeState {
    pub fn new(owner: String, total_supply: u64, token_type: TokenType, relays: HashSet<String>) -> Self {
        let mut authorized_forgers = HashSet::new();
        authorized_forgers.insert(owner.clone());
        ForgeState {
            token_type,
            owner,
            authorized_forgers,
            spent_tokens: HashSet::new(),
            total_supply,
            circulating_supply: 0,
            last_asset_id: 0,
            relays,
        }
    }

    fn to_wire(&self) -> WireForgeState {
        WireForgeState {
            token_type: self.token_type,
            owner: self.owner.clone(),
            authorized_forgers: tagged_set(&self.authorized_forgers),
            spent_tokens: tagged_set(&self.spent_tokens),
            total_supply: self.total_supply,
            circulating_supply: self.circulating_supply,
            last_asset_id: self.last_asset_id,
            relays: tagged_set(&self.relays),
        }
    }

    fn from_wire(wire: WireForgeState) -> Self {
        ForgeState {
            token_type: wire.token_type,
            owner: wire.owner,
            authorized_forgers: set_from_tagged(wire.authorized_forgers),
            spent_tokens: set_from_tagged(wire.spent_tokens),
            total_supply: wire.total_supply,
            circulating_supply: wire.circulating_supply,
            last_asset_id: wire.last_asset_id,
            relays: set_from_tagged(wire.relays),
        }
    }
}

/// On-disk shape of [`ForgeState`]: `Set`/`Map` fields go through the
/// tagged wrapper (spec §4.4, §6) so state round-trips byte-compatibly.
#[derive(Serialize, Deserialize)]
struct WireForgeState {
    token_type: TokenType,
    owner: String,
    authorized_forgers: Tagged<String>,
    spent_tokens: Tagged<String>,
    total_supply: u64,
    circulating_supply: u64,
    last_asset_id: u64,
    relays: Tagged<String>,
}

fn parse_pubkey(hex_str: &str) -> Result<nostr::key::PublicKey> {
    nostr::key::PublicKey::from_hex(hex_str)
        .map_err(|e| Error::Internal(format!("invalid pubkey {}: {}", hex_str, e)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForgeParams {
    pub to: String,
    #[serde(default)]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutput {
    pub to: String,
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(rename = "tokenID", default)]
    pub token_id: Option<u64>,
}

/// A `transfer` request's params — both what a `Forge` parses off the
/// wire and what a `Pocket` serializes to send (spec §4.2, §6): the
/// same struct is the client- and server-side shape, matching the
/// single wire contract spec §6's NWPC table describes.
#[derive(Debug, Serialize, Deserialize)]
pub struct TransferParams {
    pub ins: Vec<String>,
    pub outs: Vec<TransferOutput>,
    #[serde(rename = "witnessData", default)]
    pub witness_data: Option<Vec<String>>,
    #[serde(rename = "htlcSecret", default)]
    pub htlc_secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BurnParams {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "tokenJWT")]
    pub token_jwt: String,
}

struct BuiltOutput {
    jwt: String,
    recipient_hex: String,
}

/// The issuer peer. Holds its own [`PeerCore`] for transport/dedup/
/// correlation and a router wired with the NWPC methods of spec §6.
pub struct Forge {
    pub core: PeerCore,
    pub state: RwLock<ForgeState>,
    router: Router<Forge>,
    /// Serializes `transfer`/`burn` end-to-end — held across the full
    /// validate-then-commit span, not just the `spent_tokens` insert,
    /// so two concurrent calls racing the same input cannot both pass
    /// the `AlreadySpent` check before either commits (spec §4.2, §5,
    /// §8 scenario 3). `state`'s `RwLock` alone does not give this:
    /// token preparation/signing between the read and write sections
    /// is unguarded without it.
    transfer_lock: tokio::sync::Mutex<()>,
}

impl AuthGate for Forge {
    fn is_authorized_forger(&self, pubkey: &str) -> bool {
        self.state.read().authorized_forgers.contains(pubkey)
    }

    fn is_owner(&self, pubkey: &str) -> bool {
        self.state.read().owner == pubkey
    }
}

impl Forge {
    pub fn new(
        secret_key: SecretKey,
        relay: Arc<dyn RelayTransport>,
        storage: Arc<dyn Storage>,
        owner_hex: Option<String>,
        total_supply: u64,
        token_type: TokenType,
        relays: HashSet<String>,
    ) -> Result<Self> {
        let core = PeerCore::new(secret_key, relay, storage)?;
        let owner = owner_hex.unwrap_or_else(|| core.public_key_hex());
        let state = ForgeState::new(owner, total_supply, token_type, relays);
        Ok(Forge {
            core,
            state: RwLock::new(state),
            router: build_router(),
            transfer_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Builds a `Forge` from a [`crate::config::PeerConfig`] (spec
    /// SPEC_FULL §4.6): storage comes from `config.build_storage()`,
    /// and the identity secret key is persisted under
    /// `forge-keys-<pubkey>` (spec §6) the first time this forge
    /// starts, so a restart can recover key material from storage
    /// alone rather than requiring the caller to re-supply it.
    pub async fn from_config(
        config: &crate::config::PeerConfig,
        relay: Arc<dyn RelayTransport>,
        owner_hex: Option<String>,
        total_supply: u64,
        token_type: TokenType,
    ) -> Result<Self> {
        let storage = config.build_storage()?;
        let relays: HashSet<String> = config.relay_urls.iter().cloned().collect();
        let forge = Self::new(
            config.identity_key,
            relay,
            storage.clone(),
            owner_hex,
            total_supply,
            token_type,
            relays,
        )?;

        let keys_key = forge_keys_key(&forge.core.public_key_hex());
        if storage.get(&keys_key).await?.is_none() {
            storage
                .put(&keys_key, hex::encode(config.identity_key.as_ref()))
                .await?;
        }

        forge.load().await?;
        Ok(forge)
    }

    /// Restores persisted state (if any) under `forge-state-<pubkey>`,
    /// importing a legacy `processedEventIds` array into the Bloom
    /// filter per the migration rule in spec §6.
    pub async fn load(&self) -> Result<()> {
        let key = forge_state_key(&self.core.public_key_hex());
        if let Some(wire) = self
            .core
            .load_state_migrating_legacy_dedup::<WireForgeState>(&key)
            .await?
        {
            *self.state.write() = ForgeState::from_wire(wire);
        }
        if let Some(snapshot) = self
            .core
            .load_dedup_snapshot("processedEventBloom")
            .await?
        {
            self.core.dedup.restore_from(snapshot);
        }
        Ok(())
    }

    async fn persist_state(&self) -> Result<()> {
        let wire = self.state.read().to_wire();
        let key = forge_state_key(&self.core.public_key_hex());
        self.core.save_state(&key, &wire).await?;
        self.core.save_dedup_snapshot("processedEventBloom").await
    }

    /// Dispatches a decrypted inbound request through the NWPC router
    /// and returns the reply to send back to `sender`.
    pub async fn dispatch(&self, req: &Request, sender: &str) -> Response {
        self.router.dispatch(req, sender, self).await
    }

    /// Drives this forge's own identity-key subscription (spec §4.4):
    /// opens each inbound event, parses it as a `Request`, routes it
    /// through [`Self::dispatch`], and gift-wraps the reply back to the
    /// sender. Malformed payloads (not a `Request` at all) are dropped
    /// the same way a failed decryption is (spec §7). Runs until the
    /// subscription stream ends — callers that want this alongside
    /// other work should spawn it.
    pub async fn run(&self) -> Result<()> {
        use futures::StreamExt;
        let pubkey = self.core.public_key();
        let (_sub_id, mut stream) = self.core.subscribe(&pubkey).await?;
        while let Some(event) = stream.next().await {
            let (value, sender) = match self.core.open_event(&event) {
                Some(opened) => opened,
                None => continue,
            };
            let req: Request = match serde_json::from_value(value) {
                Ok(req) => req,
                Err(e) => {
                    log::warn!("forge: dropping non-request payload from {}: {}", sender, e);
                    continue;
                }
            };
            let sender_hex = hex::encode(sender.serialize());
            let reply = self.dispatch(&req, &sender_hex).await;
            if let Err(e) = self.core.send_reply(&sender, &reply).await {
                error!("forge: failed to send reply to {}: {}", sender_hex, e);
            }
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<Value> {
        Ok(serde_json::json!({"message": "pong"}))
    }

    /// `forge(recipient, amount|nothing)` (spec §4.3). Authorization
    /// is enforced by `OnlyAuthorized` at the router level, not here.
    pub async fn forge(&self, sender: &str, params: ForgeParams) -> Result<Value> {
        let recipient = parse_pubkey(&params.to)?;
        let now = Utc::now().timestamp();
        let token_type = self.state.read().token_type;

        let payload = match token_type {
            TokenType::Fungible => {
                let amount = params
                    .amount
                    .ok_or_else(|| Error::InvalidTransaction("amount is required".to_owned()))?;
                if amount == 0 {
                    return Err(Error::InvalidTransaction("amount must be positive".to_owned()));
                }
                {
                    let mut state = self.state.write();
                    if state.total_supply > 0 && state.circulating_supply + amount > state.total_supply {
                        return Err(Error::SupplyExceeded {
                            circulating: state.circulating_supply,
                            amount,
                            cap: state.total_supply,
                        });
                    }
                    state.circulating_supply += amount;
                }
                crate::token::Payload {
                    iss: self.core.public_key_hex(),
                    iat: now,
                    exp: None,
                    amount: Some(amount),
                    token_id: None,
                    p2pk_lock: Some(params.to.clone()),
                    time_lock: None,
                    htlc: None,
                    data_uri: None,
                }
            }
            TokenType::Tat => {
                let token_id;
                {
                    let mut state = self.state.write();
                    if state.total_supply > 0 && state.circulating_supply + 1 > state.total_supply {
                        return Err(Error::SupplyExceeded {
                            circulating: state.circulating_supply,
                            amount: 1,
                            cap: state.total_supply,
                        });
                    }
                    token_id = state.last_asset_id;
                    state.last_asset_id += 1;
                    state.circulating_supply += 1;
                }
                crate::token::Payload {
                    iss: self.core.public_key_hex(),
                    iat: now,
                    exp: None,
                    amount: None,
                    token_id: Some(token_id),
                    p2pk_lock: Some(params.to.clone()),
                    time_lock: None,
                    htlc: None,
                    data_uri: None,
                }
            }
        };

        let token = Token::build(token_type, payload)?;
        let secret_key = self.core.secret_key()?;
        let sig = token.sign(&secret_key)?;
        let jwt = token.to_jwt(&sig)?;

        self.persist_state().await?;

        let reply = Response::ok(Uuid::new_v4().to_string(), serde_json::json!({"token": jwt}), now)
            .map_err(Error::from)?;
        if let Err(e) = self.core.send_reply(&recipient, &reply).await {
            error!("forge: failed to deliver minted token to {}: {}", params.to, e);
        }
        info!("forge: minted token for {} (authorized by {})", params.to, sender);
        Ok(serde_json::json!({"token": jwt}))
    }

    /// The multi-input/multi-output transfer pipeline (spec §4.2):
    /// validation, preparation, and commit, strictly in that order.
    pub async fn transfer(&self, sender: &str, params: TransferParams) -> Result<Value> {
        if params.ins.is_empty() {
            return Err(Error::InvalidTransaction("transfer requires at least one input".to_owned()));
        }
        // Held for the entire validate-then-commit span below, not just
        // the `spent_tokens` insert: this is what makes the commit
        // atomic w.r.t. other `transfer`/`burn` calls (spec §4.2, §5).
        let _guard = self.transfer_lock.lock().await;
        let now = Utc::now().timestamp();
        let now_ms = Utc::now().timestamp_millis();
        let self_pubkey = self.core.public_key_hex();

        // --- Validation phase (no state mutation) ---
        let mut inputs = Vec::with_capacity(params.ins.len());
        for jwt in &params.ins {
            let (token, sig) = Token::restore(jwt)?;
            if token.payload.iss != self_pubkey {
                return Err(Error::InvalidTransaction("input issued by a different forge".to_owned()));
            }
            if !token.verify_signature(&self_pubkey, &sig)? {
                return Err(Error::InvalidSignature);
            }
            let hash = token.recompute_hash()?;
            inputs.push((token, hash));
        }

        let token_type = inputs[0].0.header.typ;
        if inputs.iter().any(|(t, _)| t.header.typ != token_type) {
            return Err(Error::InvalidTransaction("mixed token types among inputs".to_owned()));
        }

        {
            let state = self.state.read();
            for (_, hash) in &inputs {
                if state.spent_tokens.contains(hash) {
                    return Err(Error::AlreadySpent {
                        hash: hash.clone(),
                        issuer: self_pubkey.clone(),
                    });
                }
            }
        }

        for (token, _) in &inputs {
            if token.is_expired(now) {
                return Err(Error::Expired);
            }
        }

        for (i, (token, _)) in inputs.iter().enumerate() {
            if let Some(p2pk) = &token.payload.p2pk_lock {
                let witness = params
                    .witness_data
                    .as_ref()
                    .and_then(|w| w.get(i))
                    .cloned()
                    .unwrap_or_default();
                if witness.is_empty() || !token.verify_signature(p2pk, &witness)? {
                    return Err(Error::BadWitness(i));
                }
            }
        }

        for (token, _) in &inputs {
            if let Some(time_lock) = token.payload.time_lock {
                if time_lock > now_ms {
                    return Err(Error::TimeLocked);
                }
            }
        }

        for (token, _) in &inputs {
            if let Some(htlc) = &token.payload.htlc {
                // A submitted secret is always an attempt to *redeem*:
                // it must land inside the redeem window, even though
                // `now >= timelock` would otherwise make the token
                // refundable (spec §4.1a, §8 scenario 6 — "rejects
                // with Locked (redeem window closed; only refund path
                // valid)"). No secret is always an attempt to *refund*,
                // gated on the timelock alone.
                let ok = match params.htlc_secret.as_deref() {
                    Some(secret) => htlc.is_redeemable(now_ms, Some(secret)),
                    None => htlc.is_refundable(now_ms),
                };
                if !ok {
                    return Err(Error::Locked);
                }
            }
        }

        // --- Preparation phase (still no state mutation) ---
        let first_time_lock = inputs[0].0.payload.time_lock;
        let first_data_uri = inputs[0].0.payload.data_uri.clone();
        let secret_key = self.core.secret_key()?;
        let mut built: Vec<BuiltOutput> = Vec::new();

        match token_type {
            TokenType::Fungible => {
                for out in &params.outs {
                    out.amount.filter(|&a| a > 0).ok_or_else(|| {
                        Error::InvalidTransaction("fungible output amount must be positive".to_owned())
                    })?;
                }
                let total_in: u64 = inputs.iter().map(|(t, _)| t.payload.amount.unwrap_or(0)).sum();
                let total_out: u64 = params.outs.iter().map(|o| o.amount.unwrap_or(0)).sum();
                if total_out > total_in {
                    return Err(Error::InvalidTransaction(
                        "sum(outs) exceeds sum(ins)".to_owned(),
                    ));
                }

                for out in &params.outs {
                    let payload = crate::token::Payload {
                        iss: self_pubkey.clone(),
                        iat: now,
                        exp: None,
                        amount: out.amount,
                        token_id: None,
                        p2pk_lock: Some(out.to.clone()),
                        time_lock: first_time_lock,
                        htlc: None,
                        data_uri: first_data_uri.clone(),
                    };
                    let token = Token::build(TokenType::Fungible, payload)?;
                    let sig = token.sign(&secret_key)?;
                    built.push(BuiltOutput {
                        jwt: token.to_jwt(&sig)?,
                        recipient_hex: out.to.clone(),
                    });
                }

                let change = total_in - total_out;
                if change > 0 {
                    let payload = crate::token::Payload {
                        iss: self_pubkey.clone(),
                        iat: now,
                        exp: None,
                        amount: Some(change),
                        token_id: None,
                        p2pk_lock: Some(sender.to_owned()),
                        time_lock: first_time_lock,
                        htlc: None,
                        data_uri: first_data_uri.clone(),
                    };
                    let token = Token::build(TokenType::Fungible, payload)?;
                    let sig = token.sign(&secret_key)?;
                    built.push(BuiltOutput {
                        jwt: token.to_jwt(&sig)?,
                        recipient_hex: sender.to_owned(),
                    });
                }
            }
            TokenType::Tat => {
                let mut remaining_ids: Vec<u64> = inputs
                    .iter()
                    .filter_map(|(t, _)| t.payload.token_id)
                    .collect();
                for out in &params.outs {
                    let wanted = out.token_id.ok_or_else(|| {
                        Error::InvalidTransaction("TAT output requires tokenID".to_owned())
                    })?;
                    let pos = remaining_ids
                        .iter()
                        .position(|&id| id == wanted)
                        .ok_or_else(|| {
                            Error::InvalidTransaction(format!(
                                "tokenID {} not present among inputs",
                                wanted
                            ))
                        })?;
                    remaining_ids.remove(pos);

                    let payload = crate::token::Payload {
                        iss: self_pubkey.clone(),
                        iat: now,
                        exp: None,
                        amount: None,
                        token_id: Some(wanted),
                        p2pk_lock: Some(out.to.clone()),
                        time_lock: first_time_lock,
                        htlc: None,
                        data_uri: first_data_uri.clone(),
                    };
                    let token = Token::build(TokenType::Tat, payload)?;
                    let sig = token.sign(&secret_key)?;
                    built.push(BuiltOutput {
                        jwt: token.to_jwt(&sig)?,
                        recipient_hex: out.to.clone(),
                    });
                }
            }
        }

        // --- Commit phase (atomic w.r.t. other transfer/burn calls via
        // `state`'s write lock; see spec §4.2, §5) ---
        {
            let mut state = self.state.write();
            for (_, hash) in &inputs {
                state.spent_tokens.insert(hash.clone());
            }
        }

        if let Err(e) = self.persist_state().await {
            error!("transfer: state save failed after commit began: {}", e);
        }

        if let Ok(sender_pk) = parse_pubkey(sender) {
            for (_, hash) in &inputs {
                match Response::ok(
                    Uuid::new_v4().to_string(),
                    serde_json::json!({"spent": hash, "issuer": self_pubkey}),
                    now,
                ) {
                    Ok(notif) => {
                        if let Err(e) = self.core.send_reply(&sender_pk, &notif).await {
                            error!("transfer: failed to publish spent notification: {}", e);
                        }
                    }
                    Err(e) => error!("transfer: failed to build spent notification: {}", e),
                }
            }
        } else {
            error!("transfer: sender {} is not a valid pubkey, skipping spent notifications", sender);
        }

        for output in &built {
            match parse_pubkey(&output.recipient_hex) {
                Ok(recipient_pk) => {
                    match Response::ok(
                        Uuid::new_v4().to_string(),
                        serde_json::json!({"token": output.jwt}),
                        now,
                    ) {
                        Ok(reply) => {
                            if let Err(e) = self.core.send_reply(&recipient_pk, &reply).await {
                                error!(
                                    "transfer: failed to deliver output to {}: {}",
                                    output.recipient_hex, e
                                );
                            }
                        }
                        Err(e) => error!("transfer: failed to build output reply: {}", e),
                    }
                }
                Err(e) => error!("transfer: invalid recipient {}: {}", output.recipient_hex, e),
            }
        }

        Ok(serde_json::json!({
            "outputs": built.iter().map(|o| serde_json::json!({"to": o.recipient_hex, "token": o.jwt})).collect::<Vec<_>>()
        }))
    }

    /// `burn(tokenJWT)` (spec §4.3). Owner-only, enforced by `OnlyOwner`
    /// at the router level.
    pub async fn burn(&self, _sender: &str, params: BurnParams) -> Result<Value> {
        // Same lock `transfer` holds: burn and transfer must not
        // interleave their check-then-insert on the same token hash.
        let _guard = self.transfer_lock.lock().await;
        let (token, sig) = Token::restore(&params.token)?;
        let self_pubkey = self.core.public_key_hex();
        if !token.verify_signature(&self_pubkey, &sig)? {
            return Err(Error::InvalidSignature);
        }
        let hash = token.recompute_hash()?;
        {
            let mut state = self.state.write();
            if state.spent_tokens.contains(&hash) {
                return Err(Error::AlreadySpent {
                    hash: hash.clone(),
                    issuer: self_pubkey.clone(),
                });
            }
            state.spent_tokens.insert(hash.clone());
        }
        self.persist_state().await?;
        info!("burn: {} marked spent", hash);
        Ok(serde_json::json!({"success": true}))
    }

    /// `verify(tokenJWT) -> {valid: bool}` (spec §4.3). Read-only.
    pub async fn verify(&self, _sender: &str, params: VerifyParams) -> Result<Value> {
        let valid = match Token::restore(&params.token_jwt) {
            Ok((token, sig)) => {
                let self_pubkey = self.core.public_key_hex();
                let sig_ok = token.verify_signature(&self_pubkey, &sig).unwrap_or(false);
                let hash = token.recompute_hash().unwrap_or_default();
                let now = Utc::now().timestamp();
                sig_ok && !token.is_expired(now) && !self.state.read().spent_tokens.contains(&hash)
            }
            Err(_) => false,
        };
        Ok(serde_json::json!({"valid": valid}))
    }
}

struct PingHandler;
struct ForgeHandler;
struct TransferHandler;
struct BurnHandler;
struct VerifyHandler;

#[async_trait]
impl Handler<Forge> for PingHandler {
    async fn call(&self, req: &Request, _sender: &str, ctx: &Forge, res: &mut ResponseBuilder) -> Result<Outcome> {
        res.ok(req.id.clone(), ctx.ping().await?)?;
        Ok(Outcome::Handled)
    }
}

#[async_trait]
impl Handler<Forge> for ForgeHandler {
    async fn call(&self, req: &Request, sender: &str, ctx: &Forge, res: &mut ResponseBuilder) -> Result<Outcome> {
        let params: ForgeParams = req.parse_params().map_err(Error::from)?;
        let result = ctx.forge(sender, params).await?;
        res.ok(req.id.clone(), result)?;
        Ok(Outcome::Handled)
    }
}

#[async_trait]
impl Handler<Forge> for TransferHandler {
    async fn call(&self, req: &Request, sender: &str, ctx: &Forge, res: &mut ResponseBuilder) -> Result<Outcome> {
        let params: TransferParams = req.parse_params().map_err(Error::from)?;
        let result = ctx.transfer(sender, params).await?;
        res.ok(req.id.clone(), result)?;
        Ok(Outcome::Handled)
    }
}

#[async_trait]
impl Handler<Forge> for BurnHandler {
    async fn call(&self, req: &Request, sender: &str, ctx: &Forge, res: &mut ResponseBuilder) -> Result<Outcome> {
        let params: BurnParams = req.parse_params().map_err(Error::from)?;
        let result = ctx.burn(sender, params).await?;
        res.ok(req.id.clone(), result)?;
        Ok(Outcome::Handled)
    }
}

#[async_trait]
impl Handler<Forge> for VerifyHandler {
    async fn call(&self, req: &Request, sender: &str, ctx: &Forge, res: &mut ResponseBuilder) -> Result<Outcome> {
        let params: VerifyParams = req.parse_params().map_err(Error::from)?;
        let result = ctx.verify(sender, params).await?;
        res.ok(req.id.clone(), result)?;
        Ok(Outcome::Handled)
    }
}

fn build_router() -> Router<Forge> {
    let mut router = Router::new();
    router.register("ping", vec![Arc::new(PingHandler)]);
    router.register("forge", vec![Arc::new(OnlyAuthorized), Arc::new(ForgeHandler)]);
    router.register("transfer", vec![Arc::new(TransferHandler)]);
    router.register("burn", vec![Arc::new(OnlyOwner), Arc::new(BurnHandler)]);
    router.register("verify", vec![Arc::new(VerifyHandler)]);
    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{gen_keypair, new_forge, xonly_hex};

    #[tokio::test]
    async fn run_returns_once_the_subscription_stream_ends() {
        // NullRelay's subscription stream is immediately empty, so the
        // event loop should return rather than hang.
        let (forge, _) = new_forge(0, TokenType::Fungible);
        forge.run().await.unwrap();
    }

    #[tokio::test]
    async fn forge_respects_supply_cap() {
        let (forge, _) = new_forge(100, TokenType::Fungible);
        let recipient_sk = gen_keypair();
        let recipient_xonly = xonly_hex(&recipient_sk);

        let owner_hex = forge.core.public_key_hex();
        forge
            .forge(
                &owner_hex,
                ForgeParams {
                    to: recipient_xonly.clone(),
                    amount: Some(100),
                },
            )
            .await
            .unwrap();
        assert_eq!(forge.state.read().circulating_supply, 100);

        let result = forge
            .forge(
                &owner_hex,
                ForgeParams {
                    to: recipient_xonly,
                    amount: Some(1),
                },
            )
            .await;
        assert!(matches!(result, Err(Error::SupplyExceeded { .. })));
    }

    #[tokio::test]
    async fn double_spend_is_rejected_with_409_payload() {
        let (forge, _) = new_forge(0, TokenType::Fungible);
        let owner_hex = forge.core.public_key_hex();
        let recipient_sk = gen_keypair();
        let recipient_hex = xonly_hex(&recipient_sk);

        let minted = forge
            .forge(
                &owner_hex,
                ForgeParams {
                    to: recipient_hex.clone(),
                    amount: Some(50),
                },
            )
            .await
            .unwrap();
        let jwt = minted["token"].as_str().unwrap().to_owned();
        let (token, _) = Token::restore(&jwt).unwrap();
        let hash = token.recompute_hash().unwrap();
        let witness = token.sign(&recipient_sk).unwrap();

        let other_hex = xonly_hex(&gen_keypair());

        let params = TransferParams {
            ins: vec![jwt.clone()],
            outs: vec![TransferOutput {
                to: other_hex.clone(),
                amount: Some(50),
                token_id: None,
            }],
            witness_data: Some(vec![witness.clone()]),
            htlc_secret: None,
        };
        forge.transfer(&recipient_hex, params).await.unwrap();
        assert!(forge.state.read().spent_tokens.contains(&hash));

        let params_again = TransferParams {
            ins: vec![jwt],
            outs: vec![TransferOutput {
                to: other_hex,
                amount: Some(50),
                token_id: None,
            }],
            witness_data: Some(vec![witness]),
            htlc_secret: None,
        };
        let result = forge.transfer(&recipient_hex, params_again).await;
        match result {
            Err(Error::AlreadySpent { hash: h, .. }) => assert_eq!(h, hash),
            other => panic!("expected AlreadySpent, got {:?}", other.is_ok()),
        }
    }
}
