//! The holder peer (spec §2 component D, §3.3, §4.5): owns token JWTs
//! indexed by issuer and denomination, selects coins for outgoing
//! transfers, derives single-use receive keys, and reconciles its
//! indices against spent-notification pushes.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{error, info, warn};
use parking_lot::RwLock;
use secp256k1::{Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::{HdMasterKey, SingleUseKey};
use crate::messaging::{PeerCore, RelayTransport, SubscriptionId};
use crate::storage::{
    map_from_tagged, pocket_idkey_key, pocket_state_key, tagged_map, Storage, Tagged,
};
use crate::token::Token;

fn xonly_pubkey_hex(secret_key: &SecretKey) -> String {
    let secp = Secp256k1::new();
    let keypair = secp256k1::schnorrsig::KeyPair::from_secret_key(&secp, *secret_key);
    let xonly = secp256k1::schnorrsig::PublicKey::from_keypair(&secp, &keypair);
    hex::encode(xonly.serialize())
}

fn parse_pubkey(hex_str: &str) -> Result<nostr::key::PublicKey> {
    nostr::key::PublicKey::from_hex(hex_str)
        .map_err(|e| Error::Internal(format!("invalid pubkey {}: {}", hex_str, e)))
}

/// Per-holder state (spec §3.3). Denominations and TAT ids are kept as
/// decimal strings so the nested maps round-trip through the tagged
/// `Map` wire convention (spec §4.4) without a bespoke numeric-key
/// serializer.
#[derive(Default)]
pub struct PocketState {
    pub single_use_keys: BTreeMap<String, SingleUseKey>,
    pub tokens: BTreeMap<String, BTreeMap<String, String>>,
    pub token_index: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub tat_index: BTreeMap<String, BTreeMap<String, String>>,
    pub balances: BTreeMap<String, BTreeMap<String, u64>>,
}

impl PocketState {
    fn to_wire(&self) -> WirePocketState {
        WirePocketState {
            single_use_keys: tagged_map(&self.single_use_keys),
            tokens: tagged_map(
                &self
                    .tokens
                    .iter()
                    .map(|(issuer, by_hash)| (issuer.clone(), tagged_map(by_hash)))
                    .collect(),
            ),
            token_index: tagged_map(
                &self
                    .token_index
                    .iter()
                    .map(|(issuer, by_denom)| (issuer.clone(), tagged_map(by_denom)))
                    .collect(),
            ),
            tat_index: tagged_map(
                &self
                    .tat_index
                    .iter()
                    .map(|(issuer, by_id)| (issuer.clone(), tagged_map(by_id)))
                    .collect(),
            ),
            balances: tagged_map(
                &self
                    .balances
                    .iter()
                    .map(|(issuer, by_denom)| (issuer.clone(), tagged_map(by_denom)))
                    .collect(),
            ),
        }
    }

    fn from_wire(wire: WirePocketState) -> Self {
        PocketState {
            single_use_keys: map_from_tagged(wire.single_use_keys),
            tokens: map_from_tagged(wire.tokens)
                .into_iter()
                .map(|(issuer, inner)| (issuer, map_from_tagged(inner)))
                .collect(),
            token_index: map_from_tagged(wire.token_index)
                .into_iter()
                .map(|(issuer, inner)| (issuer, map_from_tagged(inner)))
                .collect(),
            tat_index: map_from_tagged(wire.tat_index)
                .into_iter()
                .map(|(issuer, inner)| (issuer, map_from_tagged(inner)))
                .collect(),
            balances: map_from_tagged(wire.balances)
                .into_iter()
                .map(|(issuer, inner)| (issuer, map_from_tagged(inner)))
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WirePocketState {
    single_use_keys: Tagged<SingleUseKey>,
    tokens: Tagged<Tagged<String>>,
    token_index: Tagged<Tagged<Vec<String>>>,
    tat_index: Tagged<Tagged<String>>,
    balances: Tagged<Tagged<u64>>,
}

/// One fully-assembled outgoing transfer: the selected input JWTs, the
/// matching witness signatures, and the bookkeeping needed to reconcile
/// once the forge's outputs and spent-notifications arrive.
pub struct PreparedTransfer {
    pub ins: Vec<String>,
    pub witness_data: Vec<String>,
    pub selected_total: u64,
}

/// The holder peer. Embeds `PeerCore` for transport/dedup/correlation
/// and holds its own coin index plus the HD master key single-use
/// receive addresses derive from (spec §4.5).
pub struct Pocket {
    pub core: PeerCore,
    pub state: RwLock<PocketState>,
    hd_master_key: RwLock<HdMasterKey>,
}

impl Pocket {
    pub fn new(
        secret_key: SecretKey,
        hd_master_key: HdMasterKey,
        relay: Arc<dyn RelayTransport>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let core = PeerCore::new(secret_key, relay, storage)?;
        Ok(Pocket {
            core,
            state: RwLock::new(PocketState::default()),
            hd_master_key: RwLock::new(hd_master_key),
        })
    }

    /// Builds a `Pocket` from a [`crate::config::PeerConfig`] (spec
    /// SPEC_FULL §4.6): storage comes from `config.build_storage()`,
    /// and the HD mnemonic is persisted under `pocket-idkey-<pubkey>`
    /// (spec §6) the first time this pocket starts — generated fresh
    /// if storage has nothing under that key, reused otherwise, so a
    /// restart derives the same single-use addresses as before.
    pub async fn from_config(config: &crate::config::PeerConfig, relay: Arc<dyn RelayTransport>) -> Result<Self> {
        let storage = config.build_storage()?;
        let pubkey_hex = PeerCore::public_key_hex_for(&config.identity_key)?;
        let idkey_key = pocket_idkey_key(&pubkey_hex);

        let hd_master_key = match storage.get(&idkey_key).await? {
            Some(phrase) => HdMasterKey::from_mnemonic(&phrase)?,
            None => {
                let (hd, phrase) = HdMasterKey::generate()?;
                storage.put(&idkey_key, phrase).await?;
                hd
            }
        };

        let pocket = Self::new(config.identity_key, hd_master_key, relay, storage)?;
        pocket.load().await?;
        Ok(pocket)
    }

    pub async fn load(&self) -> Result<()> {
        let key = pocket_state_key(&self.core.public_key_hex());
        if let Some(wire) = self
            .core
            .load_state_migrating_legacy_dedup::<WirePocketState>(&key)
            .await?
        {
            *self.state.write() = PocketState::from_wire(wire);
        }
        if let Some(snapshot) = self.core.load_dedup_snapshot("processedEventBloom").await? {
            self.core.dedup.restore_from(snapshot);
        }
        Ok(())
    }

    async fn persist_state(&self) -> Result<()> {
        let wire = self.state.read().to_wire();
        let key = pocket_state_key(&self.core.public_key_hex());
        self.core.save_state(&key, &wire).await?;
        self.core.save_dedup_snapshot("processedEventBloom").await
    }

    /// Drives this pocket's own identity-key subscription (spec §4.4,
    /// §4.5): every inbound event is either a correlated response to a
    /// request this pocket itself sent (routed via
    /// `PeerCore::try_resolve_response`) or an unsolicited push — a
    /// minted/transferred token or a spent-notification — handled by
    /// [`Self::handle_event`]. Runs until the subscription stream ends;
    /// callers that want this alongside other work should spawn it.
    pub async fn run(&self) -> Result<()> {
        let pubkey = self.core.public_key();
        let (_sub_id, mut stream) = self.core.subscribe(&pubkey).await?;
        while let Some(event) = stream.next().await {
            let (value, _sender) = match self.core.open_event(&event) {
                Some(opened) => opened,
                None => continue,
            };
            if self.core.try_resolve_response(&value) {
                continue;
            }
            self.handle_event(value).await;
        }
        Ok(())
    }

    /// The sum of owned amounts for `issuer`, across all denominations.
    pub fn balance(&self, issuer: &str) -> u64 {
        self.state
            .read()
            .balances
            .get(issuer)
            .map(|by_denom| by_denom.values().sum())
            .unwrap_or(0)
    }

    /// Derives the next single-use receive key (spec §4.5: path
    /// `m/7'/23'/11'/16'/0/<index>`, `index` = current map size),
    /// records it, and opens a subscription for its public key.
    pub async fn get_new_receive_address(
        &self,
    ) -> Result<(String, SubscriptionId, futures::stream::BoxStream<'static, nostr::Event>)> {
        let index = self.state.read().single_use_keys.len() as u32;
        let (secret_key, _) = self.hd_master_key.read().derive_single_use(index)?;
        let pubkey_hex = xonly_pubkey_hex(&secret_key);

        {
            let mut state = self.state.write();
            state
                .single_use_keys
                .insert(pubkey_hex.clone(), SingleUseKey::new(&secret_key));
        }
        self.persist_state().await?;

        let pubkey = parse_pubkey(&pubkey_hex)?;
        let (sub_id, stream) = self.core.subscribe(&pubkey).await?;
        info!("pocket: opened receive address {} (index {})", pubkey_hex, index);
        Ok((pubkey_hex, sub_id, stream))
    }

    /// Drives one single-use receive address end-to-end (spec §4.5):
    /// pulls events from the subscription `get_new_receive_address`
    /// opened, decrypts each with the single-use key's own secret
    /// (never the pocket's identity key — that's the whole point of a
    /// single-use address), and on the first successfully-opened event
    /// hands it to `handle_event`, marks the key `used`, persists, and
    /// closes the subscription. A single-use address delivers at most
    /// once by construction: after the first hit this loop always
    /// breaks, even if more events arrive later.
    pub async fn listen_single_use_address(
        &self,
        pubkey_hex: String,
        sub_id: SubscriptionId,
        mut stream: BoxStream<'static, nostr::Event>,
    ) -> Result<()> {
        while let Some(event) = stream.next().await {
            let secret_key = {
                let state = self.state.read();
                match state.single_use_keys.get(&pubkey_hex) {
                    Some(key) if !key.used => key.secret_key()?,
                    _ => break,
                }
            };

            if let Some((value, _sender)) = self.core.open_event_with_secret(&event, &secret_key) {
                self.handle_event(value).await;

                {
                    let mut state = self.state.write();
                    if let Some(key) = state.single_use_keys.get_mut(&pubkey_hex) {
                        key.used = true;
                    }
                }
                self.persist_state().await?;
                self.core.close_subscription(sub_id).await?;
                info!("pocket: single-use address {} delivered, closing subscription", pubkey_hex);
                break;
            }
        }
        Ok(())
    }

    fn secret_key_for(&self, p2pk_hex: &str) -> Result<SecretKey> {
        if p2pk_hex == self.core.public_key_hex() {
            return self.core.secret_key();
        }
        self.state
            .read()
            .single_use_keys
            .get(p2pk_hex)
            .ok_or_else(|| Error::Internal(format!("no private key known for {}", p2pk_hex)))?
            .secret_key()
    }

    /// Coin selection (spec §4.5): exhaustive search over `0..=count_i`
    /// units of each owned denomination for the combination that meets
    /// `target` while minimizing change, then input count.
    pub fn select_coins(&self, issuer: &str, target: u64) -> Result<PreparedTransfer> {
        let state = self.state.read();
        let index = match state.token_index.get(issuer) {
            Some(index) => index,
            None => {
                return Err(Error::InsufficientFunds {
                    needed: target,
                    available: 0,
                })
            }
        };

        let mut denominations: Vec<(u64, usize)> = index
            .iter()
            .filter_map(|(denom, hashes)| denom.parse::<u64>().ok().map(|d| (d, hashes.len())))
            .filter(|(_, count)| *count > 0)
            .collect();
        denominations.sort_unstable();

        let available: u64 = denominations.iter().map(|(d, c)| d * *c as u64).sum();

        let selection = exhaustive_select(&denominations, target).ok_or(Error::InsufficientFunds {
            needed: target,
            available,
        })?;

        let mut selected_jwts = Vec::new();
        let mut selected_total = 0u64;
        for (denom, count) in selection {
            let denom_key = denom.to_string();
            let hashes = &index[&denom_key];
            for hash in hashes.iter().take(count) {
                let jwt = state
                    .tokens
                    .get(issuer)
                    .and_then(|by_hash| by_hash.get(hash))
                    .ok_or_else(|| Error::Internal(format!("token {} missing from tokens map", hash)))?
                    .clone();
                selected_jwts.push(jwt);
                selected_total += denom;
            }
        }
        drop(state);

        let mut ins = Vec::with_capacity(selected_jwts.len());
        let mut witness_data = Vec::with_capacity(selected_jwts.len());
        for jwt in selected_jwts {
            let (token, _) = Token::restore(&jwt)?;
            let witness = match &token.payload.p2pk_lock {
                Some(p2pk) => {
                    let sk = self.secret_key_for(p2pk)?;
                    token.sign(&sk)?
                }
                None => String::new(),
            };
            ins.push(jwt);
            witness_data.push(witness);
        }

        Ok(PreparedTransfer {
            ins,
            witness_data,
            selected_total,
        })
    }

    /// Selects coins for `target` from `issuer`, builds the `transfer`
    /// wire request, and sends it over the relay (spec §4.2: "Pocket
    /// selects inputs from its index (coin selection), builds witness
    /// signatures over input hashes, sends transfer request to Forge").
    /// The caller is responsible for reconciling the response — outputs
    /// and the change token arrive later as separate pushes through
    /// [`Self::run`]/[`Self::handle_event`], not in this call's return
    /// value, matching spec §2's data-flow description.
    pub async fn transfer(
        &self,
        issuer: &str,
        target: u64,
        outs: Vec<crate::forge::TransferOutput>,
        htlc_secret: Option<String>,
    ) -> Result<crate::messaging::Response> {
        let prepared = self.select_coins(issuer, target)?;
        let params = crate::forge::TransferParams {
            ins: prepared.ins,
            outs,
            witness_data: Some(prepared.witness_data),
            htlc_secret,
        };
        let issuer_pk = parse_pubkey(issuer)?;
        self.core.send_request(&issuer_pk, "transfer", &params).await
    }

    /// Handles one decrypted inbound payload: either a minted/transferred
    /// token push (`{result:{token}}`), a spent-notification push
    /// (`{result:{spent, issuer}}`), or a 409 error carrying the same
    /// reconciliation payload (spec §4.5, §4.2).
    pub async fn handle_event(&self, value: serde_json::Value) {
        if let Some(jwt) = value
            .get("result")
            .and_then(|r| r.get("token"))
            .and_then(|t| t.as_str())
        {
            self.receive_token(jwt).await;
            return;
        }

        let spent_payload = value
            .get("result")
            .filter(|r| r.get("spent").is_some())
            .or_else(|| value.get("error").and_then(|e| e.get("data")));

        if let Some(payload) = spent_payload {
            if let (Some(hash), Some(issuer)) = (
                payload.get("spent").and_then(|s| s.as_str()),
                payload.get("issuer").and_then(|i| i.as_str()),
            ) {
                self.reconcile_spent(hash, issuer);
                if let Err(e) = self.persist_state().await {
                    error!("pocket: failed to persist state after reconciliation: {}", e);
                }
            }
        }
    }

    async fn receive_token(&self, jwt: &str) {
        let (token, _sig) = match Token::restore(jwt) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("pocket: dropped malformed token push: {}", e);
                return;
            }
        };
        let hash = match token.recompute_hash() {
            Ok(h) => h,
            Err(e) => {
                warn!("pocket: failed to hash received token: {}", e);
                return;
            }
        };
        let issuer = token.payload.iss.clone();

        {
            let mut state = self.state.write();
            state
                .tokens
                .entry(issuer.clone())
                .or_default()
                .insert(hash.clone(), jwt.to_owned());

            match (token.payload.amount, token.payload.token_id) {
                (Some(amount), None) => {
                    let denom = amount.to_string();
                    state
                        .token_index
                        .entry(issuer.clone())
                        .or_default()
                        .entry(denom.clone())
                        .or_default()
                        .push(hash.clone());
                    *state
                        .balances
                        .entry(issuer.clone())
                        .or_default()
                        .entry(denom)
                        .or_insert(0) += amount;
                }
                (None, Some(token_id)) => {
                    state
                        .tat_index
                        .entry(issuer.clone())
                        .or_default()
                        .insert(token_id.to_string(), hash.clone());
                }
                _ => {}
            }
        }

        if let Err(e) = self.persist_state().await {
            error!("pocket: failed to persist state after receiving token: {}", e);
        }
        info!("pocket: received token {} from issuer {}", hash, issuer);
    }

    fn reconcile_spent(&self, hash: &str, issuer: &str) {
        let mut state = self.state.write();
        let had_it = state
            .tokens
            .get_mut(issuer)
            .map(|by_hash| by_hash.remove(hash).is_some())
            .unwrap_or(false);
        if !had_it {
            return;
        }

        if let Some(index) = state.token_index.get_mut(issuer) {
            let mut emptied_denom: Option<String> = None;
            for (denom, hashes) in index.iter_mut() {
                if let Some(pos) = hashes.iter().position(|h| h == hash) {
                    hashes.remove(pos);
                    if let Ok(amount) = denom.parse::<u64>() {
                        if let Some(bal) = state.balances.get_mut(issuer).and_then(|b| b.get_mut(denom)) {
                            *bal = bal.saturating_sub(amount);
                        }
                    }
                    if hashes.is_empty() {
                        emptied_denom = Some(denom.clone());
                    }
                    break;
                }
            }
            if let Some(denom) = emptied_denom {
                index.remove(&denom);
            }
        }

        if let Some(tat) = state.tat_index.get_mut(issuer) {
            tat.retain(|_, h| h != hash);
        }
    }
}

/// Recursive exhaustive search (spec §4.5): picks, from `denominations`
/// (sorted `(value, available_count)` pairs), the combination reaching
/// `target` that minimizes total selected (change), then input count.
fn exhaustive_select(denominations: &[(u64, usize)], target: u64) -> Option<Vec<(u64, usize)>> {
    let n = denominations.len();
    let mut suffix_max = vec![0u64; n + 1];
    for i in (0..n).rev() {
        suffix_max[i] = suffix_max[i + 1] + denominations[i].0 * denominations[i].1 as u64;
    }

    let mut best: Option<(u64, usize, Vec<usize>)> = None;
    let mut chosen = vec![0usize; n];

    fn recurse(
        i: usize,
        denominations: &[(u64, usize)],
        suffix_max: &[u64],
        target: u64,
        running_sum: u64,
        running_count: usize,
        chosen: &mut Vec<usize>,
        best: &mut Option<(u64, usize, Vec<usize>)>,
    ) {
        if running_sum >= target {
            let better = match best {
                None => true,
                Some((bs, bc, _)) => (running_sum, running_count) < (*bs, *bc),
            };
            if better {
                *best = Some((running_sum, running_count, chosen.clone()));
            }
            return;
        }
        if i == denominations.len() {
            return;
        }
        if running_sum + suffix_max[i] < target {
            return;
        }
        let (denom, count) = denominations[i];
        for c in 0..=count {
            chosen[i] = c;
            recurse(
                i + 1,
                denominations,
                suffix_max,
                target,
                running_sum + denom * c as u64,
                running_count + c,
                chosen,
                best,
            );
        }
        chosen[i] = 0;
    }

    recurse(0, denominations, &suffix_max, target, 0, 0, &mut chosen, &mut best);
    best.map(|(_, _, chosen)| {
        denominations
            .iter()
            .zip(chosen.iter())
            .filter(|(_, &c)| c > 0)
            .map(|(&(d, _), &c)| (d, c))
            .collect()
    })
}
