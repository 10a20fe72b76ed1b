// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The transaction state machine: a single SAS
//! verification between our device and one peer device, and the
//! [`VerificationMachine`] that owns a set of them.
//!
//! `Sas` itself never performs I/O. Every operation either mutates local
//! state and hands back a message for the caller to send, or consumes a
//! message the caller already received. This mirrors how
//! `matrix-sdk-crypto`'s `Sas` type separates "what do I do with this
//! event" from "how does that event get to the wire" -- the latter is
//! [`crate::transport::Transport`]'s job, driven by [`VerificationMachine`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::engine::{MacMethod, SasEngine};
use crate::error::{Result, VerificationError};
use crate::identity::{CrossSigningInfo, DeviceInfo, IdentityStore};
use crate::listener::Listeners;
use crate::mac::{self, SasIds, VerifiedKeys};
use crate::messages::{
    AcceptContent, CancelCode, CancelContent, KeyContent, MacContent, StartContent, TransactionId,
    VerificationEvent, SAS_V1,
};
use crate::negotiation::{negotiate, verify_accepted_by_initiator, AcceptedProtocols, LocalCapabilities};
use crate::short_code::{to_decimal, to_emoji, Decimal, Emoji};
use crate::transport::{CrossSigningService, Transport};

const SAS_INFO: &str = "MATRIX_KEY_VERIFICATION_SAS";

/// The lifecycle a `Sas` transaction moves through.
/// Transitions only ever move forward, or into [`SasState::Cancelled`]
/// from anywhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SasState {
    /// Constructed, nothing sent or received yet.
    Created,
    /// A `start` has been sent (we're the initiator) or received (we're
    /// the responder, and haven't called `accept()` yet).
    Started,
    /// An `accept` has been sent or received; algorithms are negotiated
    /// and the SAS engine exists, but key material hasn't been
    /// exchanged.
    Accepted,
    /// Both public keys are known; the short authentication string can
    /// be computed and shown to the user.
    KeyExchanged,
    /// The local user confirmed the short code matches; our MAC has
    /// been sent, waiting on the peer's.
    Confirmed,
    /// Both MACs verified. Terminal, successful.
    Done,
    /// The transaction was cancelled, locally or by the peer. Terminal.
    Cancelled(CancelCode),
}

/// The computed short authentication string, in whichever
/// representations the negotiated algorithm list allows.
#[derive(Clone, Debug)]
pub struct ShortCode {
    pub decimal: Option<Decimal>,
    pub emoji: Option<[Emoji; 7]>,
}

fn calculate_commitment(public_key: &str, start_canonical_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key.as_bytes());
    hasher.update(start_canonical_json.as_bytes());
    base64::encode_config(hasher.finalize(), base64::STANDARD_NO_PAD)
}

/// Build the `info` string for short-code derivation. Both sides always
/// place the *initiator's* identity first, regardless of which side is
/// computing the string, so `we_started` picks the ordering rather than
/// `ids`'s own/other fields.
fn sas_info(ids: &SasIds, transaction_id: &TransactionId, we_started: bool) -> String {
    let (first_user, first_device, second_user, second_device) = if we_started {
        (&ids.own_user_id, &ids.own_device_id, &ids.other_user_id, &ids.other_device_id)
    } else {
        (&ids.other_user_id, &ids.other_device_id, &ids.own_user_id, &ids.own_device_id)
    };

    format!(
        "{info}{fu}{fd}{su}{sd}{tx}",
        info = SAS_INFO,
        fu = first_user,
        fd = first_device,
        su = second_user,
        sd = second_device,
        tx = transaction_id,
    )
}

/// One SAS verification transaction.
pub struct Sas {
    transaction_id: TransactionId,
    ids: SasIds,
    we_started: bool,
    locals: LocalCapabilities,
    state: SasState,
    engine: Option<SasEngine>,
    start: Option<StartContent>,
    accepted: Option<AcceptedProtocols>,
    /// The commitment the *responder* sent us, to be checked once we (the
    /// initiator) learn the responder's public key. `None` when we are
    /// the responder, since the responder computes, not checks, it.
    peer_commitment: Option<String>,
    pending_peer_mac: Option<MacContent>,
    verified_keys: Option<VerifiedKeys>,
    listeners: Listeners,
    created_at: Instant,
}

impl std::fmt::Debug for Sas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sas")
            .field("transaction_id", &self.transaction_id)
            .field("we_started", &self.we_started)
            .field("state", &self.state)
            .finish()
    }
}

impl Sas {
    fn new(transaction_id: TransactionId, ids: SasIds, we_started: bool, locals: LocalCapabilities) -> Self {
        Self {
            transaction_id,
            ids,
            we_started,
            locals,
            state: SasState::Created,
            engine: None,
            start: None,
            accepted: None,
            peer_commitment: None,
            pending_peer_mac: None,
            verified_keys: None,
            listeners: Listeners::new(),
            created_at: Instant::now(),
        }
    }

    /// Start a new transaction as the initiator.
    pub fn start(ids: SasIds, locals: LocalCapabilities) -> (Self, StartContent) {
        let transaction_id = TransactionId::new(fresh_transaction_id(&ids));
        let mut sas = Self::new(transaction_id.clone(), ids, true, locals);

        let start = StartContent {
            transaction_id,
            from_device: sas.ids.own_device_id.clone().into(),
            method: SAS_V1.to_owned(),
            key_agreement_protocols: sas.locals.key_agreement_protocols.clone(),
            hashes: sas.locals.hashes.clone(),
            message_authentication_codes: sas.locals.message_authentication_codes.clone(),
            short_authentication_strings: sas.locals.short_authentication_strings.clone(),
        };

        sas.start = Some(start.clone());
        sas.transition(SasState::Started);
        (sas, start)
    }

    /// Begin a transaction as the responder, from a received `start`.
    pub fn from_start(
        ids: SasIds,
        locals: LocalCapabilities,
        start: StartContent,
    ) -> std::result::Result<Self, CancelCode> {
        if start.method != SAS_V1 {
            return Err(CancelCode::UnknownMethod);
        }

        let mut sas = Self::new(start.transaction_id.clone(), ids, false, locals);
        sas.start = Some(start);
        sas.transition(SasState::Started);
        Ok(sas)
    }

    fn transition(&mut self, state: SasState) {
        self.state = state.clone();
        self.listeners.notify(&state);
    }

    pub fn register_listener(&self, listener: Arc<dyn crate::listener::StateListener>) {
        self.listeners.add(listener);
    }

    pub fn state(&self) -> &SasState {
        &self.state
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn we_started(&self) -> bool {
        self.we_started
    }

    fn require_state(&self, operation: &'static str, expected: &SasState) -> Result<()> {
        if &self.state == expected {
            Ok(())
        } else {
            Err(VerificationError::InvalidState { operation, state: format!("{:?}", self.state) })
        }
    }

    /// As the responder, accept a `start` we've already stored and
    /// produce our own engine plus commitment.
    pub fn accept(&mut self) -> Result<AcceptContent> {
        self.require_state("accept", &SasState::Started)?;
        if self.we_started {
            return Err(VerificationError::InvalidState {
                operation: "accept",
                state: "initiator cannot accept its own start".to_owned(),
            });
        }

        let start = self.start.as_ref().expect("Started state always has a start stored");
        let accepted = negotiate(&self.locals, start).map_err(VerificationError::Cancel)?;

        let mac_method = MacMethod::from_negotiated(&accepted.message_authentication_code)
            .ok_or(VerificationError::Engine("a recognized MAC method"))?;
        let engine = SasEngine::new(mac_method);
        let commitment = calculate_commitment(&engine.public_key(), &start.canonical_json());

        let content = AcceptContent {
            transaction_id: self.transaction_id.clone(),
            key_agreement_protocol: accepted.key_agreement_protocol.clone(),
            hash: accepted.hash.clone(),
            message_authentication_code: accepted.message_authentication_code.clone(),
            short_authentication_strings: accepted.short_authentication_strings.clone(),
            commitment,
        };

        self.accepted = Some(accepted);
        self.engine = Some(engine);
        self.transition(SasState::Accepted);
        Ok(content)
    }

    /// As the initiator, receive the responder's `accept` and reply with
    /// our own public key.
    pub fn on_verification_accept(&mut self, accept: &AcceptContent) -> Result<KeyContent> {
        self.require_state("on_verification_accept", &SasState::Started)?;
        if !self.we_started {
            return Err(VerificationError::InvalidState {
                operation: "on_verification_accept",
                state: "responder cannot receive an accept".to_owned(),
            });
        }

        let accepted = verify_accepted_by_initiator(&self.locals, accept).map_err(VerificationError::Cancel)?;

        let mac_method = MacMethod::from_negotiated(&accepted.message_authentication_code)
            .ok_or(VerificationError::Engine("a recognized MAC method"))?;
        let engine = SasEngine::new(mac_method);
        let key = KeyContent { transaction_id: self.transaction_id.clone(), key: engine.public_key() };

        self.accepted = Some(accepted);
        self.peer_commitment = Some(accept.commitment.clone());
        self.engine = Some(engine);
        self.transition(SasState::Accepted);
        Ok(key)
    }

    /// Receive the peer's public key. The responder replies with its own
    /// key; the initiator instead checks the commitment it received in
    /// `accept` now that it finally knows the responder's public key.
    pub fn on_key_verification_key(&mut self, key: &KeyContent) -> Result<Option<KeyContent>> {
        self.require_state("on_key_verification_key", &SasState::Accepted)?;

        if self.we_started {
            let start_json = self.start.as_ref().expect("initiator always has its own start").canonical_json();
            let expected = calculate_commitment(&key.key, &start_json);
            let received = self
                .peer_commitment
                .as_ref()
                .expect("initiator stores the peer commitment in on_verification_accept");
            if &expected != received {
                return Err(VerificationError::Cancel(CancelCode::MismatchedCommitment));
            }

            self.engine_mut()?.set_their_public_key(&key.key)?;
            self.transition(SasState::KeyExchanged);
            Ok(None)
        } else {
            self.engine_mut()?.set_their_public_key(&key.key)?;
            let our_key = KeyContent {
                transaction_id: self.transaction_id.clone(),
                key: self.engine_ref()?.public_key(),
            };
            self.transition(SasState::KeyExchanged);
            Ok(Some(our_key))
        }
    }

    fn engine_ref(&self) -> Result<&SasEngine> {
        self.engine.as_ref().ok_or(VerificationError::Engine("an engine (accept/on_verification_accept not called)"))
    }

    fn engine_mut(&mut self) -> Result<&mut SasEngine> {
        self.engine.as_mut().ok_or(VerificationError::Engine("an engine (accept/on_verification_accept not called)"))
    }

    /// Compute the short authentication string, available once keys have
    /// been exchanged.
    pub fn short_code(&self) -> Result<ShortCode> {
        self.require_state("short_code", &SasState::KeyExchanged)?;
        let accepted = self.accepted.as_ref().expect("KeyExchanged implies negotiation completed");
        let info = sas_info(&self.ids, &self.transaction_id, self.we_started);
        let mut bytes = self.engine_ref()?.generate_bytes(&info, 6)?;

        let wants = |name: &str| accepted.short_authentication_strings.iter().any(|s| s == name);

        let result = ShortCode {
            decimal: if wants(crate::negotiation::SAS_DECIMAL) { to_decimal(&bytes) } else { None },
            emoji: if wants(crate::negotiation::SAS_EMOJI) { to_emoji(&bytes) } else { None },
        };
        // These bytes are derived, single-use verification material, not
        // the long-lived shared secret -- zeroize the scratch buffer once
        // both representations have been read out of it.
        bytes.zeroize();
        Ok(result)
    }

    /// The local user confirmed the short code matches the peer's.
    /// Produces our MAC content to send, and transitions to `Confirmed`.
    /// If the peer's MAC already arrived early, it is handed back via
    /// [`Sas::take_pending_mac`] for the caller to re-verify once it can
    /// look up the peer's identity.
    pub fn user_has_verified_short_code(
        &mut self,
        own_device: &DeviceInfo,
        own_cross_signing: Option<&CrossSigningInfo>,
    ) -> Result<MacContent> {
        self.require_state("user_has_verified_short_code", &SasState::KeyExchanged)?;

        let content = mac::produce_mac(
            self.engine_ref()?,
            &self.ids,
            &self.transaction_id,
            own_device,
            own_cross_signing,
        )?;
        self.transition(SasState::Confirmed);
        Ok(content)
    }

    /// The local user said the short code does *not* match the peer's.
    pub fn short_code_does_not_match(&mut self) -> CancelContent {
        self.cancel(CancelCode::MismatchedSas)
    }

    /// Receive the peer's MAC content. If the local user hasn't confirmed
    /// the short code yet, the MAC is stashed and re-checked once
    /// [`Sas::user_has_verified_short_code`] is called; otherwise it's
    /// verified immediately.
    pub fn on_key_verification_mac(
        &mut self,
        mac: MacContent,
        peer_device: Option<&DeviceInfo>,
        peer_cross_signing: Option<&CrossSigningInfo>,
    ) -> Result<MacArrival> {
        match &self.state {
            SasState::KeyExchanged => {
                self.pending_peer_mac = Some(mac);
                Ok(MacArrival::Pending)
            }
            SasState::Confirmed => {
                // The peer computed this MAC's `info` strings with its own
                // identity first, ours second -- the mirror image of `self.ids`.
                let peer_ids = SasIds {
                    own_user_id: self.ids.other_user_id.clone(),
                    own_device_id: self.ids.other_device_id.clone(),
                    other_user_id: self.ids.own_user_id.clone(),
                    other_device_id: self.ids.own_device_id.clone(),
                };
                let verified = mac::verify_mac(
                    self.engine_ref()?,
                    &peer_ids,
                    &self.transaction_id,
                    &mac,
                    peer_device,
                    peer_cross_signing,
                )?;
                self.verified_keys = Some(verified);
                self.transition(SasState::Done);
                Ok(MacArrival::Verified)
            }
            other => Err(VerificationError::InvalidState {
                operation: "on_key_verification_mac",
                state: format!("{:?}", other),
            }),
        }
    }

    /// Take a MAC that arrived before the local user confirmed the short
    /// code, if one is stashed. The caller is expected to look up the
    /// peer's identity and call [`Sas::on_key_verification_mac`] with it.
    pub fn take_pending_mac(&mut self) -> Option<MacContent> {
        self.pending_peer_mac.take()
    }

    pub fn verified_keys(&self) -> Option<&VerifiedKeys> {
        self.verified_keys.as_ref()
    }

    /// Cancel the transaction, from any non-terminal state.
    pub fn cancel(&mut self, code: CancelCode) -> CancelContent {
        if !matches!(self.state, SasState::Done | SasState::Cancelled(_)) {
            self.transition(SasState::Cancelled(code));
            if let Some(engine) = self.engine.as_mut() {
                engine.release();
            }
        }
        CancelContent { transaction_id: self.transaction_id.clone(), code, reason: code.reason().to_owned() }
    }

    /// Whether the transaction has been open longer than `timeout`,
    /// counted from construction. Purely informational;
    /// the caller decides what to do (typically `cancel(Timeout)`).
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.created_at.elapsed() > timeout
    }
}

/// The outcome of receiving a peer's MAC content.
#[derive(Debug)]
pub enum MacArrival {
    /// Stashed; the local user hasn't confirmed the short code yet.
    Pending,
    /// Verified; the transaction is now `Done`.
    Verified,
}

fn fresh_transaction_id(ids: &SasIds) -> String {
    use rand_core::{OsRng, RngCore};
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("{}{}-{}", ids.own_device_id, ids.other_device_id, base64::encode_config(bytes, base64::STANDARD_NO_PAD))
}

/// Owns every in-flight transaction for one device, keyed by transaction
/// id; independent transactions never block each other. Grounded on
/// `session_manager/sessions.rs`'s `DashMap`-based session registry.
pub struct VerificationMachine<T, I, C> {
    transactions: DashMap<TransactionId, Sas>,
    transport: Arc<T>,
    identity_store: Arc<I>,
    cross_signing: Arc<C>,
    own_user_id: String,
    own_device_id: String,
}

impl<T, I, C> std::fmt::Debug for VerificationMachine<T, I, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationMachine")
            .field("own_user_id", &self.own_user_id)
            .field("own_device_id", &self.own_device_id)
            .field("open_transactions", &self.transactions.len())
            .finish()
    }
}

impl<T, I, C> VerificationMachine<T, I, C>
where
    T: Transport,
    I: IdentityStore,
    C: CrossSigningService,
{
    pub fn new(
        own_user_id: String,
        own_device_id: String,
        transport: Arc<T>,
        identity_store: Arc<I>,
        cross_signing: Arc<C>,
    ) -> Self {
        Self {
            transactions: DashMap::new(),
            transport,
            identity_store,
            cross_signing,
            own_user_id,
            own_device_id,
        }
    }

    fn ids_for(&self, other_user_id: &str, other_device_id: &str) -> SasIds {
        SasIds {
            own_user_id: self.own_user_id.clone(),
            own_device_id: self.own_device_id.clone(),
            other_user_id: other_user_id.to_owned(),
            other_device_id: other_device_id.to_owned(),
        }
    }

    /// Begin a new verification with `other_user_id`/`other_device_id` as
    /// the initiator, sending the resulting `start` over the transport.
    pub async fn request_verification(
        &self,
        other_user_id: &str,
        other_device_id: &str,
        allow_emoji: bool,
    ) -> Result<TransactionId> {
        let ids = self.ids_for(other_user_id, other_device_id);
        let (sas, start) = Sas::start(ids, LocalCapabilities::new(allow_emoji));
        let transaction_id = sas.transaction_id().clone();

        self.transport.send(&transaction_id, VerificationEvent::Start(start)).await?;
        self.transactions.insert(transaction_id.clone(), sas);
        Ok(transaction_id)
    }

    /// Dispatch an inbound verification event, performing whatever
    /// transport, identity-store, or cross-signing calls its handling
    /// requires.
    pub async fn receive_event(
        &self,
        other_user_id: &str,
        other_device_id: &str,
        event: VerificationEvent,
        allow_emoji: bool,
    ) -> Result<()> {
        match event {
            VerificationEvent::Start(start) => {
                let transaction_id = start.transaction_id.clone();
                if self.transactions.contains_key(&transaction_id) {
                    // A second `start` for a transaction id we already have
                    // open is a renegotiation attempt, not a retry -- cancel
                    // rather than silently clobbering the existing state.
                    self.transport.cancel_transaction(&transaction_id, CancelCode::UnexpectedMessage).await?;
                    return Ok(());
                }

                let ids = self.ids_for(other_user_id, other_device_id);
                match Sas::from_start(ids, LocalCapabilities::new(allow_emoji), start) {
                    Ok(sas) => {
                        self.transactions.insert(transaction_id, sas);
                    }
                    Err(code) => {
                        self.transport.cancel_transaction(&transaction_id, code).await?;
                    }
                }
                Ok(())
            }
            VerificationEvent::Accept(accept) => {
                let transaction_id = accept.transaction_id.clone();
                let result = {
                    let mut sas = self
                        .transactions
                        .get_mut(&transaction_id)
                        .ok_or(VerificationError::Transport("unknown transaction"))?;
                    sas.on_verification_accept(&accept)
                };

                match result {
                    Ok(key) => self.transport.send(&transaction_id, VerificationEvent::Key(key)).await,
                    Err(e) => self.fail(&transaction_id, e).await,
                }
            }
            VerificationEvent::Key(key) => {
                let result = {
                    let mut sas = self
                        .transactions
                        .get_mut(&key.transaction_id)
                        .ok_or(VerificationError::Transport("unknown transaction"))?;
                    sas.on_key_verification_key(&key)
                };

                match result {
                    Ok(Some(reply)) => self.transport.send(&key.transaction_id, VerificationEvent::Key(reply)).await,
                    Ok(None) => Ok(()),
                    Err(e) => self.fail(&key.transaction_id, e).await,
                }
            }
            VerificationEvent::Mac(mac) => {
                let transaction_id = mac.transaction_id.clone();
                self.process_mac(transaction_id, mac).await
            }
            VerificationEvent::Cancel(cancel) => {
                if let Some(mut sas) = self.transactions.get_mut(&cancel.transaction_id) {
                    sas.cancel(cancel.code);
                    warn!(code = ?cancel.code, "peer cancelled verification");
                }
                Ok(())
            }
            VerificationEvent::Done(done) => {
                self.transactions.remove(&done.transaction_id);
                Ok(())
            }
            VerificationEvent::Unknown => Ok(()),
        }
    }

    /// Accept a received `start`, as the responder, and send the
    /// resulting `m.key.verification.accept` over the transport. If
    /// negotiation fails (e.g. the peer's algorithm lists don't intersect
    /// ours), the transaction is cancelled and the peer notified instead.
    pub async fn accept_verification(&self, transaction_id: &TransactionId) -> Result<()> {
        let result = {
            let mut sas = self
                .transactions
                .get_mut(transaction_id)
                .ok_or(VerificationError::Transport("unknown transaction"))?;
            sas.accept()
        };

        match result {
            Ok(accept) => self.transport.send(transaction_id, VerificationEvent::Accept(accept)).await,
            Err(e) => self.fail(transaction_id, e).await,
        }
    }

    /// Transition `transaction_id` to `Cancelled` locally (releasing its
    /// engine), tell the transport to notify the peer with the error's
    /// `CancelCode`, drop it from the registry, and return the error. The
    /// single place every fallible inbound-message handler routes through
    /// so a local failure never leaves a transaction half-torn-down.
    async fn fail(&self, transaction_id: &TransactionId, error: VerificationError) -> Result<()> {
        let code = error.as_cancel_code();
        if let Some(mut sas) = self.transactions.get_mut(transaction_id) {
            sas.cancel(code);
        }
        self.transactions.remove(transaction_id);
        self.transport.cancel_transaction(transaction_id, code).await?;
        Err(error)
    }

    /// The local user confirmed the short code matches. Sends our MAC
    /// over the transport and, if the peer's MAC already arrived and was
    /// stashed, verifies it immediately.
    pub async fn confirm_short_code(&self, transaction_id: &TransactionId, own_device: &DeviceInfo) -> Result<()> {
        let own_cross_signing = self.identity_store.my_cross_signing().await?;

        let (mac_content, pending) = {
            let mut sas = self
                .transactions
                .get_mut(transaction_id)
                .ok_or(VerificationError::Transport("unknown transaction"))?;
            let mac_content = sas.user_has_verified_short_code(own_device, own_cross_signing.as_ref())?;
            let pending = sas.take_pending_mac();
            (mac_content, pending)
        };

        self.transport.send(transaction_id, VerificationEvent::Mac(mac_content)).await?;

        if let Some(pending_mac) = pending {
            self.process_mac(transaction_id.clone(), pending_mac).await
        } else {
            Ok(())
        }
    }

    /// The local user said the short code does *not* match. Cancels the
    /// transaction and notifies the peer.
    pub async fn reject_short_code(&self, transaction_id: &TransactionId) -> Result<()> {
        let code = {
            let mut sas = self
                .transactions
                .get_mut(transaction_id)
                .ok_or(VerificationError::Transport("unknown transaction"))?;
            sas.short_code_does_not_match().code
        };
        self.transport.cancel_transaction(transaction_id, code).await?;
        self.transactions.remove(transaction_id);
        Ok(())
    }

    /// Cancel a transaction for a reason other than a short-code
    /// mismatch (e.g. the user gave up, or the embedder decided to bail).
    pub async fn cancel(&self, transaction_id: &TransactionId, code: CancelCode) -> Result<()> {
        if let Some(mut sas) = self.transactions.get_mut(transaction_id) {
            sas.cancel(code);
        }
        self.transport.cancel_transaction(transaction_id, code).await?;
        self.transactions.remove(transaction_id);
        Ok(())
    }

    async fn process_mac(&self, transaction_id: TransactionId, mac: MacContent) -> Result<()> {
        let (other_user, other_device) = {
            let sas = match self.transactions.get(&transaction_id) {
                Some(sas) => sas,
                None => return Ok(()),
            };
            (sas.ids.other_user_id.clone(), sas.ids.other_device_id.clone())
        };

        let devices = self.identity_store.devices_of(&other_user).await?;
        let peer_cross_signing = self.identity_store.cross_signing_of(&other_user).await?;
        let peer_device = devices.values().find(|d| d.device_id == other_device).cloned();

        let arrival = {
            let mut sas = self
                .transactions
                .get_mut(&transaction_id)
                .ok_or(VerificationError::Transport("unknown transaction"))?;
            sas.on_key_verification_mac(mac, peer_device.as_ref(), peer_cross_signing.as_ref())
        };

        let arrival = match arrival {
            Ok(arrival) => arrival,
            Err(e) => return self.fail(&transaction_id, e).await,
        };

        match arrival {
            MacArrival::Pending => Ok(()),
            MacArrival::Verified => {
                let (verified, done) = {
                    let sas = self
                        .transactions
                        .get(&transaction_id)
                        .ok_or(VerificationError::Transport("unknown transaction"))?;
                    (
                        sas.verified_keys().expect("Verified arrival always sets verified_keys").clone(),
                        sas.state() == &SasState::Done,
                    )
                };

                if let Some(device) = &verified.device {
                    self.identity_store.mark_device_verified(&other_user, &device.device_id).await?;
                }

                // Self-verification (another one of our own devices) signs
                // the device directly; verifying someone else's master key
                // instead elevates trust in their whole cross-signing
                // identity. The two paths are mutually exclusive per
                // transaction, matching how the source's fire-and-forget
                // cross-signing calls are gated.
                let is_self_verification = other_user == self.own_user_id;
                if is_self_verification {
                    if let Some(device) = &verified.device {
                        if let Err(e) = self.cross_signing.sign_device(&other_user, &device.device_id).await {
                            warn!(error = ?e, "cross-signing sign_device upload failed, continuing anyway");
                        }
                    }
                } else if verified.cross_signing.is_some() {
                    if let Err(e) = self.cross_signing.trust_user(&other_user).await {
                        warn!(error = ?e, "cross-signing trust_user upload failed, continuing anyway");
                    }
                }

                if done {
                    self.transport.done(&transaction_id).await?;
                    info!(%transaction_id, "verification completed");
                    self.transactions.remove(&transaction_id);
                }
                Ok(())
            }
        }
    }

    pub fn get(&self, transaction_id: &TransactionId) -> Option<dashmap::mapref::one::Ref<'_, TransactionId, Sas>> {
        self.transactions.get(transaction_id)
    }

    pub fn get_mut(
        &self,
        transaction_id: &TransactionId,
    ) -> Option<dashmap::mapref::one::RefMut<'_, TransactionId, Sas>> {
        self.transactions.get_mut(transaction_id)
    }

    /// Cancel and drop every transaction that has been open longer than
    /// `timeout`. Not run automatically; the embedder decides the sweep
    /// cadence, since timeout support is opt-in rather than built in.
    pub async fn expire_stale(&self, timeout: Duration) {
        let stale: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|entry| entry.value().is_expired(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for transaction_id in stale {
            if let Some(mut sas) = self.transactions.get_mut(&transaction_id) {
                sas.cancel(CancelCode::Timeout);
            }
            let _ = self.transport.cancel_transaction(&transaction_id, CancelCode::Timeout).await;
            self.transactions.remove(&transaction_id);
        }
    }
}
