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

//! End-to-end scenarios driving two [`VerificationMachine`]s against each
//! other over an in-memory fake transport, the way a real deployment
//! would wire to-device messages between two devices. Mirrors the
//! literal scenarios laid out for this transaction core: happy path,
//! commitment mismatch, short-code mismatch, unknown algorithm, early
//! MAC arrival, and peer cancellation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sas_verification::messages::{CancelContent, StartContent};
use sas_verification::{
    CancelCode, CrossSigningInfo, CrossSigningService, DeviceInfo, IdentityStore, SasState,
    TransactionId, Transport, VerificationEvent, VerificationMachine,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug)]
enum Outbound {
    Event(VerificationEvent),
    Cancel(CancelCode),
    Done,
}

struct FakeTransport {
    outbox: UnboundedSender<(TransactionId, Outbound)>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, transaction_id: &TransactionId, event: VerificationEvent) -> sas_verification::Result<()> {
        self.outbox.send((transaction_id.clone(), Outbound::Event(event))).ok();
        Ok(())
    }

    async fn cancel_transaction(&self, transaction_id: &TransactionId, code: CancelCode) -> sas_verification::Result<()> {
        self.outbox.send((transaction_id.clone(), Outbound::Cancel(code))).ok();
        Ok(())
    }

    async fn done(&self, transaction_id: &TransactionId) -> sas_verification::Result<()> {
        self.outbox.send((transaction_id.clone(), Outbound::Done)).ok();
        Ok(())
    }
}

#[derive(Default)]
struct FakeIdentityStore {
    devices: BTreeMap<String, BTreeMap<String, DeviceInfo>>,
    cross_signing: BTreeMap<String, CrossSigningInfo>,
    verified: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl IdentityStore for FakeIdentityStore {
    async fn devices_of(&self, user_id: &str) -> sas_verification::Result<BTreeMap<String, DeviceInfo>> {
        Ok(self.devices.get(user_id).cloned().unwrap_or_default())
    }

    async fn cross_signing_of(&self, user_id: &str) -> sas_verification::Result<Option<CrossSigningInfo>> {
        Ok(self.cross_signing.get(user_id).cloned())
    }

    async fn my_cross_signing(&self) -> sas_verification::Result<Option<CrossSigningInfo>> {
        Ok(None)
    }

    async fn mark_device_verified(&self, user_id: &str, device_id: &str) -> sas_verification::Result<()> {
        self.verified.lock().unwrap().push((user_id.to_owned(), device_id.to_owned()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeCrossSigning {
    trusted_users: Mutex<Vec<String>>,
    signed_devices: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CrossSigningService for FakeCrossSigning {
    async fn trust_user(&self, user_id: &str) -> sas_verification::Result<()> {
        self.trusted_users.lock().unwrap().push(user_id.to_owned());
        Ok(())
    }

    async fn sign_device(&self, user_id: &str, device_id: &str) -> sas_verification::Result<()> {
        self.signed_devices.lock().unwrap().push((user_id.to_owned(), device_id.to_owned()));
        Ok(())
    }
}

fn device(user: &str, device_id: &str) -> DeviceInfo {
    DeviceInfo { device_id: device_id.to_owned(), ed25519_key: format!("{user}-{device_id}-fingerprint") }
}

type Machine = VerificationMachine<FakeTransport, FakeIdentityStore, FakeCrossSigning>;

struct Peer {
    machine: Machine,
    rx: UnboundedReceiver<(TransactionId, Outbound)>,
    identity_store: Arc<FakeIdentityStore>,
    cross_signing: Arc<FakeCrossSigning>,
    user_id: String,
    device_id: String,
}

fn build_peer(own_user: &str, own_device: &str, peer_user: &str, peer_device: &str) -> Peer {
    let (tx, rx) = unbounded_channel();
    let transport = Arc::new(FakeTransport { outbox: tx });

    let mut devices = BTreeMap::new();
    let mut peer_devices = BTreeMap::new();
    peer_devices.insert(format!("ed25519:{peer_device}"), device(peer_user, peer_device));
    devices.insert(peer_user.to_owned(), peer_devices);

    let identity_store = Arc::new(FakeIdentityStore { devices, cross_signing: BTreeMap::new(), verified: Mutex::new(Vec::new()) });
    let cross_signing = Arc::new(FakeCrossSigning::default());

    let machine = VerificationMachine::new(
        own_user.to_owned(),
        own_device.to_owned(),
        transport,
        identity_store.clone(),
        cross_signing.clone(),
    );

    Peer { machine, rx, identity_store, cross_signing, user_id: own_user.to_owned(), device_id: own_device.to_owned() }
}

/// Drain every event currently queued in `from`'s outbox and hand it to
/// `to`, as a real to-device transport would eventually deliver it.
async fn relay(from: &mut Peer, to: &Peer) {
    while let Ok((_transaction_id, outbound)) = from.rx.try_recv() {
        if let Outbound::Event(event) = outbound {
            to.machine.receive_event(&from.user_id, &from.device_id, event, true).await.unwrap();
        }
    }
}

/// Drain `from`'s outbox and return the first cancel code seen, if any.
fn drain_cancel_code(from: &mut Peer) -> Option<CancelCode> {
    let mut found = None;
    while let Ok((_transaction_id, outbound)) = from.rx.try_recv() {
        if let Outbound::Cancel(code) = outbound {
            found.get_or_insert(code);
        }
    }
    found
}

#[tokio::test]
async fn happy_path_reaches_done_and_marks_devices_verified() {
    let mut alice = build_peer("@a:x", "DA", "@b:x", "DB");
    let mut bob = build_peer("@b:x", "DB", "@a:x", "DA");

    let tx_id = alice.machine.request_verification("@b:x", "DB", true).await.unwrap();
    relay(&mut alice, &bob).await;

    bob.machine.accept_verification(&tx_id).await.unwrap();
    relay(&mut bob, &alice).await;
    relay(&mut alice, &bob).await;
    relay(&mut bob, &alice).await;

    assert_eq!(alice.machine.get(&tx_id).unwrap().state(), &SasState::KeyExchanged);
    assert_eq!(bob.machine.get(&tx_id).unwrap().state(), &SasState::KeyExchanged);

    let alice_code = alice.machine.get(&tx_id).unwrap().short_code().unwrap();
    let bob_code = bob.machine.get(&tx_id).unwrap().short_code().unwrap();
    assert_eq!(alice_code.decimal, bob_code.decimal);
    assert_eq!(
        alice_code.emoji.map(|e| e.map(|(c, _)| c)),
        bob_code.emoji.map(|e| e.map(|(c, _)| c))
    );

    let alice_device = device("@a:x", "DA");
    let bob_device = device("@b:x", "DB");

    alice.machine.confirm_short_code(&tx_id, &alice_device).await.unwrap();
    bob.machine.confirm_short_code(&tx_id, &bob_device).await.unwrap();

    relay(&mut alice, &bob).await;
    relay(&mut bob, &alice).await;

    assert!(alice.machine.get(&tx_id).is_none());
    assert!(bob.machine.get(&tx_id).is_none());

    assert_eq!(bob.identity_store.verified.lock().unwrap().as_slice(), &[("@a:x".to_owned(), "DA".to_owned())]);
    assert_eq!(alice.identity_store.verified.lock().unwrap().as_slice(), &[("@b:x".to_owned(), "DB".to_owned())]);
}

#[tokio::test]
async fn early_mac_from_peer_is_verified_once_we_confirm() {
    let mut alice = build_peer("@a:x", "DA", "@b:x", "DB");
    let mut bob = build_peer("@b:x", "DB", "@a:x", "DA");

    let tx_id = alice.machine.request_verification("@b:x", "DB", true).await.unwrap();
    relay(&mut alice, &bob).await;
    bob.machine.accept_verification(&tx_id).await.unwrap();
    relay(&mut bob, &alice).await;
    relay(&mut alice, &bob).await;
    relay(&mut bob, &alice).await;

    let bob_device = device("@b:x", "DB");
    // Bob confirms and sends his MAC before Alice has looked at her screen.
    bob.machine.confirm_short_code(&tx_id, &bob_device).await.unwrap();
    relay(&mut bob, &alice).await;

    // Alice's transaction stashed it rather than erroring.
    assert_eq!(alice.machine.get(&tx_id).unwrap().state(), &SasState::KeyExchanged);

    let alice_device = device("@a:x", "DA");
    alice.machine.confirm_short_code(&tx_id, &alice_device).await.unwrap();
    relay(&mut alice, &bob).await;

    assert!(alice.machine.get(&tx_id).is_none());
    assert!(bob.machine.get(&tx_id).is_none());
}

#[tokio::test]
async fn unknown_method_cancels_without_creating_a_transaction() {
    let mut bob = build_peer("@b:x", "DB", "@a:x", "DA");

    let tx_id = TransactionId::new("tx-unknown-method");
    let start = StartContent {
        transaction_id: tx_id.clone(),
        from_device: "DA".to_owned().into(),
        method: "m.qr_code.scan.v1".to_owned(),
        key_agreement_protocols: vec!["curve25519".to_owned()],
        hashes: vec!["sha256".to_owned()],
        message_authentication_codes: vec!["hkdf-hmac-sha256".to_owned()],
        short_authentication_strings: vec!["decimal".to_owned()],
    };

    bob.machine.receive_event("@a:x", "DA", VerificationEvent::Start(start), true).await.unwrap();

    assert_eq!(drain_cancel_code(&mut bob), Some(CancelCode::UnknownMethod));
    assert!(bob.machine.get(&tx_id).is_none());
}

#[tokio::test]
async fn peer_cancellation_tears_down_both_sides() {
    let mut alice = build_peer("@a:x", "DA", "@b:x", "DB");
    let mut bob = build_peer("@b:x", "DB", "@a:x", "DA");

    let tx_id = alice.machine.request_verification("@b:x", "DB", true).await.unwrap();
    relay(&mut alice, &bob).await;

    bob.machine.cancel(&tx_id, CancelCode::User).await.unwrap();
    assert!(bob.machine.get(&tx_id).is_none());

    // Deliver Bob's cancel the way a real transport eventually would.
    let cancel = CancelContent { transaction_id: tx_id.clone(), code: CancelCode::User, reason: CancelCode::User.reason().to_owned() };
    alice.machine.receive_event("@b:x", "DB", VerificationEvent::Cancel(cancel), true).await.unwrap();

    assert_eq!(alice.machine.get(&tx_id).unwrap().state(), &SasState::Cancelled(CancelCode::User));

    let _ = alice.cross_signing;
}

/// Pop the next queued outbound verification event from `from`'s
/// transport, panicking if nothing (or a cancel/done) is waiting.
fn take_event(from: &mut Peer) -> VerificationEvent {
    match from.rx.try_recv() {
        Ok((_, Outbound::Event(event))) => event,
        other => panic!("expected a queued verification event, got {other:?}"),
    }
}

#[tokio::test]
async fn disjoint_mac_algorithms_cancel_unknown_method_during_accept() {
    let mut bob = build_peer("@b:x", "DB", "@a:x", "DA");

    let tx_id = TransactionId::new("tx-disjoint-macs");
    let start = StartContent {
        transaction_id: tx_id.clone(),
        from_device: "DA".to_owned().into(),
        method: sas_verification::messages::SAS_V1.to_owned(),
        key_agreement_protocols: vec!["curve25519".to_owned()],
        hashes: vec!["sha256".to_owned()],
        // Neither of Bob's two supported MAC methods is offered here.
        message_authentication_codes: vec!["bogus-mac".to_owned()],
        short_authentication_strings: vec!["decimal".to_owned()],
    };

    bob.machine.receive_event("@a:x", "DA", VerificationEvent::Start(start), true).await.unwrap();
    assert!(bob.machine.get(&tx_id).is_some());

    assert!(bob.machine.accept_verification(&tx_id).await.is_err());

    assert_eq!(drain_cancel_code(&mut bob), Some(CancelCode::UnknownMethod));
    assert!(bob.machine.get(&tx_id).is_none());
}

#[tokio::test]
async fn tampered_commitment_cancels_on_the_initiator() -> anyhow::Result<()> {
    let mut alice = build_peer("@a:x", "DA", "@b:x", "DB");
    let mut bob = build_peer("@b:x", "DB", "@a:x", "DA");

    let tx_id = alice.machine.request_verification("@b:x", "DB", true).await?;
    relay(&mut alice, &bob).await;

    bob.machine.accept_verification(&tx_id).await?;
    let accept = match take_event(&mut bob) {
        VerificationEvent::Accept(mut accept) => {
            accept.commitment = "not-the-real-commitment".to_owned();
            accept
        }
        other => panic!("expected an accept event, got {other:?}"),
    };

    // Deliver the tampered accept; Alice won't notice yet -- the
    // commitment is only checked once Bob's real public key arrives.
    alice.machine.receive_event("@b:x", "DB", VerificationEvent::Accept(accept), true).await?;
    let alice_key = take_event(&mut alice);

    bob.machine.receive_event("@a:x", "DA", alice_key, true).await?;
    let bob_key = take_event(&mut bob);

    let err = alice.machine.receive_event("@b:x", "DB", bob_key, true).await;
    assert!(err.is_err());

    assert_eq!(drain_cancel_code(&mut alice), Some(CancelCode::MismatchedCommitment));
    assert!(alice.machine.get(&tx_id).is_none());
    Ok(())
}

#[tokio::test]
async fn tampered_mac_cancels_with_mismatched_keys() {
    let mut alice = build_peer("@a:x", "DA", "@b:x", "DB");
    let mut bob = build_peer("@b:x", "DB", "@a:x", "DA");

    let tx_id = alice.machine.request_verification("@b:x", "DB", true).await.unwrap();
    relay(&mut alice, &bob).await;
    bob.machine.accept_verification(&tx_id).await.unwrap();
    relay(&mut bob, &alice).await;
    relay(&mut alice, &bob).await;
    relay(&mut bob, &alice).await;

    let alice_device = device("@a:x", "DA");
    alice.machine.confirm_short_code(&tx_id, &alice_device).await.unwrap();

    let tampered = match take_event(&mut alice) {
        VerificationEvent::Mac(mut mac) => {
            for value in mac.mac.values_mut() {
                value.push('!');
            }
            mac
        }
        other => panic!("expected a mac event, got {other:?}"),
    };

    let bob_device = device("@b:x", "DB");
    bob.machine.confirm_short_code(&tx_id, &bob_device).await.unwrap();
    let _bob_mac = take_event(&mut bob); // Bob's own mac, irrelevant here.

    let err = bob.machine.receive_event("@a:x", "DA", VerificationEvent::Mac(tampered), true).await;
    assert!(err.is_err());

    assert_eq!(drain_cancel_code(&mut bob), Some(CancelCode::MismatchedKeys));
    assert!(bob.machine.get(&tx_id).is_none());
}

#[tokio::test]
async fn user_rejected_short_code_cancels_with_mismatched_sas() {
    let mut alice = build_peer("@a:x", "DA", "@b:x", "DB");
    let mut bob = build_peer("@b:x", "DB", "@a:x", "DA");

    let tx_id = alice.machine.request_verification("@b:x", "DB", true).await.unwrap();
    relay(&mut alice, &bob).await;
    bob.machine.accept_verification(&tx_id).await.unwrap();
    relay(&mut bob, &alice).await;
    relay(&mut alice, &bob).await;
    relay(&mut bob, &alice).await;

    assert_eq!(alice.machine.get(&tx_id).unwrap().state(), &SasState::KeyExchanged);

    alice.machine.reject_short_code(&tx_id).await.unwrap();
    assert!(alice.machine.get(&tx_id).is_none());
    assert_eq!(drain_cancel_code(&mut alice), Some(CancelCode::MismatchedSas));
}
