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

//! Wire message schema for `m.key.verification.*` events.
//!
//! Transport (to-device vs. in-room delivery) is out of scope for this
//! crate, so unlike `matrix-sdk-crypto`'s `event_enums` module there is no
//! `ToDevice`/`Room` duality here: each message is a single flat struct with
//! exactly the fields each wire message needs.

use std::collections::BTreeMap;

use ruma::DeviceIdBox;
use serde::{Deserialize, Serialize};

/// An opaque identifier for a verification process, unique with respect to
/// the two devices involved.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The verification method a `start` message is for.
///
/// Only `m.sas.v1` is implemented by this core; a `start` for any other
/// method is rejected with [`CancelCode::UnknownMethod`].
pub const SAS_V1: &str = "m.sas.v1";

/// Content of an `m.key.verification.start` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartContent {
    pub transaction_id: TransactionId,
    pub from_device: DeviceIdBox,
    pub method: String,
    pub key_agreement_protocols: Vec<String>,
    pub hashes: Vec<String>,
    pub message_authentication_codes: Vec<String>,
    pub short_authentication_strings: Vec<String>,
}

impl StartContent {
    /// The canonical JSON serialization used as an input to the commitment
    /// hash (see `transaction::calculate_commitment`). Canonicalization here
    /// means deterministic key ordering, which `serde_json` already
    /// guarantees for a `BTreeMap`-free struct serialized through
    /// `to_value` followed by re-serialization of a sorted `Map`.
    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self).expect("StartContent always serializes");
        canonical_json_string(value)
    }
}

/// Content of an `m.key.verification.accept` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptContent {
    pub transaction_id: TransactionId,
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    pub short_authentication_strings: Vec<String>,
    pub commitment: String,
}

/// Content of an `m.key.verification.key` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyContent {
    pub transaction_id: TransactionId,
    pub key: String,
}

/// Content of an `m.key.verification.mac` message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MacContent {
    pub transaction_id: TransactionId,
    pub mac: BTreeMap<String, String>,
    pub keys: String,
}

/// Content of an `m.key.verification.cancel` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelContent {
    pub transaction_id: TransactionId,
    pub code: CancelCode,
    pub reason: String,
}

/// Content of an `m.key.verification.done` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoneContent {
    pub transaction_id: TransactionId,
}

/// Any inbound verification message, dispatched on by the state machine's
/// `accept_verification_event`.
///
/// This mirrors the shape of `matrix-sdk-crypto`'s
/// `verification::event_enums::AnyVerificationContent`, minus the
/// to-device/in-room split that crate carries for transport reasons this
/// core doesn't need.
#[derive(Clone, Debug)]
pub enum VerificationEvent {
    Start(StartContent),
    Accept(AcceptContent),
    Key(KeyContent),
    Mac(MacContent),
    Cancel(CancelContent),
    Done(DoneContent),
    /// A message type this core doesn't recognize. Unknown message types
    /// are silently ignored for forward compatibility.
    Unknown,
}

/// The flat cancellation-code taxonomy every verification failure maps to.
///
/// Every externally observable failure maps to exactly one of these; the
/// wire representation (`m.foo_bar`) must be bit-identical across
/// independent implementations, so the `rename`s below are normative, not
/// stylistic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelCode {
    #[serde(rename = "m.user")]
    User,
    #[serde(rename = "m.timeout")]
    Timeout,
    #[serde(rename = "m.unknown_method")]
    UnknownMethod,
    #[serde(rename = "m.unexpected_message")]
    UnexpectedMessage,
    #[serde(rename = "m.mismatched_commitment")]
    MismatchedCommitment,
    #[serde(rename = "m.mismatched_sas")]
    MismatchedSas,
    #[serde(rename = "m.key_mismatch")]
    MismatchedKeys,
    #[serde(rename = "m.invalid_message")]
    InvalidMessage,
    #[serde(rename = "m.accepted")]
    Accepted,
}

impl CancelCode {
    /// A short, human readable description suitable for the `reason`
    /// field of an outbound cancel message.
    pub fn reason(&self) -> &'static str {
        match self {
            CancelCode::User => "the user cancelled the verification",
            CancelCode::Timeout => "the verification process timed out",
            CancelCode::UnknownMethod => "the device does not understand the requested method",
            CancelCode::UnexpectedMessage => "the device received an unexpected message",
            CancelCode::MismatchedCommitment => "the commitment did not match",
            CancelCode::MismatchedSas => "the short authentication string did not match",
            CancelCode::MismatchedKeys => "the keys did not match",
            CancelCode::InvalidMessage => "the message received was invalid",
            CancelCode::Accepted => "the verification was already accepted",
        }
    }
}

/// Serialize a `serde_json::Value` with recursively sorted object keys,
/// producing the canonical form the commitment hash and MAC key-id lists
/// both depend on.
pub(crate) fn canonical_json_string(value: serde_json::Value) -> String {
    fn sort(value: serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<String, serde_json::Value> =
                    map.into_iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).expect("re-serializing a sorted map cannot fail")
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(sort).collect())
            }
            other => other,
        }
    }

    sort(value).to_string()
}
