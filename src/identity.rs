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

//! The identity-key catalog this core consults but never owns.
//! Device and cross-signing key storage, persistence,
//! and network fetching all live on the embedder's side of this trait;
//! the transaction state machine only ever reads through it and, on
//! success, asks it to record that a device was verified.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;

/// A single device's identity, as far as MAC attestation needs it: its
/// Ed25519 fingerprint key, keyed by the `ed25519:DEVICE_ID` key id the
/// `m.key.verification.mac` `mac` map uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub ed25519_key: String,
}

/// A user's cross-signing master key, when one exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrossSigningInfo {
    pub user_id: String,
    pub master_key: String,
    /// Whether we have already verified this master key ourselves. Only
    /// our own trusted master key is ever attested over MAC; an
    /// unverified one is withheld until it is.
    pub trusted: bool,
}

/// Read and write access to locally known device and cross-signing
/// identities.
///
/// Implementations are expected to be backed by whatever persistent
/// store the embedder already maintains (in `matrix-sdk-crypto` this is
/// the `Store` trait backing `CryptoStore`); this core places no
/// requirement on durability beyond "a completed `mark_device_verified`
/// call is visible to later reads within the same process".
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// All of `user_id`'s devices we currently know about, keyed by
    /// `ed25519:DEVICE_ID` key id.
    async fn devices_of(&self, user_id: &str) -> Result<BTreeMap<String, DeviceInfo>>;

    /// `user_id`'s cross-signing master key, if one has been uploaded and
    /// we've seen it.
    async fn cross_signing_of(&self, user_id: &str) -> Result<Option<CrossSigningInfo>>;

    /// Our own cross-signing master key, used when we sign the peer's
    /// master key as part of MAC attestation.
    async fn my_cross_signing(&self) -> Result<Option<CrossSigningInfo>>;

    /// Record that `device_id` belonging to `user_id` passed MAC
    /// attestation. Called exactly once per verified device, after the
    /// state machine has itself verified the MAC.
    async fn mark_device_verified(&self, user_id: &str, device_id: &str) -> Result<()>;
}
