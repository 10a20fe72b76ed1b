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

//! The boundaries this core calls out through but never implements
//! itself: sending a wire message to the peer device, and asking the
//! embedder's cross-signing layer to elevate trust once MAC attestation
//! succeeds.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::{CancelCode, TransactionId, VerificationEvent};

/// Delivery of `m.key.verification.*` events to the peer device.
///
/// Whether delivery happens via to-device messages, an in-room event, or
/// something else entirely is a transport concern this core has no
/// opinion on; an implementation only needs to guarantee in-order,
/// at-least-once delivery to the right device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `event` to the peer device this transaction is with.
    async fn send(&self, transaction_id: &TransactionId, event: VerificationEvent) -> Result<()>;

    /// Send an `m.key.verification.cancel` with `code` and its canned
    /// `reason()` text, then tear down any transport-level state for the
    /// transaction (e.g. to-device request bookkeeping). Called exactly
    /// once per transaction, from whichever side notices the failure
    /// first.
    async fn cancel_transaction(&self, transaction_id: &TransactionId, code: CancelCode) -> Result<()>;

    /// Send an `m.key.verification.done` event, if the transport profile
    /// the transaction was started with requires one.
    async fn done(&self, transaction_id: &TransactionId) -> Result<()>;
}

/// The embedder's cross-signing layer, consulted only after a device's
/// own MAC has already verified.
///
/// Both methods are fire-and-forget from the state machine's point of
/// view: a failure here never unwinds a transaction that has already
/// reached `Done` with its per-device MAC verified, it's only logged
/// (see DESIGN.md for the reasoning).
#[async_trait]
pub trait CrossSigningService: Send + Sync {
    /// Elevate `user_id`'s cross-signing master key to fully trusted, now
    /// that its MAC has verified against our own master key signature.
    async fn trust_user(&self, user_id: &str) -> Result<()>;

    /// Sign `device_id` belonging to `user_id` with our own user-signing
    /// key, now that the device's MAC has verified.
    async fn sign_device(&self, user_id: &str, device_id: &str) -> Result<()>;
}
