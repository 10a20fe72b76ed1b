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

//! The core of a Short Authentication String (SAS) device-verification
//! transaction, as used by Matrix's `m.sas.v1` key-verification method.
//!
//! This crate computes: algorithm negotiation, Curve25519 key agreement,
//! the decimal/emoji short authentication string, and MAC-based key
//! attestation, and it drives the transaction state machine those steps
//! belong to. It deliberately does not decide *how* `m.key.verification.*`
//! events reach the peer device, *how* device and cross-signing keys are
//! stored, or *how* any of this is presented to a user -- those are the
//! [`transport::Transport`], [`identity::IdentityStore`], and
//! [`transport::CrossSigningService`] trait boundaries the embedder
//! implements.
//!
//! ```text
//! Created --start()/from_start()--> Started --accept()/on_verification_accept()--> Accepted
//!   --on_key_verification_key()--> KeyExchanged --user_has_verified_short_code()--> Confirmed
//!   --on_key_verification_mac()--> Done
//! ```
//! Any state may transition to `Cancelled` instead.

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod engine;
pub mod error;
pub mod identity;
pub mod listener;
pub mod mac;
pub mod messages;
pub mod negotiation;
pub mod short_code;
pub mod transaction;
pub mod transport;

pub use error::{Result, VerificationError};
pub use identity::{CrossSigningInfo, DeviceInfo, IdentityStore};
pub use mac::SasIds;
pub use messages::{CancelCode, TransactionId, VerificationEvent};
pub use negotiation::LocalCapabilities;
pub use transaction::{MacArrival, Sas, SasState, ShortCode, VerificationMachine};
pub use transport::{CrossSigningService, Transport};
