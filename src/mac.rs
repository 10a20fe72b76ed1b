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

//! MAC-based key attestation: the final step of a SAS
//! transaction, where each side proves to the other, over the already
//! agreed shared secret, which of its own identity keys it is vouching
//! for. Grounded on `verification/sas/helpers.rs`'s `extra_mac_info_*`,
//! `get_mac_content`, and `receive_mac_event`.

use std::collections::BTreeMap;

use crate::engine::SasEngine;
use crate::identity::{CrossSigningInfo, DeviceInfo};
use crate::messages::{MacContent, TransactionId};

/// The identities of both parties to a transaction, as needed to build
/// the domain-separating `info` string every MAC is computed over.
#[derive(Clone, Debug)]
pub struct SasIds {
    pub own_user_id: String,
    pub own_device_id: String,
    pub other_user_id: String,
    pub other_device_id: String,
}

const MAC_INFO: &str = "MATRIX_KEY_VERIFICATION_MAC";

/// Build the `info` string for a single key id's MAC, ordered
/// `(sender, recipient)` as every `extra_info` helper in this corpus
/// does: the side that *produced* the MAC comes first, which is why
/// `produce` and `verify` below pass different `(ids)` orderings for
/// the same logical transaction.
fn mac_info(ids: &SasIds, transaction_id: &TransactionId, key_id: &str) -> String {
    format!(
        "{info}{sender_user}{sender_device}{recipient_user}{recipient_device}{transaction_id}{key_id}",
        info = MAC_INFO,
        sender_user = ids.own_user_id,
        sender_device = ids.own_device_id,
        recipient_user = ids.other_user_id,
        recipient_device = ids.other_device_id,
        transaction_id = transaction_id,
        key_id = key_id,
    )
}

fn keys_info(ids: &SasIds, transaction_id: &TransactionId) -> String {
    format!(
        "{info}{sender_user}{sender_device}{recipient_user}{recipient_device}{transaction_id}KEY_IDS",
        info = MAC_INFO,
        sender_user = ids.own_user_id,
        sender_device = ids.own_device_id,
        recipient_user = ids.other_user_id,
        recipient_device = ids.other_device_id,
        transaction_id = transaction_id,
    )
}

/// Produce our `m.key.verification.mac` content: a MAC of our own
/// Ed25519 device key, a MAC of our cross-signing master key if we have
/// one, and a `keys` MAC binding the sorted set of key ids together so
/// an attacker can't drop an entry undetected.
pub fn produce_mac(
    engine: &SasEngine,
    ids: &SasIds,
    transaction_id: &TransactionId,
    own_device: &DeviceInfo,
    own_cross_signing: Option<&CrossSigningInfo>,
) -> crate::error::Result<MacContent> {
    let mut mac = BTreeMap::new();

    let device_key_id = format!("ed25519:{}", own_device.device_id);
    let device_mac = engine.calculate_mac(&own_device.ed25519_key, &mac_info(ids, transaction_id, &device_key_id))?;
    mac.insert(device_key_id, device_mac);

    if let Some(cross_signing) = own_cross_signing {
        if cross_signing.trusted {
            let master_key_id = format!("ed25519:{}", cross_signing.master_key);
            let master_mac =
                engine.calculate_mac(&cross_signing.master_key, &mac_info(ids, transaction_id, &master_key_id))?;
            mac.insert(master_key_id, master_mac);
        }
    }

    let key_ids = mac.keys().cloned().collect::<Vec<_>>().join(",");
    let keys = engine.calculate_mac(&key_ids, &keys_info(ids, transaction_id))?;

    Ok(MacContent { transaction_id: transaction_id.clone(), mac, keys })
}

/// Outcome of successfully verifying a peer's MAC content: which of
/// their keys we now trust.
#[derive(Clone, Debug)]
pub struct VerifiedKeys {
    pub device: Option<DeviceInfo>,
    pub cross_signing: Option<CrossSigningInfo>,
}

/// Verify a peer's `m.key.verification.mac` content against the device
/// and cross-signing keys we have on file for them.
///
/// `ids` must describe the transaction from the *peer's* point of view,
/// i.e. `own_*` is the peer and `other_*` is us, matching how they built
/// their `mac_info` when producing the content. Returns
/// [`crate::messages::CancelCode::MismatchedKeys`] (via
/// [`crate::error::VerificationError`]) if the `keys` MAC or any
/// individual key MAC fails to verify.
pub fn verify_mac(
    engine: &SasEngine,
    ids: &SasIds,
    transaction_id: &TransactionId,
    content: &MacContent,
    peer_device: Option<&DeviceInfo>,
    peer_cross_signing: Option<&CrossSigningInfo>,
) -> crate::error::Result<VerifiedKeys> {
    use crate::error::VerificationError;
    use crate::messages::CancelCode;

    let key_ids = content.mac.keys().cloned().collect::<Vec<_>>().join(",");
    let expected_keys_mac = engine.calculate_mac(&key_ids, &keys_info(ids, transaction_id))?;
    if expected_keys_mac != content.keys {
        return Err(VerificationError::Cancel(CancelCode::MismatchedKeys));
    }

    let mut verified = VerifiedKeys { device: None, cross_signing: None };

    if let Some(device) = peer_device {
        let key_id = format!("ed25519:{}", device.device_id);
        if let Some(received) = content.mac.get(&key_id) {
            let expected = engine.calculate_mac(&device.ed25519_key, &mac_info(ids, transaction_id, &key_id))?;
            if &expected != received {
                return Err(VerificationError::Cancel(CancelCode::MismatchedKeys));
            }
            verified.device = Some(device.clone());
        }
    }

    if let Some(cross_signing) = peer_cross_signing {
        let key_id = format!("ed25519:{}", cross_signing.master_key);
        if let Some(received) = content.mac.get(&key_id) {
            let expected =
                engine.calculate_mac(&cross_signing.master_key, &mac_info(ids, transaction_id, &key_id))?;
            if &expected != received {
                return Err(VerificationError::Cancel(CancelCode::MismatchedKeys));
            }
            verified.cross_signing = Some(cross_signing.clone());
        }
    }

    // At least one key must have actually been attested to -- a `mac` map
    // that only contains key ids we don't recognize (or that names no keys
    // at all) isn't a forward-compatible no-op here, unlike an unknown
    // top-level message type: the peer claimed to vouch for something and
    // none of it checked out.
    if verified.device.is_none() && verified.cross_signing.is_none() {
        return Err(VerificationError::Cancel(CancelCode::MismatchedKeys));
    }

    Ok(verified)
}
