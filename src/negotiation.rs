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

//! Algorithm negotiation.
//!
//! Negotiation intersects our locally supported, prioritized algorithm
//! lists with whatever the peer offered and picks the first local
//! preference that also appears in the peer's list. Negotiation never
//! suspends and never touches cryptographic state; it's pure data
//! wrangling, kept separate from `transaction` so it stays trivially unit
//! testable and deterministic.

use crate::messages::{AcceptContent, CancelCode, StartContent};

pub const KEY_AGREEMENT_CURVE25519: &str = "curve25519";
pub const HASH_SHA256: &str = "sha256";
pub const MAC_HKDF_HMAC_SHA256: &str = "hkdf-hmac-sha256";
pub const MAC_HMAC_SHA256: &str = "hmac-sha256";
pub const SAS_DECIMAL: &str = "decimal";
pub const SAS_EMOJI: &str = "emoji";

/// The algorithms we are willing to offer or accept, in priority order
/// (most preferred first).
#[derive(Clone, Debug)]
pub struct LocalCapabilities {
    pub key_agreement_protocols: Vec<String>,
    pub hashes: Vec<String>,
    pub message_authentication_codes: Vec<String>,
    pub short_authentication_strings: Vec<String>,
}

impl LocalCapabilities {
    /// The default capability set: Curve25519 key agreement, SHA-256
    /// commitment hash, `hkdf-hmac-sha256` preferred over the legacy
    /// `hmac-sha256`, and both short authentication string methods.
    ///
    /// `allow_emoji` gates whether `emoji` is offered at all -- capability
    /// gating like "can this device render an emoji" is a constructor
    /// parameter, not a runtime flag threaded through the state machine.
    pub fn new(allow_emoji: bool) -> Self {
        let mut short_authentication_strings = vec![SAS_DECIMAL.to_owned()];
        if allow_emoji {
            short_authentication_strings.insert(0, SAS_EMOJI.to_owned());
        }

        Self {
            key_agreement_protocols: vec![KEY_AGREEMENT_CURVE25519.to_owned()],
            hashes: vec![HASH_SHA256.to_owned()],
            message_authentication_codes: vec![
                MAC_HKDF_HMAC_SHA256.to_owned(),
                MAC_HMAC_SHA256.to_owned(),
            ],
            short_authentication_strings,
        }
    }
}

/// The single negotiated algorithm tuple, bound once at `accept()` and
/// never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedProtocols {
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    pub short_authentication_strings: Vec<String>,
}

/// Pick the first of `locals` that also appears in `peer_offer`, preserving
/// local priority order.
fn first_common(locals: &[String], peer_offer: &[String]) -> Option<String> {
    locals.iter().find(|l| peer_offer.iter().any(|p| p == *l)).cloned()
}

/// Negotiate the four algorithm fields for an incoming `start`, as the
/// responder does in `accept()`.
pub fn negotiate(
    locals: &LocalCapabilities,
    start: &StartContent,
) -> Result<AcceptedProtocols, CancelCode> {
    let key_agreement_protocol = first_common(&locals.key_agreement_protocols, &start.key_agreement_protocols)
        .ok_or(CancelCode::UnknownMethod)?;
    let hash = first_common(&locals.hashes, &start.hashes).ok_or(CancelCode::UnknownMethod)?;
    let message_authentication_code =
        first_common(&locals.message_authentication_codes, &start.message_authentication_codes)
            .ok_or(CancelCode::UnknownMethod)?;

    let short_authentication_strings: Vec<String> = locals
        .short_authentication_strings
        .iter()
        .filter(|l| start.short_authentication_strings.iter().any(|p| &p == l))
        .cloned()
        .collect();

    if short_authentication_strings.is_empty() {
        return Err(CancelCode::UnknownMethod);
    }

    Ok(AcceptedProtocols {
        key_agreement_protocol,
        hash,
        message_authentication_code,
        short_authentication_strings,
    })
}

/// Verify that an `accept` the peer sent us (as the *initiator*) only
/// chose values we actually offered.
pub fn verify_accepted_by_initiator(
    locals: &LocalCapabilities,
    accept: &AcceptContent,
) -> Result<AcceptedProtocols, CancelCode> {
    if !locals.key_agreement_protocols.iter().any(|p| p == &accept.key_agreement_protocol) {
        return Err(CancelCode::UnexpectedMessage);
    }
    if !locals.hashes.iter().any(|p| p == &accept.hash) {
        return Err(CancelCode::UnexpectedMessage);
    }
    if !locals
        .message_authentication_codes
        .iter()
        .any(|p| p == &accept.message_authentication_code)
    {
        return Err(CancelCode::UnexpectedMessage);
    }
    if accept.short_authentication_strings.is_empty()
        || !accept
            .short_authentication_strings
            .iter()
            .all(|s| locals.short_authentication_strings.iter().any(|l| l == s))
    {
        return Err(CancelCode::UnexpectedMessage);
    }

    Ok(AcceptedProtocols {
        key_agreement_protocol: accept.key_agreement_protocol.clone(),
        hash: accept.hash.clone(),
        message_authentication_code: accept.message_authentication_code.clone(),
        short_authentication_strings: accept.short_authentication_strings.clone(),
    })
}
