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

//! The SAS engine: an opaque wrapper around a Curve25519 ephemeral key
//! pair plus the HKDF/HMAC primitives -- everything above this module
//! only ever asks for a public key, hands over the peer's public key, or
//! asks for MAC / short-code bytes.

use hkdf::Hkdf;
use hmac::{Hmac, Mac as _, NewMac};
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

use crate::error::{Result, VerificationError};

/// Which MAC derivation the engine was negotiated to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacMethod {
    /// `hkdf-hmac-sha256`, the preferred method.
    HkdfHmacSha256,
    /// `hmac-sha256`, the legacy "long KDF" method, kept for interop.
    HmacSha256,
}

impl MacMethod {
    pub fn from_negotiated(name: &str) -> Option<Self> {
        match name {
            "hkdf-hmac-sha256" => Some(MacMethod::HkdfHmacSha256),
            "hmac-sha256" => Some(MacMethod::HmacSha256),
            _ => None,
        }
    }
}

/// Unpadded-base64 encode, as every `m.key.verification.*` field that
/// carries binary data requires.
fn encode(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::STANDARD_NO_PAD)
}

fn decode(data: &str) -> Result<Vec<u8>> {
    base64::decode_config(data, base64::STANDARD_NO_PAD)
        .map_err(|_| VerificationError::Engine("base64 decode of a peer-supplied key"))
}

/// The opaque SAS engine. Holds the private ephemeral key until the peer's
/// public key arrives, then holds the derived shared secret until
/// `release()` or `Drop` destroys it.
pub struct SasEngine {
    secret: Option<EphemeralSecret>,
    public_key: PublicKey,
    shared_secret: Option<SharedSecret>,
    mac_method: MacMethod,
}

impl std::fmt::Debug for SasEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasEngine")
            .field("public_key", &encode(self.public_key.as_bytes()))
            .field("mac_method", &self.mac_method)
            .field("has_shared_secret", &self.shared_secret.is_some())
            .finish()
    }
}

impl SasEngine {
    /// Generate a fresh ephemeral Curve25519 key pair for a new
    /// transaction.
    pub fn new(mac_method: MacMethod) -> Self {
        let secret = EphemeralSecret::new(OsRng);
        let public_key = PublicKey::from(&secret);

        Self { secret: Some(secret), public_key, shared_secret: None, mac_method }
    }

    /// Our ephemeral public key, as unpadded base64.
    pub fn public_key(&self) -> String {
        encode(self.public_key.as_bytes())
    }

    /// Consume the peer's public key and establish the shared secret.
    /// May only be called once; the private half of our key pair is moved
    /// out and dropped (and zeroized) by the Diffie-Hellman call itself.
    pub fn set_their_public_key(&mut self, their_key: &str) -> Result<()> {
        let bytes = decode(their_key)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VerificationError::Engine("a 32-byte Curve25519 public key"))?;
        let their_public = PublicKey::from(bytes);

        let secret = self
            .secret
            .take()
            .ok_or(VerificationError::Engine("a not-yet-consumed ephemeral secret"))?;

        self.shared_secret = Some(secret.diffie_hellman(&their_public));
        Ok(())
    }

    fn shared_secret(&self) -> Result<&SharedSecret> {
        self.shared_secret
            .as_ref()
            .ok_or(VerificationError::Engine("a shared secret (peer key not set yet)"))
    }

    /// Expand the shared secret with HKDF-SHA256, keyed by `info`, into
    /// `len` bytes. Used both for short-code bytes and, when the
    /// negotiated method is `hkdf-hmac-sha256`, for the MAC key itself.
    fn hkdf_expand(&self, info: &str, len: usize) -> Result<Vec<u8>> {
        let shared = self.shared_secret()?;
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = vec![0u8; len];
        hk.expand(info.as_bytes(), &mut okm)
            .map_err(|_| VerificationError::Engine("an HKDF expansion (requested length too large)"))?;
        Ok(okm)
    }

    /// Compute a MAC over `message`, keyed per the negotiated
    /// `mac_method`, using `info` both as domain-separation for the key
    /// derivation (hkdf-hmac-sha256) or as an additional authenticated
    /// prefix (hmac-sha256). Returns unpadded base64.
    pub fn calculate_mac(&self, message: &str, info: &str) -> Result<String> {
        let tag = match self.mac_method {
            MacMethod::HkdfHmacSha256 => {
                let key = self.hkdf_expand(info, 32)?;
                let mut mac = Hmac::<Sha256>::new_from_slice(&key)
                    .map_err(|_| VerificationError::Engine("an HMAC-SHA256 instance"))?;
                mac.update(message.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            MacMethod::HmacSha256 => {
                let shared = self.shared_secret()?;
                let mut mac = Hmac::<Sha256>::new_from_slice(shared.as_bytes())
                    .map_err(|_| VerificationError::Engine("an HMAC-SHA256 instance"))?;
                mac.update(info.as_bytes());
                mac.update(message.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
        };

        Ok(encode(&tag))
    }

    /// Derive `count` short-code bytes from the shared secret and `info`.
    /// Exposed directly (rather than through `calculate_mac`) since the
    /// codec only ever needs raw bytes, not a base64 MAC.
    pub fn generate_bytes(&self, info: &str, count: usize) -> Result<Vec<u8>> {
        self.hkdf_expand(info, count)
    }

    /// Destroy the private material. Idempotent; safe to call from
    /// `Drop` as a defensive backup.
    pub fn release(&mut self) {
        self.secret = None;
        // x25519-dalek zeroizes a `SharedSecret`'s internal bytes on Drop;
        // dropping it here is what actually destroys the material.
        self.shared_secret.take();
    }
}

impl Drop for SasEngine {
    fn drop(&mut self) {
        self.release();
    }
}
