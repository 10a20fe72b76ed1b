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

use thiserror::Error;

use crate::messages::CancelCode;

/// Result type used throughout the verification core.
pub type Result<T> = std::result::Result<T, VerificationError>;

/// Failures that are local to this side of a verification and are not part
/// of the wire protocol taxonomy carried by [`CancelCode`].
///
/// A `VerificationError` either gets turned into a [`CancelCode`] by the
/// state machine (most of them map to [`CancelCode::UnexpectedMessage`])
/// or is returned directly to the embedder, e.g. when a method is called
/// before the transaction has reached the state it requires.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// A message was received, or an operation was attempted, that isn't
    /// valid in the transaction's current state.
    #[error("the operation {operation} isn't valid in the current state {state}")]
    InvalidState {
        /// The method or message that was rejected.
        operation: &'static str,
        /// A debug rendering of the state the transaction was in.
        state: String,
    },

    /// A message failed to parse because it was missing a required field
    /// or had a field of the wrong shape.
    #[error("the {message} message is missing the required field {field}")]
    MissingField {
        /// The message type that failed to parse.
        message: &'static str,
        /// The field that was missing.
        field: &'static str,
    },

    /// The transport reported a failure while trying to send a message.
    #[error("the transport failed to send a {0} message")]
    Transport(&'static str),

    /// The identity store reported a failure while being read.
    #[error("the identity store could not be read: {0}")]
    Store(String),

    /// The SAS engine's opaque primitive call failed.
    #[error("the SAS engine could not compute a {0}")]
    Engine(&'static str),

    /// A wire-protocol failure that already carries the precise
    /// [`CancelCode`] the peer should be told about, e.g. a mismatched
    /// commitment or an exhausted algorithm negotiation. Kept distinct
    /// from the other variants so [`VerificationError::as_cancel_code`]
    /// doesn't have to collapse it down to `UnexpectedMessage`.
    #[error("the transaction must cancel with {0:?}")]
    Cancel(CancelCode),
}

impl VerificationError {
    /// The `CancelCode` a caller should cancel the transaction with if this
    /// error surfaces out of transaction-machine code: local-only
    /// failures map to `cancel(UnexpectedMessage)` unless a more specific
    /// code applies.
    pub fn as_cancel_code(&self) -> CancelCode {
        match self {
            VerificationError::MissingField { .. } => CancelCode::InvalidMessage,
            VerificationError::Cancel(code) => *code,
            _ => CancelCode::UnexpectedMessage,
        }
    }
}
