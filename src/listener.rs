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

//! A small observer registry notifying the embedder of state changes a
//! transaction goes through, so a UI can react to e.g. "short code is
//! ready to compare" without polling.
//!
//! One misbehaving listener must never take down a transaction; a
//! listener that panics is caught and logged, the way this corpus treats
//! any callback into embedder code it doesn't control.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::transaction::SasState;

/// Something that wants to be told about a transaction's state
/// transitions.
pub trait StateListener: Send + Sync {
    /// Called once synchronously after every state transition, with the
    /// state the transaction just entered.
    fn on_state_change(&self, state: &SasState);
}

impl<F> StateListener for F
where
    F: Fn(&SasState) + Send + Sync,
{
    fn on_state_change(&self, state: &SasState) {
        self(state)
    }
}

/// The registry a [`crate::transaction::Sas`] owns internally. Cheaply
/// cloneable so it can be shared between a transaction and whatever
/// constructed it.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Mutex<Vec<Arc<dyn StateListener>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns nothing to unregister with; this
    /// core has no use case that needs removal, only addition at
    /// transaction-construction time.
    pub fn add(&self, listener: Arc<dyn StateListener>) {
        self.inner.lock().expect("listener registry mutex was poisoned").push(listener);
    }

    /// Notify every registered listener. Panics are caught per listener
    /// so one broken callback can't corrupt the transaction's own state
    /// transition or block its siblings.
    pub fn notify(&self, state: &SasState) {
        let listeners = self.inner.lock().expect("listener registry mutex was poisoned").clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_state_change(state))).is_err() {
                error!("a verification state listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.lock().map(|v| v.len()).unwrap_or(0);
        f.debug_struct("Listeners").field("count", &count).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_registered_listener_is_notified() {
        let listeners = Listeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            listeners.add(Arc::new(move |_: &SasState| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        listeners.notify(&SasState::Created);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_others() {
        let listeners = Listeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        listeners.add(Arc::new(|_: &SasState| panic!("boom")));
        let calls_clone = calls.clone();
        listeners.add(Arc::new(move |_: &SasState| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify(&SasState::Created);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
