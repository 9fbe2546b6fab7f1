// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A registry of per-run cancellation tokens, so the API layer can request
//! cancellation of a run it doesn't otherwise have a handle to.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Maps run ids to their live [`CancellationToken`]. Registered when a run
/// starts, removed when it reaches a terminal state — a run id absent from
/// the registry is simply not cancellable (either finished or never
/// started), never an error.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh token for `run_id`, overwriting any prior
    /// registration for the same id (the orchestrator never reuses an id,
    /// but tests do).
    pub fn register(&self, run_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(run_id, token.clone());
        token
    }

    /// Signals cancellation to the run's token, if it is still registered.
    /// Returns `true` if a live registration was found and cancelled.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.tokens.lock().get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the run's registration. Called once the run reaches a
    /// terminal state, so cancelling a finished run is a no-op rather than
    /// a dangling signal to nobody.
    pub fn unregister(&self, run_id: Uuid) {
        self.tokens.lock().remove(&run_id);
    }

    pub fn is_registered(&self, run_id: Uuid) -> bool {
        self.tokens.lock().contains_key(&run_id)
    }
}
