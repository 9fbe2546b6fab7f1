// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The error taxonomy shared by every phase of the benchmark lifecycle.

use std::time::Duration;

/// Result type used throughout `accelbench-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the benchmark orchestration core.
///
/// Variants map to HTTP status codes at the API surface; inside a run,
/// every variant below the cancellation layer is fatal-to-run (no
/// per-phase retry — see the propagation policy in the design notes).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input at the API ingress. Surfaces as 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown entity (model, instance type, run, metrics). Surfaces as 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal state transition, e.g. cancelling a completed run. Surfaces as 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Cluster RPC failure or timeout. Surfaces as 5xx externally; inside a
    /// run this transitions the run to failed.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// Parse failure or persist verify mismatch. Transitions the run to failed.
    #[error("data error: {0}")]
    Data(String),

    /// Metrics insert commit failed after a successful compute. The
    /// discarded metrics value is never partially written; only its size is
    /// logged.
    #[error("fatal persist error: {reason} (discarded metrics payload: {discarded_bytes} bytes)")]
    FatalPersist {
        reason: String,
        discarded_bytes: usize,
    },

    /// A suspension point observed cancellation of the run's context.
    #[error("run cancelled")]
    Cancelled,

    /// A wait exceeded its configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Anything else — propagated from a lower layer that doesn't need its
    /// own named variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Whether this error reflects cooperative cancellation rather than a
    /// genuine failure. The orchestrator still transitions the run to
    /// `failed` either way, but logging and metrics distinguish the two.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Data(err.to_string())
    }
}
