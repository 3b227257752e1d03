//! The election-level error taxonomy.
//!
//! Protocol violations are cryptographic facts, not transient conditions:
//! there is no retry path once a party has produced output inconsistent
//! with what it committed to, so they surface as hard failures. Arithmetic
//! and per-row operations are pure and only panic on precondition
//! violations, which are programmer errors.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElectionError {
    /// A mix server produced an inconsistent row, a proof triple failed its
    /// check relation, or the tally-set distributions diverged. Fatal to the
    /// election outcome.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid `M`/`r`/`m`/`N`. Rejected at setup, before any ballot is
    /// collected.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The requested result is not available in the current phase. Local to
    /// the querying call; the election itself continues.
    #[error("not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ElectionError {
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }
}
