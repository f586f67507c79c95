//! Typed errors surfaced through the public engine API.
//!
//! Internal plumbing (transport retries, codec failures inside periodic
//! tasks) stays on `anyhow::Result` and is logged where it happens; only the
//! four caller-visible kinds get their own variants.

use thiserror::Error;

/// Errors returned by the public `GossipEngine` surface.
#[derive(Debug, Error)]
pub enum GossipError {
    /// A gossip API call carried a missing field or a payload of the wrong
    /// subtype (e.g. `merge` on a non-CRDT payload).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The engine has not been started, or has already been shut down.
    #[error("gossip engine is not running")]
    NotRunning,

    /// A shared-data lock could not gather a majority of votes.
    #[error("vote failed for key {0}")]
    VoteFailed(String),

    /// The send path failed in a way that will not recover by retrying.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl GossipError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}

/// Result type for engine-surface operations.
pub type GossipResult<T> = Result<T, GossipError>;
