//! Error taxonomy shared by every peer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ring operations.
pub type Result<T> = std::result::Result<T, ChordError>;

/// Errors that can occur while routing, maintaining, or serving the ring.
///
/// The type is serializable so a remote peer's rejection reaches the caller
/// with its kind intact.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ChordError {
    /// Malformed address, port, key, or id. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connect failure or timeout talking to a peer.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The key is outside this node's ownership interval, or the
    /// predecessor is unknown. The caller must look the key up again.
    #[error("ownership violation: {0}")]
    OwnershipViolation(String),

    /// A peer answered with a structurally invalid response.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The operation is not valid in the node's current membership state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ChordError {
    /// Failures that the maintenance paths treat as a dead peer.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            ChordError::PeerUnreachable(_) | ChordError::ProtocolViolation(_)
        )
    }

    /// Failures a client operation may resolve by routing again.
    pub fn is_retryable(&self) -> bool {
        self.is_peer_failure() || matches!(self, ChordError::OwnershipViolation(_))
    }
}
