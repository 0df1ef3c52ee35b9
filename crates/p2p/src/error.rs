//! Error types for peer-layer operations.

use thiserror::Error;

/// Errors that can occur in peer operations.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Peer identifier could not be parsed
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// The connection manager refused the requested target set
    #[error("Connection update rejected: {0}")]
    UpdateRejected(String),

    /// Connection state is unusable (e.g. poisoned lock)
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;
