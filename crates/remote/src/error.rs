//! Error types for dispatching and aggregation.

use capmesh_capabilities::DonId;
use thiserror::Error;

/// Dispatcher errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No receiver registered for the routing key
    #[error("No receiver for capability {capability_id} on DON {don_id}")]
    ReceiverNotFound {
        /// Capability ID
        capability_id: String,
        /// DON ID
        don_id: DonId,
    },

    /// Message uses a protocol version this node does not speak
    #[error("Unsupported message version {got}, expected {expected}")]
    UnsupportedVersion {
        /// Version on the wire
        got: u32,
        /// Version this node speaks
        expected: u32,
    },

    /// Outbound transport is gone
    #[error("Transport closed")]
    TransportClosed,

    /// Route table lock was poisoned
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Aggregation errors
#[derive(Debug, Error)]
pub enum AggregationError {
    /// Not enough agreeing responses
    #[error("Insufficient responses for event {event_id}: best agreement {got}, required {required}")]
    InsufficientResponses {
        /// Trigger event ID
        event_id: String,
        /// Largest agreeing group
        got: usize,
        /// Required agreement
        required: usize,
    },

    /// No report carried enough valid signatures
    #[error("No valid report for event {event_id}")]
    NoValidReport {
        /// Trigger event ID
        event_id: String,
    },

    /// Response payload could not be decoded
    #[error("Malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}
