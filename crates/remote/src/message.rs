//! Wire messages exchanged between DONs

use capmesh_capabilities::{DonId, TriggerResponse};
use capmesh_p2p::PeerId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol version spoken by this node
pub const MESSAGE_VERSION: u32 = 1;

/// Remote method carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Subscriber -> publisher: (re-)register a workflow with a trigger
    RegisterTrigger,
    /// Subscriber -> publisher: drop a workflow registration
    UnregisterTrigger,
    /// Publisher -> subscriber: trigger event
    TriggerEvent,
    /// Client <-> server: execution request or response
    Execute,
}

/// Envelope for every cross-DON message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Protocol version
    pub version: u32,
    /// Sending node, stamped by the dispatcher
    pub sender: PeerId,
    /// Receiving node, stamped by the dispatcher
    pub receiver: PeerId,
    /// Creation time (Unix epoch milliseconds)
    pub timestamp_ms: u64,
    /// Correlation ID
    pub message_id: String,
    /// Capability addressed
    pub capability_id: String,
    /// DON hosting the capability
    pub capability_don_id: DonId,
    /// DON of the workflow side
    pub caller_don_id: DonId,
    /// Remote method
    pub method: Method,
    /// Method-specific payload
    pub payload: Vec<u8>,
    /// Error reported instead of a payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageBody {
    /// New outbound message; sender and receiver are filled in on send
    pub fn new(
        method: Method,
        capability_id: impl Into<String>,
        capability_don_id: DonId,
        caller_don_id: DonId,
        message_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: MESSAGE_VERSION,
            sender: PeerId::default(),
            receiver: PeerId::default(),
            timestamp_ms: current_timestamp_ms(),
            message_id: message_id.into(),
            capability_id: capability_id.into(),
            capability_don_id,
            caller_don_id,
            method,
            payload,
            error: None,
        }
    }

    /// Same message carrying an error instead of a payload
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.payload.clear();
        self.error = Some(error.into());
        self
    }
}

/// Payload of a `TriggerEvent` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEventPayload {
    /// Event ID, identical across honest publishers
    pub trigger_event_id: String,
    /// Workflows the event is addressed to
    pub workflow_ids: Vec<String>,
    /// The event
    pub response: TriggerResponse,
}

/// Current time in Unix epoch milliseconds
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
