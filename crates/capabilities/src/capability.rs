//! Capability interfaces and request/response payloads
//!
//! Local capabilities and remote consumer shims implement the same traits, so the
//! workflow engine cannot tell whether a capability runs in-process or on another DON.

use crate::error::CapabilityError;
use crate::types::{CapabilityInfo, CapabilityType, DonId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Workflow context attached to every capability request
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Workflow identifier
    pub workflow_id: String,
    /// Workflow owner address
    pub workflow_owner: String,
    /// Execution identifier, unique per run
    pub workflow_execution_id: String,
    /// Workflow name
    pub workflow_name: String,
    /// DON executing the workflow
    pub workflow_don_id: DonId,
    /// Config version of that DON
    pub workflow_don_config_version: u32,
    /// Step reference inside the workflow
    pub reference_id: String,
}

/// Request to an action or target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Workflow context
    pub metadata: RequestMetadata,
    /// Step configuration
    pub config: Value,
    /// Step inputs
    pub inputs: Value,
}

/// Response from an action or target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    /// Step outputs
    pub value: Value,
}

/// Request to subscribe a workflow to a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegistrationRequest {
    /// Trigger identifier, unique within the workflow
    pub trigger_id: String,
    /// Workflow context
    pub metadata: RequestMetadata,
    /// Trigger configuration
    pub config: Value,
}

/// One event emitted by a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Trigger type (capability ID)
    pub trigger_type: String,
    /// Event identifier, identical across honest nodes
    pub id: String,
    /// Event payload
    pub outputs: Value,
}

/// Trigger event or trigger-side failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// Event data
    pub event: TriggerEvent,
    /// Error reported by the trigger, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Behaviour shared by every capability
pub trait BaseCapability: Send + Sync {
    /// Capability metadata
    fn info(&self) -> CapabilityInfo;
}

/// Capability producing events for subscribed workflows
#[async_trait]
pub trait TriggerCapability: BaseCapability {
    /// Subscribe a workflow; events arrive on the returned channel
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>, CapabilityError>;

    /// Cancel a subscription
    async fn unregister_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError>;
}

/// Capability executing a single request (actions and targets)
#[async_trait]
pub trait ExecutableCapability: BaseCapability {
    /// Execute one request
    async fn execute(
        &self,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError>;
}

/// Consensus capability; never exposed or consumed remotely
pub trait ConsensusCapability: BaseCapability {}

/// A registered capability, tagged by the interface it implements
#[derive(Clone)]
pub enum CapabilityInstance {
    /// Trigger capability
    Trigger(Arc<dyn TriggerCapability>),
    /// Action or target capability
    Executable(Arc<dyn ExecutableCapability>),
    /// Consensus capability
    Consensus(Arc<dyn ConsensusCapability>),
}

impl CapabilityInstance {
    /// Capability metadata
    pub fn info(&self) -> CapabilityInfo {
        match self {
            CapabilityInstance::Trigger(c) => c.info(),
            CapabilityInstance::Executable(c) => c.info(),
            CapabilityInstance::Consensus(c) => c.info(),
        }
    }

    /// Trigger interface, if implemented
    pub fn as_trigger(&self) -> Option<Arc<dyn TriggerCapability>> {
        match self {
            CapabilityInstance::Trigger(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    /// Executable interface, if implemented
    pub fn as_executable(&self) -> Option<Arc<dyn ExecutableCapability>> {
        match self {
            CapabilityInstance::Executable(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    /// Name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityInstance::Trigger(_) => "trigger",
            CapabilityInstance::Executable(_) => "executable",
            CapabilityInstance::Consensus(_) => "consensus",
        }
    }

    /// Whether the variant can carry the given capability type
    pub fn accepts(&self, capability_type: CapabilityType) -> bool {
        match self {
            CapabilityInstance::Trigger(_) => capability_type == CapabilityType::Trigger,
            CapabilityInstance::Executable(_) => capability_type.is_executable(),
            CapabilityInstance::Consensus(_) => capability_type == CapabilityType::Consensus,
        }
    }
}

impl fmt::Debug for CapabilityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        f.debug_struct("CapabilityInstance")
            .field("kind", &self.kind())
            .field("id", &info.id)
            .field("is_local", &info.is_local)
            .finish()
    }
}
