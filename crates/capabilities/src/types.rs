//! Capability and DON descriptors

use crate::error::CapabilityError;
use capmesh_p2p::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// DON identifier as assigned by the capabilities registry
pub type DonId = u32;

/// Longest accepted capability identifier
pub const MAX_CAPABILITY_ID_LEN: usize = 128;

/// Capability type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityType {
    /// Emits events that start workflow executions
    Trigger,
    /// Performs a side-effect-free computation on request
    Action,
    /// Aggregates observations across a DON
    Consensus,
    /// Writes a result to an external system
    Target,
    /// Type code this node does not understand
    Unknown(u8),
}

impl CapabilityType {
    /// Map the on-chain type code to a capability type
    pub fn from_raw(code: u8) -> Self {
        match code {
            0 => CapabilityType::Trigger,
            1 => CapabilityType::Action,
            2 => CapabilityType::Consensus,
            3 => CapabilityType::Target,
            other => CapabilityType::Unknown(other),
        }
    }

    /// Actions and targets share the request/response execution shape
    pub fn is_executable(&self) -> bool {
        matches!(self, CapabilityType::Action | CapabilityType::Target)
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityType::Trigger => f.write_str("trigger"),
            CapabilityType::Action => f.write_str("action"),
            CapabilityType::Consensus => f.write_str("consensus"),
            CapabilityType::Target => f.write_str("target"),
            CapabilityType::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

/// Parsed capability identifier of the form `name@version`
///
/// The name may carry labels (`streams-trigger:network_mainnet`); only the part
/// after the last `@` is treated as the version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    /// Name including labels
    pub name: String,
    /// Version string, not yet validated as semver
    pub version: String,
}

impl CapabilityId {
    /// Parse and validate a capability identifier
    pub fn parse(id: &str) -> Result<Self, CapabilityError> {
        let invalid = |reason: &str| CapabilityError::InvalidId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        if id.len() > MAX_CAPABILITY_ID_LEN {
            return Err(invalid("identifier too long"));
        }
        let (name, version) = id.rsplit_once('@').ok_or_else(|| invalid("missing '@'"))?;
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if version.is_empty() {
            return Err(invalid("empty version"));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(invalid("whitespace not allowed"));
        }

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A fixed-membership group of nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Don {
    /// DON identifier
    pub id: DonId,
    /// Version of the DON configuration
    pub config_version: u32,
    /// Member identities
    pub members: Vec<PeerId>,
    /// Maximum number of faulty members tolerated
    pub f: u8,
    /// Whether the DON is reachable from other DONs
    pub is_public: bool,
    /// Whether the DON executes workflows
    pub accepts_workflows: bool,
}

impl Don {
    /// Number of agreeing members needed for a correct result (F+1)
    pub fn threshold(&self) -> usize {
        self.f as usize + 1
    }

    /// Whether `peer` is a member of this DON
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }
}

/// Capability metadata as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    /// Capability identifier (`name@version`)
    pub id: String,
    /// Capability type
    pub capability_type: CapabilityType,
    /// Human readable label
    pub description: String,
    /// DON hosting the capability, absent for purely local capabilities
    pub don: Option<Don>,
    /// Whether the capability executes in this process
    pub is_local: bool,
}

impl CapabilityInfo {
    /// Info for a capability implemented in this process
    pub fn new_local(
        id: impl Into<String>,
        capability_type: CapabilityType,
        description: impl Into<String>,
    ) -> Result<Self, CapabilityError> {
        let id = id.into();
        CapabilityId::parse(&id)?;
        Ok(Self {
            id,
            capability_type,
            description: description.into(),
            don: None,
            is_local: true,
        })
    }

    /// Info for a capability hosted by `don` and reached over the network
    pub fn new_remote(
        id: impl Into<String>,
        capability_type: CapabilityType,
        description: impl Into<String>,
        don: &Don,
    ) -> Result<Self, CapabilityError> {
        let id = id.into();
        CapabilityId::parse(&id)?;
        Ok(Self {
            id,
            capability_type,
            description: description.into(),
            don: Some(don.clone()),
            is_local: false,
        })
    }

    /// Parsed identifier
    pub fn parsed_id(&self) -> Result<CapabilityId, CapabilityError> {
        CapabilityId::parse(&self.id)
    }
}
