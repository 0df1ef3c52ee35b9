//! Directory Snapshot
//!
//! Immutable view of every DON, capability and node at one point in time, as produced
//! by the registry syncer. A new snapshot fully replaces the previous one; nothing in
//! this workspace diffs two snapshots.

use crate::types::{CapabilityType, Don, DonId};
use capmesh_p2p::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Published capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Capability identifier (`name@version`)
    pub id: String,
    /// Capability type
    pub capability_type: CapabilityType,
}

/// A DON together with the capabilities it hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonEntry {
    /// DON descriptor
    pub don: Don,
    /// Encoded configuration blob per hosted capability, ordered by capability ID
    pub capability_configurations: BTreeMap<String, Vec<u8>>,
}

impl DonEntry {
    /// DON without hosted capabilities
    pub fn new(don: Don) -> Self {
        Self {
            don,
            capability_configurations: BTreeMap::new(),
        }
    }

    /// Add a hosted capability with its encoded configuration
    pub fn with_capability(mut self, capability_id: impl Into<String>, config: Vec<u8>) -> Self {
        self.capability_configurations
            .insert(capability_id.into(), config);
        self
    }
}

/// Registered node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Peer identity
    pub peer_id: PeerId,
    /// Report signing key as stored on-chain (padded to 32 bytes)
    pub signer: [u8; 32],
    /// Key used to encrypt secrets for this node
    pub encryption_public_key: [u8; 32],
    /// Operator owning the node
    pub node_operator_id: u32,
    /// Workflow DON the node belongs to, if any
    pub workflow_don_id: Option<DonId>,
    /// Capability DONs the node belongs to
    pub capabilities_don_ids: Vec<DonId>,
}

impl NodeInfo {
    /// Signer address: the first 20 bytes of the signing key, the rest is padding
    pub fn signer_address(&self) -> [u8; 20] {
        let mut address = [0u8; 20];
        address.copy_from_slice(&self.signer[..20]);
        address
    }
}

/// Full directory snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// DONs keyed by ID
    pub dons: HashMap<DonId, DonEntry>,
    /// Capabilities keyed by ID
    pub capabilities: HashMap<String, CapabilityDescriptor>,
    /// Nodes keyed by peer identity
    pub nodes: HashMap<PeerId, NodeInfo>,
}

impl DirectorySnapshot {
    /// Empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a DON entry
    pub fn with_don(mut self, entry: DonEntry) -> Self {
        self.dons.insert(entry.don.id, entry);
        self
    }

    /// Add a capability descriptor
    pub fn with_capability(
        mut self,
        id: impl Into<String>,
        capability_type: CapabilityType,
    ) -> Self {
        let id = id.into();
        self.capabilities.insert(
            id.clone(),
            CapabilityDescriptor {
                id,
                capability_type,
            },
        );
        self
    }

    /// Add a node
    pub fn with_node(mut self, node: NodeInfo) -> Self {
        self.nodes.insert(node.peer_id, node);
        self
    }

    /// DON IDs in ascending order
    pub fn sorted_don_ids(&self) -> Vec<DonId> {
        let mut ids: Vec<DonId> = self.dons.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// DONs containing `peer`, in ascending ID order
    pub fn dons_for(&self, peer: &PeerId) -> Vec<&DonEntry> {
        self.sorted_don_ids()
            .into_iter()
            .filter_map(|id| self.dons.get(&id))
            .filter(|entry| entry.don.contains(peer))
            .collect()
    }
}
