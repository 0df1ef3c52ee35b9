//! Local Capability Registry
//!
//! Maps capability IDs to the instance serving them, whether implemented in-process or
//! by a remote shim. The registry also holds the latest directory snapshot so that the
//! invocation path can resolve per-DON configuration.
//!
//! `add` is atomic per key: the check for an existing entry and the insert happen under
//! one write lock, so concurrent reconciliation passes cannot both install a capability.

use crate::capability::CapabilityInstance;
use crate::config::CapabilityConfiguration;
use crate::error::RegistryError;
use crate::snapshot::DirectorySnapshot;
use crate::types::{CapabilityInfo, Don, DonId};
use capmesh_p2p::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Outcome of an idempotent registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Entry was created
    Added,
    /// An entry for the key already existed; nothing changed
    AlreadyPresent,
}

/// This node's position in the topology
#[derive(Debug, Clone, PartialEq)]
pub struct LocalNode {
    /// This node's identity
    pub peer_id: PeerId,
    /// Workflow DON the node belongs to
    pub workflow_don: Option<Don>,
    /// Other DONs the node belongs to, ascending by ID
    pub capability_dons: Vec<Don>,
}

/// Local Capability Registry
#[derive(Debug, Default)]
pub struct Registry {
    capabilities: RwLock<HashMap<String, CapabilityInstance>>,
    snapshot: RwLock<Option<Arc<DirectorySnapshot>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under the ID reported by its info
    pub fn add(&self, instance: CapabilityInstance) -> Result<Registration, RegistryError> {
        let info = instance.info();
        info.parsed_id()?;
        if !instance.accepts(info.capability_type) {
            return Err(RegistryError::TypeMismatch {
                id: info.id,
                declared: info.capability_type.to_string(),
                registered: instance.kind(),
            });
        }

        let mut capabilities = self.capabilities.write().map_err(|_| poisoned())?;
        if capabilities.contains_key(&info.id) {
            return Ok(Registration::AlreadyPresent);
        }

        debug!(capability_id = %info.id, is_local = info.is_local, "Capability added to registry");
        capabilities.insert(info.id, instance);
        Ok(Registration::Added)
    }

    /// Look up a capability
    pub fn get(&self, id: &str) -> Result<CapabilityInstance, RegistryError> {
        self.capabilities
            .read()
            .map_err(|_| poisoned())?
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    /// Info of every registered capability, sorted by ID
    pub fn list(&self) -> Result<Vec<CapabilityInfo>, RegistryError> {
        let mut infos: Vec<CapabilityInfo> = self
            .capabilities
            .read()
            .map_err(|_| poisoned())?
            .values()
            .map(CapabilityInstance::info)
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    /// Number of registered capabilities
    pub fn len(&self) -> usize {
        self.capabilities.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the held snapshot
    pub fn set_snapshot(&self, snapshot: Arc<DirectorySnapshot>) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(snapshot);
    }

    /// Currently held snapshot
    pub fn snapshot(&self) -> Result<Arc<DirectorySnapshot>, RegistryError> {
        self.snapshot
            .read()
            .map_err(|_| poisoned())?
            .clone()
            .ok_or(RegistryError::NoSnapshot)
    }

    /// Locate `peer_id` in the held snapshot
    ///
    /// The first workflow DON (ascending ID) containing the node is reported as its
    /// workflow DON; every other DON containing it is a capability DON.
    pub fn local_node(&self, peer_id: PeerId) -> Result<LocalNode, RegistryError> {
        let snapshot = self.snapshot()?;

        let mut workflow_don = None;
        let mut capability_dons = Vec::new();
        for entry in snapshot.dons_for(&peer_id) {
            if entry.don.accepts_workflows && workflow_don.is_none() {
                workflow_don = Some(entry.don.clone());
            } else {
                capability_dons.push(entry.don.clone());
            }
        }

        Ok(LocalNode {
            peer_id,
            workflow_don,
            capability_dons,
        })
    }

    /// Decoded configuration of `capability_id` on DON `don_id`
    pub fn config_for_capability(
        &self,
        capability_id: &str,
        don_id: DonId,
    ) -> Result<CapabilityConfiguration, RegistryError> {
        let snapshot = self.snapshot()?;
        let entry = snapshot
            .dons
            .get(&don_id)
            .ok_or(RegistryError::DonNotFound { don_id })?;
        let blob = entry
            .capability_configurations
            .get(capability_id)
            .ok_or_else(|| RegistryError::ConfigNotFound {
                capability_id: capability_id.to_string(),
                don_id,
            })?;
        Ok(CapabilityConfiguration::decode(blob)?)
    }
}

fn poisoned() -> RegistryError {
    RegistryError::InvalidState("registry lock poisoned".to_string())
}
