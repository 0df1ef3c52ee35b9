//! Topology classification
//!
//! Pure functions over a directory snapshot: which peers to connect to and how each
//! DON relates to this node. DONs are visited in ascending ID order so that repeated
//! passes over the same snapshot produce the same sequence of side effects.

use capmesh_capabilities::{DirectorySnapshot, Don, DonEntry};
use capmesh_p2p::{PeerId, StreamConfig};
use std::collections::HashMap;

/// DONs of a snapshot grouped by their relation to this node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DonClassification {
    /// Workflow DONs containing this node; more than one is an invariant violation
    pub my_workflow_dons: Vec<Don>,
    /// Workflow DONs this node is not part of
    pub remote_workflow_dons: Vec<Don>,
    /// Public DONs hosting capabilities that contain this node
    pub my_capability_dons: Vec<DonEntry>,
    /// Public DONs hosting capabilities that do not contain this node
    pub remote_capability_dons: Vec<DonEntry>,
}

/// Connection set: every member of every public DON, all with `stream`
///
/// This node's own identity is included when it belongs to a public DON; the
/// connection manager skips it.
pub fn desired_connections(
    snapshot: &DirectorySnapshot,
    stream: StreamConfig,
) -> HashMap<PeerId, StreamConfig> {
    snapshot
        .sorted_don_ids()
        .into_iter()
        .filter_map(|id| snapshot.dons.get(&id))
        .filter(|entry| entry.don.is_public)
        .flat_map(|entry| entry.don.members.iter().copied())
        .map(|peer| (peer, stream))
        .collect()
}

/// Classify every DON of `snapshot` relative to `my_id`
pub fn classify(snapshot: &DirectorySnapshot, my_id: &PeerId) -> DonClassification {
    let mut classification = DonClassification::default();

    for id in snapshot.sorted_don_ids() {
        let Some(entry) = snapshot.dons.get(&id) else {
            continue;
        };
        let is_member = entry.don.contains(my_id);

        if entry.don.accepts_workflows {
            if is_member {
                classification.my_workflow_dons.push(entry.don.clone());
            } else {
                classification.remote_workflow_dons.push(entry.don.clone());
            }
        }

        if entry.don.is_public && !entry.capability_configurations.is_empty() {
            if is_member {
                classification.my_capability_dons.push(entry.clone());
            } else {
                classification.remote_capability_dons.push(entry.clone());
            }
        }
    }

    classification
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmesh_capabilities::DonId;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn entry(id: DonId, members: &[u8], is_public: bool, accepts_workflows: bool) -> DonEntry {
        DonEntry::new(Don {
            id,
            config_version: 1,
            members: members.iter().map(|n| peer(*n)).collect(),
            f: 0,
            is_public,
            accepts_workflows,
        })
    }

    #[test]
    fn test_connections_cover_public_members_only() {
        let snapshot = DirectorySnapshot::new()
            .with_don(entry(1, &[1, 2], true, false))
            .with_don(entry(2, &[2, 3], true, true))
            .with_don(entry(3, &[7, 8], false, true));

        let connections = desired_connections(&snapshot, StreamConfig::default());
        let mut peers: Vec<PeerId> = connections.keys().copied().collect();
        peers.sort();
        assert_eq!(peers, vec![peer(1), peer(2), peer(3)]);
        assert!(connections.values().all(|c| *c == StreamConfig::default()));
    }

    #[test]
    fn test_classification() {
        let snapshot = DirectorySnapshot::new()
            .with_don(entry(4, &[9], true, false).with_capability("write@1.0.0", vec![]))
            .with_don(entry(1, &[1, 2], false, true))
            .with_don(entry(2, &[3, 4], true, true))
            .with_don(entry(3, &[1, 5], true, false).with_capability("cron@1.0.0", vec![]))
            .with_don(entry(5, &[1], true, false));

        let c = classify(&snapshot, &peer(1));
        let ids = |dons: &[Don]| dons.iter().map(|d| d.id).collect::<Vec<_>>();
        let entry_ids = |dons: &[DonEntry]| dons.iter().map(|d| d.don.id).collect::<Vec<_>>();

        assert_eq!(ids(&c.my_workflow_dons), vec![1]);
        assert_eq!(ids(&c.remote_workflow_dons), vec![2]);
        assert_eq!(entry_ids(&c.my_capability_dons), vec![3]);
        assert_eq!(entry_ids(&c.remote_capability_dons), vec![4]);
    }
}
