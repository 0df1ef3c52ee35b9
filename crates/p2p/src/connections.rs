//! Declarative Connection Management
//!
//! Callers hand the connection manager the complete set of peers they want to be
//! connected to. The manager owns convergence: peers missing from the live set are
//! dialled, peers absent from the target set are dropped. Callers never issue
//! incremental add/remove calls.

use crate::error::{PeerError, PeerResult};
use crate::peer::PeerId;
use crate::stream::StreamConfig;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::debug;

/// Peer Connection Manager seam
pub trait PeerConnections: Send + Sync {
    /// Identity of this node on the peer layer
    fn my_id(&self) -> PeerId;

    /// Converge the live connection set onto `peers`
    ///
    /// An empty map drops every connection.
    fn update_connections(&self, peers: HashMap<PeerId, StreamConfig>) -> PeerResult<()>;
}

/// Difference between two consecutive target sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDelta {
    /// Peers that were dialled
    pub added: BTreeSet<PeerId>,
    /// Peers that were dropped
    pub removed: BTreeSet<PeerId>,
    /// Peers whose stream profile changed
    pub reconfigured: BTreeSet<PeerId>,
}

impl ConnectionDelta {
    /// True when the update changed nothing
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reconfigured.is_empty()
    }
}

/// In-memory connection manager
///
/// Tracks the converged connection set and the delta produced by the latest update.
/// This node's own identity never gets a stream.
#[derive(Debug)]
pub struct ConnectionTable {
    my_id: PeerId,
    inner: Mutex<TableState>,
}

#[derive(Debug, Default)]
struct TableState {
    live: HashMap<PeerId, StreamConfig>,
    last_delta: ConnectionDelta,
    updates: u64,
}

impl ConnectionTable {
    /// Create an empty table for the node identified by `my_id`
    pub fn new(my_id: PeerId) -> Self {
        Self {
            my_id,
            inner: Mutex::new(TableState::default()),
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.with_state(|s| s.live.len()).unwrap_or(0)
    }

    /// Whether a connection to `peer` is live
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.with_state(|s| s.live.contains_key(peer)).unwrap_or(false)
    }

    /// Stream profile of a live connection
    pub fn stream_config(&self, peer: &PeerId) -> Option<StreamConfig> {
        self.with_state(|s| s.live.get(peer).copied()).ok().flatten()
    }

    /// Delta produced by the most recent update
    pub fn last_delta(&self) -> ConnectionDelta {
        self.with_state(|s| s.last_delta.clone()).unwrap_or_default()
    }

    /// Number of updates applied so far
    pub fn update_count(&self) -> u64 {
        self.with_state(|s| s.updates).unwrap_or(0)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TableState) -> R) -> PeerResult<R> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| PeerError::InvalidState("connection table lock poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

impl PeerConnections for ConnectionTable {
    fn my_id(&self) -> PeerId {
        self.my_id
    }

    fn update_connections(&self, mut peers: HashMap<PeerId, StreamConfig>) -> PeerResult<()> {
        peers.remove(&self.my_id);

        let delta = self.with_state(|state| {
            let mut delta = ConnectionDelta::default();
            for (peer, config) in &peers {
                match state.live.get(peer) {
                    None => {
                        delta.added.insert(*peer);
                    }
                    Some(existing) if existing != config => {
                        delta.reconfigured.insert(*peer);
                    }
                    Some(_) => {}
                }
            }
            for peer in state.live.keys() {
                if !peers.contains_key(peer) {
                    delta.removed.insert(*peer);
                }
            }

            state.live = peers;
            state.last_delta = delta.clone();
            state.updates += 1;
            delta
        })?;

        debug!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            reconfigured = delta.reconfigured.len(),
            "Peer connections converged"
        );
        Ok(())
    }
}
