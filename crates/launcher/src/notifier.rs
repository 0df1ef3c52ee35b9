//! Workflow DON notification
//!
//! The launcher announces the node's workflow DON so that the workflow engine can
//! start once it knows which DON it executes for.

use capmesh_capabilities::Don;
use tokio::sync::watch;
use tracing::debug;

/// Receives the node's workflow DON on every launch that finds one
pub trait WorkflowDonNotifier: Send + Sync {
    /// Record the workflow DON
    fn notify_don_set(&self, don: Don);
}

/// Watch-channel backed notifier
#[derive(Debug)]
pub struct DonNotifier {
    tx: watch::Sender<Option<Don>>,
}

impl Default for DonNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DonNotifier {
    /// Create a notifier with no DON set
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Latest DON, if any
    pub fn current(&self) -> Option<Don> {
        self.tx.borrow().clone()
    }

    /// Wait until a DON has been set and return it
    ///
    /// Returns `None` if the notifier is dropped first.
    pub async fn wait_for_don(&self) -> Option<Don> {
        let mut rx = self.tx.subscribe();
        let don = rx.wait_for(Option::is_some).await.ok()?;
        don.clone()
    }
}

impl WorkflowDonNotifier for DonNotifier {
    fn notify_don_set(&self, don: Don) {
        debug!(don_id = don.id, "Workflow DON set");
        self.tx.send_replace(Some(don));
    }
}
