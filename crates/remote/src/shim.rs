//! Shim plumbing shared by the launcher
//!
//! Every shim is both a dispatcher [`Receiver`] and a managed [`Service`]. Consumer
//! shims additionally stand in for the remote capability inside the local registry.

use crate::dispatcher::Receiver;
use capmesh_capabilities::{CapabilityInstance, Service};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A remote shim: receives wire messages and runs as a managed service
pub trait CapabilityShim: Receiver + Service + 'static {
    /// View as a dispatcher receiver
    fn into_receiver(self: Arc<Self>) -> Arc<dyn Receiver>;

    /// View as a managed service
    fn into_service(self: Arc<Self>) -> Arc<dyn Service>;
}

impl<T: Receiver + Service + 'static> CapabilityShim for T {
    fn into_receiver(self: Arc<Self>) -> Arc<dyn Receiver> {
        self
    }

    fn into_service(self: Arc<Self>) -> Arc<dyn Service> {
        self
    }
}

/// Consumer-side shim registered in place of a remote capability
pub trait ConsumerShim: CapabilityShim {
    /// Registry entry for this shim
    fn instance(self: Arc<Self>) -> CapabilityInstance;
}

/// Run `tick` every `period` until cancelled
pub(crate) fn spawn_ticker<F>(cancel: CancellationToken, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick(),
            }
        }
    })
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
