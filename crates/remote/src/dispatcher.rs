//! Message dispatcher
//!
//! Inbound messages are routed by `(capability_id, capability_don_id)`. Both consumer
//! and producer shims register under the ID of the DON hosting the capability, so one
//! key identifies one shim on this node.

use crate::error::DispatchError;
use crate::message::{MessageBody, MESSAGE_VERSION};
use capmesh_capabilities::{DonId, Registration};
use capmesh_p2p::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handler for inbound messages
pub trait Receiver: Send + Sync {
    /// Handle one message; must not block
    fn receive(&self, message: MessageBody);
}

/// Routing seam between shims and the transport
pub trait Dispatcher: Send + Sync {
    /// Install `receiver` for the key; an existing route is left untouched
    fn set_receiver(
        &self,
        capability_id: &str,
        don_id: DonId,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Registration, DispatchError>;

    /// Remove the route for the key, if any
    fn remove_receiver(&self, capability_id: &str, don_id: DonId);

    /// Send `message` to `peer`
    fn send(&self, peer: PeerId, message: MessageBody) -> Result<(), DispatchError>;
}

type RouteKey = (String, DonId);

/// In-process dispatcher
///
/// Outbound messages are stamped with sender/receiver and queued on a channel drained
/// by the transport; inbound messages are fed in through [`LocalDispatcher::dispatch`].
pub struct LocalDispatcher {
    my_id: PeerId,
    routes: RwLock<HashMap<RouteKey, Arc<dyn Receiver>>>,
    outbound: mpsc::UnboundedSender<MessageBody>,
}

impl LocalDispatcher {
    /// Create a dispatcher and the outbound queue the transport drains
    pub fn new(my_id: PeerId) -> (Self, mpsc::UnboundedReceiver<MessageBody>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                my_id,
                routes: RwLock::new(HashMap::new()),
                outbound: tx,
            },
            rx,
        )
    }

    /// Route an inbound message to its receiver
    pub fn dispatch(&self, message: MessageBody) -> Result<(), DispatchError> {
        if message.version != MESSAGE_VERSION {
            return Err(DispatchError::UnsupportedVersion {
                got: message.version,
                expected: MESSAGE_VERSION,
            });
        }

        let receiver = {
            let routes = self.routes.read().map_err(|_| poisoned())?;
            routes
                .get(&(message.capability_id.clone(), message.capability_don_id))
                .cloned()
        };

        match receiver {
            Some(receiver) => {
                receiver.receive(message);
                Ok(())
            }
            None => {
                warn!(
                    capability_id = %message.capability_id,
                    don_id = message.capability_don_id,
                    sender = %message.sender,
                    "Dropping message without receiver"
                );
                Err(DispatchError::ReceiverNotFound {
                    capability_id: message.capability_id,
                    don_id: message.capability_don_id,
                })
            }
        }
    }

    /// Number of installed routes
    pub fn route_count(&self) -> usize {
        self.routes.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether a route exists for the key
    pub fn has_receiver(&self, capability_id: &str, don_id: DonId) -> bool {
        self.routes
            .read()
            .map(|r| r.contains_key(&(capability_id.to_string(), don_id)))
            .unwrap_or(false)
    }
}

impl Dispatcher for LocalDispatcher {
    fn set_receiver(
        &self,
        capability_id: &str,
        don_id: DonId,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Registration, DispatchError> {
        let mut routes = self.routes.write().map_err(|_| poisoned())?;
        let key = (capability_id.to_string(), don_id);
        if routes.contains_key(&key) {
            return Ok(Registration::AlreadyPresent);
        }
        routes.insert(key, receiver);
        debug!(capability_id = %capability_id, don_id, "Receiver installed");
        Ok(Registration::Added)
    }

    fn remove_receiver(&self, capability_id: &str, don_id: DonId) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(&(capability_id.to_string(), don_id));
        }
    }

    fn send(&self, peer: PeerId, mut message: MessageBody) -> Result<(), DispatchError> {
        message.sender = self.my_id;
        message.receiver = peer;
        self.outbound
            .send(message)
            .map_err(|_| DispatchError::TransportClosed)
    }
}

fn poisoned() -> DispatchError {
    DispatchError::InvalidState("route table lock poisoned".to_string())
}
