//! Trigger publisher (producer side)

use crate::aggregation::most_common;
use crate::cache::MessageCache;
use crate::dispatcher::{Dispatcher, Receiver};
use crate::message::{MessageBody, Method, TriggerEventPayload};
use crate::shim::{lock, spawn_ticker};
use async_trait::async_trait;
use capmesh_capabilities::{
    CapabilityInfo, Don, DonId, RemoteTriggerConfig, Service, ServiceError, StateMachine,
    TriggerCapability, TriggerRegistrationRequest, TriggerResponse,
};
use capmesh_p2p::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type RegistrationKey = (DonId, String);

struct ActiveRegistration {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct PublisherInner {
    config: RemoteTriggerConfig,
    underlying: Arc<dyn TriggerCapability>,
    info: CapabilityInfo,
    cap_don: Don,
    workflow_dons: HashMap<DonId, Don>,
    dispatcher: Arc<dyn Dispatcher>,
    registrations: Mutex<MessageCache<RegistrationKey, PeerId>>,
    active: Mutex<HashMap<RegistrationKey, ActiveRegistration>>,
    next_registration_id: AtomicU64,
    cancel: CancellationToken,
}

/// Exposes a local trigger to remote workflow DONs
///
/// A workflow is subscribed to the local trigger once `F+1` members of its DON sent a
/// matching registration. Every resulting event is forwarded to all members of that
/// DON. Registrations that stop being refreshed are dropped.
pub struct TriggerPublisher {
    inner: Arc<PublisherInner>,
    state: StateMachine,
    inbound_tx: mpsc::UnboundedSender<MessageBody>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<MessageBody>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TriggerPublisher {
    /// Create a publisher for `underlying`, hosted on `cap_don`
    pub fn new(
        mut config: RemoteTriggerConfig,
        underlying: Arc<dyn TriggerCapability>,
        info: CapabilityInfo,
        cap_don: Don,
        workflow_dons: HashMap<DonId, Don>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        config.apply_defaults();
        let name = format!("TriggerPublisher({})", info.id);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(PublisherInner {
                config,
                underlying,
                info,
                cap_don,
                workflow_dons,
                dispatcher,
                registrations: Mutex::new(MessageCache::new()),
                active: Mutex::new(HashMap::new()),
                next_registration_id: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
            state: StateMachine::new(name),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Number of workflows currently subscribed to the local trigger
    pub fn active_registrations(&self) -> usize {
        lock(&self.inner.active).len()
    }
}

impl PublisherInner {
    fn handle(self: &Arc<Self>, message: MessageBody) {
        let Some(caller_don) = self.workflow_dons.get(&message.caller_don_id) else {
            warn!(
                capability_id = %self.info.id,
                caller_don_id = message.caller_don_id,
                "Message from unknown workflow DON"
            );
            return;
        };
        if !caller_don.contains(&message.sender) {
            warn!(
                capability_id = %self.info.id,
                sender = %message.sender,
                caller_don_id = caller_don.id,
                "Message from non-member"
            );
            return;
        }

        match message.method {
            Method::RegisterTrigger => self.on_register(caller_don, message),
            Method::UnregisterTrigger => self.on_unregister(caller_don, message),
            other => debug!(method = ?other, "Publisher ignoring message"),
        }
    }

    fn on_register(self: &Arc<Self>, caller_don: &Don, message: MessageBody) {
        let request: TriggerRegistrationRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(sender = %message.sender, error = %e, "Malformed trigger registration");
                return;
            }
        };
        let key = (caller_don.id, request.metadata.workflow_id.clone());
        let now = Instant::now();
        let expiry = self.config.registration_expiry;
        let threshold = caller_don.threshold();

        let payloads = {
            let mut registrations = lock(&self.registrations);
            registrations.insert(key.clone(), message.sender, now, message.payload);
            if lock(&self.active).contains_key(&key) {
                return;
            }
            registrations.ready(&key, threshold, now, expiry, false)
        };
        let Some(payloads) = payloads else {
            return;
        };

        let agreed = match most_common(&payloads) {
            Some((payload, count)) if count >= threshold => payload.to_vec(),
            _ => {
                debug!(workflow_id = %key.1, "Registrations do not agree yet");
                return;
            }
        };
        let request: TriggerRegistrationRequest = match serde_json::from_slice(&agreed) {
            Ok(request) => request,
            Err(e) => {
                warn!(workflow_id = %key.1, error = %e, "Malformed agreed registration");
                return;
            }
        };

        let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let mut active = lock(&self.active);
        let task = tokio::spawn(Arc::clone(self).run_registration(
            id,
            caller_don.clone(),
            request,
            cancel.clone(),
        ));
        active.insert(key.clone(), ActiveRegistration { id, cancel, task });
        drop(active);
        info!(
            capability_id = %self.info.id,
            caller_don_id = key.0,
            workflow_id = %key.1,
            "Remote workflow subscribed to trigger"
        );
    }

    fn on_unregister(&self, caller_don: &Don, message: MessageBody) {
        let key = (caller_don.id, message.message_id.clone());
        let fresh = {
            let mut registrations = lock(&self.registrations);
            registrations.remove_sender(&key, &message.sender);
            registrations.fresh_count(&key, Instant::now(), self.config.registration_expiry)
        };
        if fresh < caller_don.threshold() {
            self.deactivate(&key);
        }
    }

    fn deactivate(&self, key: &RegistrationKey) {
        if let Some(active) = lock(&self.active).remove(key) {
            active.cancel.cancel();
            debug!(caller_don_id = key.0, workflow_id = %key.1, "Trigger registration dropped");
        }
    }

    /// Forget the active entry of registration `id`, unless a newer one replaced it
    fn release(&self, key: &RegistrationKey, id: u64) {
        let mut active = lock(&self.active);
        if active.get(key).is_some_and(|a| a.id == id) {
            active.remove(key);
        }
    }

    fn expire_registrations(&self) {
        let now = Instant::now();
        let expiry = self.config.registration_expiry;
        let stale: Vec<RegistrationKey> = {
            let mut registrations = lock(&self.registrations);
            let stale: Vec<RegistrationKey> = registrations
                .keys()
                .into_iter()
                .filter(|key| {
                    let threshold = self
                        .workflow_dons
                        .get(&key.0)
                        .map(Don::threshold)
                        .unwrap_or(1);
                    registrations.fresh_count(key, now, expiry) < threshold
                })
                .collect();
            for key in &stale {
                registrations.delete(key);
            }
            stale
        };

        for key in &stale {
            self.deactivate(key);
        }
    }

    async fn run_registration(
        self: Arc<Self>,
        id: u64,
        caller_don: Don,
        request: TriggerRegistrationRequest,
        cancel: CancellationToken,
    ) {
        let workflow_id = request.metadata.workflow_id.clone();
        let key = (caller_don.id, workflow_id.clone());
        let mut events = match self.underlying.register_trigger(request.clone()).await {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    capability_id = %self.info.id,
                    workflow_id = %workflow_id,
                    error = %e,
                    "Local trigger registration failed"
                );
                self.release(&key, id);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(response) => self.forward(&caller_don, &workflow_id, response),
                    None => {
                        debug!(workflow_id = %workflow_id, "Local trigger stream ended");
                        break;
                    }
                },
            }
        }

        self.release(&key, id);
        if let Err(e) = self.underlying.unregister_trigger(request).await {
            warn!(workflow_id = %workflow_id, error = %e, "Local trigger unregistration failed");
        }
    }

    fn forward(&self, caller_don: &Don, workflow_id: &str, response: TriggerResponse) {
        let event_id = response.event.id.clone();
        let payload = TriggerEventPayload {
            trigger_event_id: event_id.clone(),
            workflow_ids: vec![workflow_id.to_string()],
            response,
        };
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Unserializable trigger event");
                return;
            }
        };

        for member in &caller_don.members {
            let message = MessageBody::new(
                Method::TriggerEvent,
                self.info.id.clone(),
                self.cap_don.id,
                caller_don.id,
                event_id.clone(),
                bytes.clone(),
            );
            if let Err(e) = self.dispatcher.send(*member, message) {
                warn!(peer = %member, event_id = %event_id, error = %e, "Failed to forward trigger event");
            }
        }
    }
}

impl Receiver for TriggerPublisher {
    fn receive(&self, message: MessageBody) {
        if self.inbound_tx.send(message).is_err() {
            debug!(capability_id = %self.inner.info.id, "Publisher closed, dropping message");
        }
    }
}

#[async_trait]
impl Service for TriggerPublisher {
    fn name(&self) -> String {
        self.state.name().to_string()
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.state.start_once(|| {
            let mut inbound = lock(&self.inbound_rx).take().ok_or_else(|| ServiceError::Failed {
                name: self.state.name().to_string(),
                reason: "inbound queue already taken".to_string(),
            })?;

            let inner = Arc::clone(&self.inner);
            let cancel = self.inner.cancel.clone();
            let worker = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        message = inbound.recv() => match message {
                            Some(message) => inner.handle(message),
                            None => break,
                        },
                    }
                }
            });

            let cleanup = spawn_ticker(self.inner.cancel.clone(), self.inner.config.registration_expiry, {
                let inner = Arc::clone(&self.inner);
                move || inner.expire_registrations()
            });
            lock(&self.tasks).extend([worker, cleanup]);
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), ServiceError> {
        self.state.stop_once(|| {
            self.inner.cancel.cancel();
            Ok(())
        })?;

        let mut tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        tasks.extend(lock(&self.inner.active).drain().map(|(_, active)| active.task));
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    fn ready(&self) -> Result<(), ServiceError> {
        self.state.ready()
    }
}
