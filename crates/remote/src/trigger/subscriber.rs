//! Trigger subscriber (consumer side)

use super::EVENT_CHANNEL_CAPACITY;
use crate::aggregation::Aggregator;
use crate::cache::MessageCache;
use crate::dispatcher::{Dispatcher, Receiver};
use crate::message::{MessageBody, Method, TriggerEventPayload};
use crate::shim::{lock, spawn_ticker, ConsumerShim};
use async_trait::async_trait;
use capmesh_capabilities::{
    BaseCapability, CapabilityError, CapabilityInfo, CapabilityInstance, Don,
    RemoteTriggerConfig, Service, ServiceError, StateMachine, TriggerCapability,
    TriggerRegistrationRequest, TriggerResponse,
};
use capmesh_p2p::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Subscription {
    payload: Vec<u8>,
    events: mpsc::Sender<TriggerResponse>,
}

struct SubscriberInner {
    config: RemoteTriggerConfig,
    min_responses: usize,
    info: CapabilityInfo,
    cap_don: Don,
    local_don: Don,
    dispatcher: Arc<dyn Dispatcher>,
    aggregator: Arc<dyn Aggregator>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    events: Mutex<MessageCache<(String, String), PeerId>>,
}

/// Stands in for a trigger hosted by a remote capability DON
///
/// Registrations are sent to every member of the capability DON and refreshed
/// periodically. Events are delivered to the workflow once enough members reported
/// them and the aggregator accepted the result.
pub struct TriggerSubscriber {
    inner: Arc<SubscriberInner>,
    state: StateMachine,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TriggerSubscriber {
    /// Create a subscriber
    ///
    /// Zero durations in `config` fall back to the defaults; a zero
    /// `min_responses_to_aggregate` becomes `F+1` of `cap_don`.
    pub fn new(
        mut config: RemoteTriggerConfig,
        info: CapabilityInfo,
        cap_don: Don,
        local_don: Don,
        dispatcher: Arc<dyn Dispatcher>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        config.apply_defaults();
        let min_responses = match config.min_responses_to_aggregate {
            0 => cap_don.threshold(),
            n => n as usize,
        };
        let name = format!("TriggerSubscriber({})", info.id);

        Self {
            inner: Arc::new(SubscriberInner {
                config,
                min_responses,
                info,
                cap_don,
                local_don,
                dispatcher,
                aggregator,
                subscriptions: Mutex::new(HashMap::new()),
                events: Mutex::new(MessageCache::new()),
            }),
            state: StateMachine::new(name),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Distinct responses required before aggregating
    pub fn min_responses(&self) -> usize {
        self.inner.min_responses
    }

    /// Effective configuration
    pub fn config(&self) -> &RemoteTriggerConfig {
        &self.inner.config
    }

    /// Number of active workflow subscriptions
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }
}

impl SubscriberInner {
    fn send_to_don(&self, method: Method, workflow_id: &str, payload: &[u8]) {
        for member in &self.cap_don.members {
            let message = MessageBody::new(
                method,
                self.info.id.clone(),
                self.cap_don.id,
                self.local_don.id,
                workflow_id,
                payload.to_vec(),
            );
            if let Err(e) = self.dispatcher.send(*member, message) {
                warn!(
                    capability_id = %self.info.id,
                    peer = %member,
                    error = %e,
                    "Failed to send trigger registration"
                );
            }
        }
    }

    fn refresh_registrations(&self) {
        let pending: Vec<(String, Vec<u8>)> = lock(&self.subscriptions)
            .iter()
            .map(|(workflow_id, sub)| (workflow_id.clone(), sub.payload.clone()))
            .collect();
        for (workflow_id, payload) in pending {
            self.send_to_don(Method::RegisterTrigger, &workflow_id, &payload);
        }
    }

    fn expire_events(&self) {
        let dropped = lock(&self.events).delete_older_than(Instant::now(), self.config.message_expiry);
        if dropped > 0 {
            debug!(capability_id = %self.info.id, dropped, "Expired unaggregated trigger events");
        }
    }

    fn handle_event(&self, sender: PeerId, payload: TriggerEventPayload) {
        let response_bytes = match serde_json::to_vec(&payload.response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(capability_id = %self.info.id, error = %e, "Unserializable trigger event");
                return;
            }
        };
        let now = Instant::now();

        for workflow_id in &payload.workflow_ids {
            let target = lock(&self.subscriptions)
                .get(workflow_id)
                .map(|sub| sub.events.clone());
            let Some(target) = target else {
                debug!(workflow_id = %workflow_id, "Event for unknown workflow");
                continue;
            };

            let key = (workflow_id.clone(), payload.trigger_event_id.clone());
            let ready = {
                let mut events = lock(&self.events);
                events.insert(key.clone(), sender, now, response_bytes.clone());
                events.ready(&key, self.min_responses, now, self.config.message_expiry, true)
            };
            let Some(responses) = ready else {
                continue;
            };

            match self.aggregator.aggregate(&payload.trigger_event_id, &responses) {
                Ok(aggregated) => {
                    if let Err(e) = target.try_send(aggregated) {
                        warn!(
                            workflow_id = %workflow_id,
                            event_id = %payload.trigger_event_id,
                            error = %e,
                            "Dropping aggregated trigger event"
                        );
                    }
                }
                Err(e) => warn!(
                    workflow_id = %workflow_id,
                    event_id = %payload.trigger_event_id,
                    error = %e,
                    "Trigger event aggregation failed"
                ),
            }
        }
    }
}

impl BaseCapability for TriggerSubscriber {
    fn info(&self) -> CapabilityInfo {
        self.inner.info.clone()
    }
}

#[async_trait]
impl TriggerCapability for TriggerSubscriber {
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>, CapabilityError> {
        let workflow_id = request.metadata.workflow_id.clone();
        if workflow_id.is_empty() {
            return Err(CapabilityError::Registration(
                "workflow ID is required".to_string(),
            ));
        }
        let payload = serde_json::to_vec(&request)
            .map_err(|e| CapabilityError::Registration(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        {
            let mut subscriptions = lock(&self.inner.subscriptions);
            if subscriptions.contains_key(&workflow_id) {
                return Err(CapabilityError::Registration(format!(
                    "workflow {} already registered",
                    workflow_id
                )));
            }
            subscriptions.insert(
                workflow_id.clone(),
                Subscription {
                    payload: payload.clone(),
                    events: tx,
                },
            );
        }

        self.inner
            .send_to_don(Method::RegisterTrigger, &workflow_id, &payload);
        info!(capability_id = %self.inner.info.id, workflow_id = %workflow_id, "Remote trigger registered");
        Ok(rx)
    }

    async fn unregister_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError> {
        let workflow_id = request.metadata.workflow_id.clone();
        let removed = lock(&self.inner.subscriptions).remove(&workflow_id);
        if removed.is_none() {
            return Err(CapabilityError::Registration(format!(
                "workflow {} not registered",
                workflow_id
            )));
        }

        let payload = serde_json::to_vec(&request)
            .map_err(|e| CapabilityError::Registration(e.to_string()))?;
        self.inner
            .send_to_don(Method::UnregisterTrigger, &workflow_id, &payload);
        Ok(())
    }
}

impl Receiver for TriggerSubscriber {
    fn receive(&self, message: MessageBody) {
        if message.method != Method::TriggerEvent {
            debug!(method = ?message.method, "Subscriber ignoring message");
            return;
        }
        if !self.inner.cap_don.contains(&message.sender) {
            warn!(
                capability_id = %self.inner.info.id,
                sender = %message.sender,
                "Trigger event from non-member"
            );
            return;
        }
        if let Some(error) = &message.error {
            warn!(capability_id = %self.inner.info.id, sender = %message.sender, error = %error, "Remote trigger error");
            return;
        }

        match serde_json::from_slice::<TriggerEventPayload>(&message.payload) {
            Ok(payload) => self.inner.handle_event(message.sender, payload),
            Err(e) => warn!(sender = %message.sender, error = %e, "Malformed trigger event"),
        }
    }
}

#[async_trait]
impl Service for TriggerSubscriber {
    fn name(&self) -> String {
        self.state.name().to_string()
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.state.start_once(|| {
            let refresh = spawn_ticker(
                self.cancel.clone(),
                self.inner.config.registration_refresh,
                {
                    let inner = Arc::clone(&self.inner);
                    move || inner.refresh_registrations()
                },
            );
            let cleanup = spawn_ticker(
                self.cancel.clone(),
                self.inner.config.message_expiry,
                {
                    let inner = Arc::clone(&self.inner);
                    move || inner.expire_events()
                },
            );
            lock(&self.tasks).extend([refresh, cleanup]);
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), ServiceError> {
        self.state.stop_once(|| {
            self.cancel.cancel();
            lock(&self.inner.subscriptions).clear();
            Ok(())
        })?;

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    fn ready(&self) -> Result<(), ServiceError> {
        self.state.ready()
    }
}

impl ConsumerShim for TriggerSubscriber {
    fn instance(self: Arc<Self>) -> CapabilityInstance {
        CapabilityInstance::Trigger(self)
    }
}
