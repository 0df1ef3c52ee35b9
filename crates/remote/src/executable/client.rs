//! Executable client (consumer side)

use super::execution_message_id;
use crate::dispatcher::{Dispatcher, Receiver};
use crate::message::{MessageBody, Method};
use crate::shim::{lock, ConsumerShim};
use async_trait::async_trait;
use capmesh_capabilities::{
    BaseCapability, CapabilityError, CapabilityInfo, CapabilityInstance, CapabilityRequest,
    CapabilityResponse, Don, ExecutableCapability, Service, ServiceError, StateMachine,
};
use capmesh_p2p::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Outcome = Result<CapabilityResponse, CapabilityError>;

struct PendingRequest {
    responses: HashMap<PeerId, Result<Vec<u8>, String>>,
    done: oneshot::Sender<Outcome>,
}

/// Stands in for an action or target hosted by a remote capability DON
///
/// Each request goes to every member of the capability DON. The call resolves on the
/// first `F+1` identical responses, or `F+1` identical errors.
pub struct ExecutableClient {
    info: CapabilityInfo,
    cap_don: Don,
    local_don: Don,
    dispatcher: Arc<dyn Dispatcher>,
    request_timeout: Duration,
    pending: Mutex<HashMap<String, PendingRequest>>,
    state: StateMachine,
}

impl ExecutableClient {
    /// Create a client; `info` must carry the hosting DON
    pub fn new(
        info: CapabilityInfo,
        local_don: Don,
        dispatcher: Arc<dyn Dispatcher>,
        request_timeout: Duration,
    ) -> Result<Self, CapabilityError> {
        let cap_don = info.don.clone().ok_or_else(|| {
            CapabilityError::Registration(format!("remote capability {} has no DON", info.id))
        })?;
        let name = format!("ExecutableClient({})", info.id);
        Ok(Self {
            info,
            cap_don,
            local_don,
            dispatcher,
            request_timeout,
            pending: Mutex::new(HashMap::new()),
            state: StateMachine::new(name),
        })
    }

    /// Requests awaiting a quorum
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn on_response(&self, message: MessageBody) {
        let mut pending = lock(&self.pending);
        let Some(request) = pending.get_mut(&message.message_id) else {
            debug!(message_id = %message.message_id, "Response for unknown request");
            return;
        };

        let outcome = match message.error {
            Some(error) => Err(error),
            None => Ok(message.payload),
        };
        request.responses.insert(message.sender, outcome.clone());
        let agreeing = request.responses.values().filter(|r| **r == outcome).count();
        if agreeing < self.cap_don.threshold() {
            return;
        }

        let Some(request) = pending.remove(&message.message_id) else {
            return;
        };
        drop(pending);

        let result = match outcome {
            Ok(bytes) => serde_json::from_slice::<CapabilityResponse>(&bytes)
                .map_err(|e| CapabilityError::Execution(format!("malformed response: {}", e))),
            Err(error) => Err(CapabilityError::Execution(error)),
        };
        let _ = request.done.send(result);
    }
}

impl BaseCapability for ExecutableClient {
    fn info(&self) -> CapabilityInfo {
        self.info.clone()
    }
}

#[async_trait]
impl ExecutableCapability for ExecutableClient {
    async fn execute(&self, request: CapabilityRequest) -> Outcome {
        self.state
            .ready()
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        let message_id = execution_message_id(&request.metadata)?;
        let payload =
            serde_json::to_vec(&request).map_err(|e| CapabilityError::Execution(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&message_id) {
                return Err(CapabilityError::Execution(format!(
                    "request {} already in flight",
                    message_id
                )));
            }
            pending.insert(
                message_id.clone(),
                PendingRequest {
                    responses: HashMap::new(),
                    done: tx,
                },
            );
        }

        for member in &self.cap_don.members {
            let message = MessageBody::new(
                Method::Execute,
                self.info.id.clone(),
                self.cap_don.id,
                self.local_don.id,
                message_id.clone(),
                payload.clone(),
            );
            if let Err(e) = self.dispatcher.send(*member, message) {
                warn!(peer = %member, message_id = %message_id, error = %e, "Failed to send request");
            }
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CapabilityError::Unavailable(format!(
                "{} closed",
                self.state.name()
            ))),
            Err(_) => {
                lock(&self.pending).remove(&message_id);
                Err(CapabilityError::Execution(format!(
                    "request {} timed out",
                    message_id
                )))
            }
        }
    }
}

impl Receiver for ExecutableClient {
    fn receive(&self, message: MessageBody) {
        if message.method != Method::Execute {
            debug!(method = ?message.method, "Client ignoring message");
            return;
        }
        if !self.cap_don.contains(&message.sender) {
            warn!(
                capability_id = %self.info.id,
                sender = %message.sender,
                "Response from non-member"
            );
            return;
        }
        self.on_response(message);
    }
}

#[async_trait]
impl Service for ExecutableClient {
    fn name(&self) -> String {
        self.state.name().to_string()
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.state.start_once(|| Ok(()))
    }

    async fn close(&self) -> Result<(), ServiceError> {
        self.state.stop_once(|| {
            lock(&self.pending).clear();
            Ok(())
        })
    }

    fn ready(&self) -> Result<(), ServiceError> {
        self.state.ready()
    }
}

impl ConsumerShim for ExecutableClient {
    fn instance(self: Arc<Self>) -> CapabilityInstance {
        CapabilityInstance::Executable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::LocalDispatcher;
    use capmesh_capabilities::{CapabilityType, RequestMetadata};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn don(id: u32, members: &[u8], f: u8) -> Don {
        Don {
            id,
            config_version: 1,
            members: members.iter().map(|n| peer(*n)).collect(),
            f,
            is_public: true,
            accepts_workflows: false,
        }
    }

    fn request(execution_id: &str) -> CapabilityRequest {
        CapabilityRequest {
            metadata: RequestMetadata {
                workflow_id: "wf-1".to_string(),
                workflow_execution_id: execution_id.to_string(),
                reference_id: "write".to_string(),
                ..Default::default()
            },
            config: json!({}),
            inputs: json!({ "report": "0xabc" }),
        }
    }

    fn client(timeout: Duration) -> (Arc<ExecutableClient>, mpsc::UnboundedReceiver<MessageBody>) {
        let cap_don = don(2, &[10, 11, 12], 1);
        let info = CapabilityInfo::new_remote("write@1.0.0", CapabilityType::Target, "write", &cap_don)
            .unwrap();
        let (dispatcher, out) = LocalDispatcher::new(peer(1));
        let client =
            ExecutableClient::new(info, don(1, &[1], 0), Arc::new(dispatcher), timeout).unwrap();
        (Arc::new(client), out)
    }

    fn reply(to: &MessageBody, from: u8, outcome: Result<serde_json::Value, &str>) -> MessageBody {
        let mut msg = MessageBody::new(
            Method::Execute,
            to.capability_id.clone(),
            to.capability_don_id,
            to.caller_don_id,
            to.message_id.clone(),
            vec![],
        );
        msg = match outcome {
            Ok(value) => {
                msg.payload = serde_json::to_vec(&CapabilityResponse { value }).unwrap();
                msg
            }
            Err(e) => msg.with_error(e),
        };
        msg.sender = peer(from);
        msg
    }

    #[test]
    fn test_requires_don() {
        let info = CapabilityInfo::new_local("write@1.0.0", CapabilityType::Target, "w").unwrap();
        let (dispatcher, _out) = LocalDispatcher::new(peer(1));
        assert!(ExecutableClient::new(info, don(1, &[1], 0), Arc::new(dispatcher), Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_resolves_on_matching_responses() {
        let (client, mut out) = client(Duration::from_secs(5));
        client.start().await.unwrap();

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move { caller.execute(request("exec-1")).await });

        let mut sent = vec![];
        while sent.len() < 3 {
            sent.push(out.recv().await.unwrap());
        }
        assert_eq!(sent[0].message_id, "wf-1/exec-1/write");

        client.receive(reply(&sent[0], 10, Ok(json!({ "tx": "a" }))));
        client.receive(reply(&sent[0], 11, Ok(json!({ "tx": "b" }))));
        client.receive(reply(&sent[0], 12, Ok(json!({ "tx": "a" }))));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.value, json!({ "tx": "a" }));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_matching_errors_fail_the_call() {
        let (client, mut out) = client(Duration::from_secs(5));
        client.start().await.unwrap();

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move { caller.execute(request("exec-2")).await });
        let first = out.recv().await.unwrap();

        client.receive(reply(&first, 10, Err("reverted")));
        client.receive(reply(&first, 11, Err("reverted")));

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CapabilityError::Execution(msg) if msg == "reverted"));
    }

    #[tokio::test]
    async fn test_times_out_without_quorum() {
        let (client, _out) = client(Duration::from_millis(50));
        client.start().await.unwrap();

        let err = client.execute(request("exec-3")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Execution(_)));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_rejects_missing_execution_id() {
        let (client, _out) = client(Duration::from_secs(1));
        client.start().await.unwrap();
        assert!(client.execute(request("")).await.is_err());
    }
}
