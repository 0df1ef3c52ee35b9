//! Executable server (producer side)

use crate::dispatcher::{Dispatcher, Receiver};
use crate::message::{MessageBody, Method};
use crate::shim::{lock, spawn_ticker};
use async_trait::async_trait;
use capmesh_capabilities::{
    CapabilityInfo, CapabilityRequest, Don, DonId, ExecutableCapability,
    RemoteExecutableConfig, Service, ServiceError, StateMachine,
};
use capmesh_p2p::PeerId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type RequestKey = (DonId, String);
type Reply = Result<Vec<u8>, String>;

struct ServerRequest {
    caller_don: Don,
    created: Instant,
    requesters: HashMap<PeerId, [u8; 32]>,
    executing: bool,
    reply: Option<Reply>,
}

struct ServerInner {
    config: RemoteExecutableConfig,
    peer_id: PeerId,
    underlying: Arc<dyn ExecutableCapability>,
    info: CapabilityInfo,
    cap_don: Don,
    workflow_dons: HashMap<DonId, Don>,
    dispatcher: Arc<dyn Dispatcher>,
    request_timeout: Duration,
    permits: Arc<Semaphore>,
    requests: Mutex<HashMap<RequestKey, ServerRequest>>,
    cancel: CancellationToken,
}

/// Exposes a local action or target to remote workflow DONs
///
/// A request runs once `F+1` members of the calling DON sent it with the same hash.
/// The local capability executes once per request and every requester, including
/// late ones, receives the same reply.
pub struct ExecutableServer {
    inner: Arc<ServerInner>,
    state: StateMachine,
    inbound_tx: mpsc::UnboundedSender<MessageBody>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<MessageBody>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutableServer {
    /// Create a server for `underlying`, hosted on `cap_don`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RemoteExecutableConfig,
        peer_id: PeerId,
        underlying: Arc<dyn ExecutableCapability>,
        info: CapabilityInfo,
        cap_don: Don,
        workflow_dons: HashMap<DonId, Don>,
        dispatcher: Arc<dyn Dispatcher>,
        request_timeout: Duration,
        max_parallel_requests: usize,
    ) -> Self {
        let name = format!("ExecutableServer({})", info.id);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ServerInner {
                config,
                peer_id,
                underlying,
                info,
                cap_don,
                workflow_dons,
                dispatcher,
                request_timeout,
                permits: Arc::new(Semaphore::new(max_parallel_requests.max(1))),
                requests: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
            state: StateMachine::new(name),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Effective configuration
    pub fn config(&self) -> &RemoteExecutableConfig {
        &self.inner.config
    }

    /// Requests currently tracked
    pub fn tracked_requests(&self) -> usize {
        lock(&self.inner.requests).len()
    }
}

impl ServerInner {
    fn handle(self: &Arc<Self>, message: MessageBody) {
        if message.method != Method::Execute {
            debug!(method = ?message.method, "Server ignoring message");
            return;
        }
        let Some(caller_don) = self.workflow_dons.get(&message.caller_don_id) else {
            warn!(
                capability_id = %self.info.id,
                caller_don_id = message.caller_don_id,
                "Request from unknown workflow DON"
            );
            return;
        };
        if !caller_don.contains(&message.sender) {
            warn!(capability_id = %self.info.id, sender = %message.sender, "Request from non-member");
            return;
        }

        let request: CapabilityRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(sender = %message.sender, error = %e, "Malformed execution request");
                return;
            }
        };
        let hash = match request_hash(&request, &self.config.request_hash_excluded_attributes) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(sender = %message.sender, error = %e, "Unhashable execution request");
                return;
            }
        };

        let key = (caller_don.id, message.message_id.clone());
        let mut requests = lock(&self.requests);
        let entry = requests.entry(key.clone()).or_insert_with(|| ServerRequest {
            caller_don: caller_don.clone(),
            created: Instant::now(),
            requesters: HashMap::new(),
            executing: false,
            reply: None,
        });
        entry.requesters.insert(message.sender, hash);

        if let Some(reply) = entry.reply.clone() {
            drop(requests);
            self.send_reply(caller_don, &key.1, message.sender, reply);
            return;
        }
        if entry.executing {
            return;
        }

        let matching = entry.requesters.values().filter(|h| **h == hash).count();
        if matching < caller_don.threshold() {
            return;
        }
        entry.executing = true;
        drop(requests);

        debug!(capability_id = %self.info.id, message_id = %key.1, "Request reached quorum");
        tokio::spawn(Arc::clone(self).execute(key, request));
    }

    async fn execute(self: Arc<Self>, key: RequestKey, request: CapabilityRequest) {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let reply: Reply = match self.underlying.execute(request).await {
            Ok(response) => serde_json::to_vec(&response).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        drop(permit);

        let recipients = {
            let mut requests = lock(&self.requests);
            let Some(entry) = requests.get_mut(&key) else {
                debug!(message_id = %key.1, "Request expired before completion");
                return;
            };
            entry.reply = Some(reply.clone());
            (entry.caller_don.clone(), entry.requesters.keys().copied().collect::<Vec<_>>())
        };

        let (caller_don, peers) = recipients;
        for peer in peers {
            self.send_reply(&caller_don, &key.1, peer, reply.clone());
        }
    }

    fn send_reply(&self, caller_don: &Don, message_id: &str, peer: PeerId, reply: Reply) {
        let message = MessageBody::new(
            Method::Execute,
            self.info.id.clone(),
            self.cap_don.id,
            caller_don.id,
            message_id,
            vec![],
        );
        let message = match reply {
            Ok(payload) => MessageBody { payload, ..message },
            Err(error) => message.with_error(error),
        };
        if let Err(e) = self.dispatcher.send(peer, message) {
            warn!(peer = %peer, message_id, error = %e, "Failed to send reply");
        }
    }

    fn expire_requests(&self) {
        let now = Instant::now();
        let expired: Vec<(RequestKey, ServerRequest)> = {
            let mut requests = lock(&self.requests);
            let keys: Vec<RequestKey> = requests
                .iter()
                .filter(|(_, r)| now.duration_since(r.created) > self.request_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| requests.remove(&k).map(|r| (k, r)))
                .collect()
        };

        for ((_, message_id), request) in expired {
            if request.reply.is_some() {
                continue;
            }
            debug!(node = %self.peer_id, message_id = %message_id, "Request expired");
            for peer in request.requesters.keys() {
                self.send_reply(
                    &request.caller_don,
                    &message_id,
                    *peer,
                    Err("request expired".to_string()),
                );
            }
        }
    }
}

/// Hash of a request with the excluded dotted input paths removed
pub fn request_hash(
    request: &CapabilityRequest,
    excluded_attributes: &[String],
) -> Result<[u8; 32], serde_json::Error> {
    let mut inputs = request.inputs.clone();
    for path in excluded_attributes {
        remove_path(&mut inputs, path);
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(&serde_json::to_vec(&request.metadata)?);
    hasher.update(&serde_json::to_vec(&request.config)?);
    hasher.update(&serde_json::to_vec(&inputs)?);
    Ok(*hasher.finalize().as_bytes())
}

fn remove_path(value: &mut Value, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut current = value;
    for segment in segments {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Value::Object(map) = current {
        map.remove(last);
    }
}

fn expiry_tick(timeout: Duration) -> Duration {
    (timeout / 10).max(Duration::from_millis(100))
}

impl Receiver for ExecutableServer {
    fn receive(&self, message: MessageBody) {
        if self.inbound_tx.send(message).is_err() {
            debug!(capability_id = %self.inner.info.id, "Server closed, dropping message");
        }
    }
}

#[async_trait]
impl Service for ExecutableServer {
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

            let expiry = spawn_ticker(
                self.inner.cancel.clone(),
                expiry_tick(self.inner.request_timeout),
                {
                    let inner = Arc::clone(&self.inner);
                    move || inner.expire_requests()
                },
            );
            lock(&self.tasks).extend([worker, expiry]);
            info!(capability_id = %self.inner.info.id, don_id = self.inner.cap_don.id, "Executable server started");
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), ServiceError> {
        self.state.stop_once(|| {
            self.inner.cancel.cancel();
            self.inner.permits.close();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::LocalDispatcher;
    use capmesh_capabilities::{
        BaseCapability, CapabilityError, CapabilityResponse, CapabilityType, RequestMetadata,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn don(id: DonId, members: &[u8], f: u8) -> Don {
        Don {
            id,
            config_version: 1,
            members: members.iter().map(|n| peer(*n)).collect(),
            f,
            is_public: true,
            accepts_workflows: true,
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl BaseCapability for Counter {
        fn info(&self) -> CapabilityInfo {
            CapabilityInfo::new_local("write@1.0.0", CapabilityType::Target, "write").unwrap()
        }
    }

    #[async_trait]
    impl ExecutableCapability for Counter {
        async fn execute(
            &self,
            request: CapabilityRequest,
        ) -> Result<CapabilityResponse, CapabilityError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CapabilityResponse {
                value: json!({ "calls": n, "echo": request.inputs }),
            })
        }
    }

    fn request(nonce: &str) -> CapabilityRequest {
        CapabilityRequest {
            metadata: RequestMetadata {
                workflow_id: "wf-1".to_string(),
                workflow_execution_id: "exec-1".to_string(),
                ..Default::default()
            },
            config: json!({}),
            inputs: json!({ "report": "0xabc", "meta": { "nonce": nonce } }),
        }
    }

    fn execute_from(sender: u8, request: &CapabilityRequest) -> MessageBody {
        let mut msg = MessageBody::new(
            Method::Execute,
            "write@1.0.0",
            2,
            1,
            "wf-1/exec-1/",
            serde_json::to_vec(request).unwrap(),
        );
        msg.sender = peer(sender);
        msg
    }

    fn server(
        excluded: Vec<String>,
        timeout: Duration,
    ) -> (ExecutableServer, Arc<Counter>, mpsc::UnboundedReceiver<MessageBody>) {
        let counter = Arc::new(Counter::default());
        let (dispatcher, out) = LocalDispatcher::new(peer(10));
        let server = ExecutableServer::new(
            RemoteExecutableConfig {
                request_hash_excluded_attributes: excluded,
            },
            peer(10),
            counter.clone(),
            counter.info(),
            don(2, &[10], 0),
            HashMap::from([(1, don(1, &[1, 2, 3, 4], 1))]),
            Arc::new(dispatcher),
            timeout,
            4,
        );
        (server, counter, out)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_request_hash_ignores_excluded_paths() {
        let excluded = vec!["meta.nonce".to_string()];
        let a = request_hash(&request("1"), &excluded).unwrap();
        let b = request_hash(&request("2"), &excluded).unwrap();
        assert_eq!(a, b);

        let c = request_hash(&request("1"), &[]).unwrap();
        let d = request_hash(&request("2"), &[]).unwrap();
        assert_ne!(c, d);
    }

    #[tokio::test]
    async fn test_executes_once_at_quorum_and_replies_to_all() {
        let (server, counter, mut out) =
            server(vec!["meta.nonce".to_string()], Duration::from_secs(30));
        server.start().await.unwrap();

        server.receive(execute_from(1, &request("a")));
        settle().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        server.receive(execute_from(2, &request("b")));
        settle().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        server.receive(execute_from(3, &request("c")));
        settle().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let mut replied = vec![];
        while let Ok(msg) = out.try_recv() {
            assert!(msg.error.is_none());
            replied.push(msg.receiver);
        }
        replied.sort();
        assert_eq!(replied, vec![peer(1), peer(2), peer(3)]);

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_requests_do_not_execute() {
        let (server, counter, _out) = server(vec![], Duration::from_secs(30));
        server.start().await.unwrap();

        server.receive(execute_from(1, &request("a")));
        server.receive(execute_from(2, &request("b")));
        settle().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_from_unknown_don_dropped() {
        let (server, _counter, _out) = server(vec![], Duration::from_secs(30));
        server.start().await.unwrap();

        let mut msg = execute_from(1, &request("a"));
        msg.caller_don_id = 7;
        server.receive(msg);
        settle().await;
        assert_eq!(server.tracked_requests(), 0);

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_requests_expire_with_error() {
        let (server, _counter, mut out) = server(vec![], Duration::from_millis(100));
        server.start().await.unwrap();

        server.receive(execute_from(1, &request("a")));
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(server.tracked_requests(), 0);
        let expired = out.try_recv().unwrap();
        assert_eq!(expired.receiver, peer(1));
        assert_eq!(expired.error.as_deref(), Some("request expired"));

        server.close().await.unwrap();
    }
}
