//! Launcher integration tests
//!
//! Drive `Launcher::launch` with synthetic directory snapshots against the real
//! registry, dispatcher and connection table.

use async_trait::async_trait;
use capmesh_capabilities::{
    BaseCapability, CapabilityConfiguration, CapabilityError, CapabilityInfo,
    CapabilityInstance, CapabilityRequest, CapabilityResponse, CapabilityType,
    DirectorySnapshot, Don, DonEntry, DonId, ExecutableCapability, NodeInfo, Registry,
    RemoteTargetConfig, RequestMetadata, TriggerCapability, TriggerRegistrationRequest,
    TriggerResponse,
};
use capmesh_launcher::{DonNotifier, LaunchError, Launcher, LauncherConfig};
use capmesh_p2p::{ConnectionTable, PeerConnections, PeerId, StreamConfig};
use capmesh_remote::{LocalDispatcher, MessageBody};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const ME: u8 = 1;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn peer(n: u8) -> PeerId {
    PeerId::from_bytes([n; 32])
}

fn don(id: DonId, members: &[u8], f: u8, is_public: bool, accepts_workflows: bool) -> Don {
    Don {
        id,
        config_version: 1,
        members: members.iter().map(|n| peer(*n)).collect(),
        f,
        is_public,
        accepts_workflows,
    }
}

fn node(n: u8) -> NodeInfo {
    let mut signer = [0u8; 32];
    signer[..20].copy_from_slice(&[n; 20]);
    NodeInfo {
        peer_id: peer(n),
        signer,
        encryption_public_key: [n; 32],
        node_operator_id: n as u32,
        workflow_don_id: None,
        capabilities_don_ids: vec![],
    }
}

fn blob() -> Vec<u8> {
    CapabilityConfiguration::default().encode_to_vec()
}

struct Echo {
    id: &'static str,
    capability_type: CapabilityType,
}

impl BaseCapability for Echo {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo::new_local(self.id, self.capability_type, "echo").unwrap()
    }
}

#[async_trait]
impl ExecutableCapability for Echo {
    async fn execute(
        &self,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        Ok(CapabilityResponse {
            value: json!({ "echo": request.inputs }),
        })
    }
}

fn local(id: &'static str, capability_type: CapabilityType) -> CapabilityInstance {
    CapabilityInstance::Executable(Arc::new(Echo {
        id,
        capability_type,
    }))
}

/// Local trigger that holds every subscription open
#[derive(Default)]
struct Beacon {
    subscribers: Mutex<Vec<mpsc::Sender<TriggerResponse>>>,
}

impl BaseCapability for Beacon {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo::new_local("beacon-trigger@1.0.0", CapabilityType::Trigger, "beacon").unwrap()
    }
}

#[async_trait]
impl TriggerCapability for Beacon {
    async fn register_trigger(
        &self,
        _request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>, CapabilityError> {
        let (tx, rx) = mpsc::channel(8);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn unregister_trigger(
        &self,
        _request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }
}

struct Node {
    launcher: Launcher,
    registry: Arc<Registry>,
    dispatcher: Arc<LocalDispatcher>,
    connections: Arc<ConnectionTable>,
    notifier: Arc<DonNotifier>,
    outbound: mpsc::UnboundedReceiver<MessageBody>,
}

fn node_for(me: u8) -> Node {
    let connections = Arc::new(ConnectionTable::new(peer(me)));
    let (dispatcher, outbound) = LocalDispatcher::new(peer(me));
    let dispatcher = Arc::new(dispatcher);
    let registry = Arc::new(Registry::new());
    let notifier = Arc::new(DonNotifier::new());
    let launcher = Launcher::new(
        connections.clone(),
        dispatcher.clone(),
        registry.clone(),
        notifier.clone(),
        LauncherConfig::default(),
    );
    Node {
        launcher,
        registry,
        dispatcher,
        connections,
        notifier,
        outbound,
    }
}

/// Workflow DON 1 containing this node, capability DON 2 hosting four capabilities
fn consumer_snapshot() -> DirectorySnapshot {
    DirectorySnapshot::new()
        .with_don(DonEntry::new(don(1, &[ME, 2, 3, 4], 1, false, true)))
        .with_don(
            DonEntry::new(don(2, &[10, 11, 12, 13], 1, true, false))
                .with_capability("cron-trigger@1.0.0", blob())
                .with_capability("write-target@1.0.0", blob())
                .with_capability("streams-trigger@1.0.0", blob())
                .with_capability("offchain-reporting@1.0.0", blob()),
        )
        .with_capability("cron-trigger@1.0.0", CapabilityType::Trigger)
        .with_capability("write-target@1.0.0", CapabilityType::Target)
        .with_capability("streams-trigger@1.0.0", CapabilityType::Trigger)
        .with_capability("offchain-reporting@1.0.0", CapabilityType::Consensus)
        .with_node(node(10))
        .with_node(node(11))
        .with_node(node(12))
        .with_node(node(13))
}

#[tokio::test]
async fn test_installs_consumer_shims() {
    init_tracing();
    let node = node_for(ME);
    node.launcher
        .launch(Arc::new(consumer_snapshot()))
        .await
        .unwrap();

    let ids: Vec<String> = node.registry.list().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(
        ids,
        vec!["cron-trigger@1.0.0", "streams-trigger@1.0.0", "write-target@1.0.0"]
    );
    assert!(node.dispatcher.has_receiver("write-target@1.0.0", 2));
    assert!(!node.dispatcher.has_receiver("offchain-reporting@1.0.0", 2));
    assert_eq!(node.launcher.sub_service_count().await, 3);
    assert_eq!(node.notifier.current().map(|d| d.id), Some(1));

    let write = node.registry.get("write-target@1.0.0").unwrap();
    assert!(write.as_executable().is_some());
    assert!(!write.info().is_local);
    assert_eq!(write.info().don.map(|d| d.id), Some(2));
}

#[tokio::test]
async fn test_launch_is_idempotent() {
    let node = node_for(ME);
    let snapshot = Arc::new(consumer_snapshot());

    node.launcher.launch(snapshot.clone()).await.unwrap();
    let names = node.launcher.sub_service_names().await;
    node.launcher.launch(snapshot).await.unwrap();

    assert_eq!(node.launcher.sub_service_names().await, names);
    assert_eq!(node.registry.len(), 3);
    assert_eq!(node.dispatcher.route_count(), 3);
    assert_eq!(node.connections.update_count(), 2);
    assert!(node.connections.last_delta().is_empty());
}

#[tokio::test]
async fn test_launch_order_is_deterministic() {
    let snapshot = DirectorySnapshot::new()
        .with_don(DonEntry::new(don(9, &[ME], 0, false, true)))
        .with_don(
            DonEntry::new(don(5, &[20, 21], 0, true, false))
                .with_capability("b-target@1.0.0", blob())
                .with_capability("a-target@1.0.0", blob()),
        )
        .with_don(
            DonEntry::new(don(3, &[30], 0, true, false)).with_capability("c-action@1.0.0", blob()),
        )
        .with_capability("a-target@1.0.0", CapabilityType::Target)
        .with_capability("b-target@1.0.0", CapabilityType::Target)
        .with_capability("c-action@1.0.0", CapabilityType::Action);
    let snapshot = Arc::new(snapshot);

    let first = node_for(ME);
    let second = node_for(ME);
    first.launcher.launch(snapshot.clone()).await.unwrap();
    second.launcher.launch(snapshot).await.unwrap();

    let names = first.launcher.sub_service_names().await;
    assert_eq!(
        names,
        vec![
            "ExecutableClient(c-action@1.0.0)",
            "ExecutableClient(a-target@1.0.0)",
            "ExecutableClient(b-target@1.0.0)",
        ]
    );
    assert_eq!(second.launcher.sub_service_names().await, names);
}

#[tokio::test]
async fn test_two_workflow_dons_violate_invariant() {
    let snapshot = consumer_snapshot().with_don(DonEntry::new(don(3, &[ME, 5], 0, true, true)));
    let node = node_for(ME);

    let snapshot = Arc::new(snapshot);

    let err = node.launcher.launch(snapshot.clone()).await.unwrap_err();

    assert!(matches!(err, LaunchError::InvariantViolation(_)));
    let recorded = node.launcher.snapshot().await.unwrap();
    assert!(Arc::ptr_eq(&recorded, &snapshot));
    assert!(node.registry.is_empty());
    assert_eq!(node.dispatcher.route_count(), 0);
    assert_eq!(node.launcher.sub_service_count().await, 0);
    assert!(node.notifier.current().is_none());
}

#[tokio::test]
async fn test_connects_to_union_of_public_members() {
    let snapshot = DirectorySnapshot::new()
        .with_don(DonEntry::new(don(1, &[1, 2], 0, true, false)))
        .with_don(DonEntry::new(don(2, &[2, 3], 0, true, false)))
        .with_don(DonEntry::new(don(3, &[7], 0, false, false)));
    let node = node_for(9);

    node.launcher.launch(Arc::new(snapshot)).await.unwrap();

    assert_eq!(node.connections.connection_count(), 3);
    for n in [1, 2, 3] {
        assert_eq!(
            node.connections.stream_config(&peer(n)),
            Some(StreamConfig::default())
        );
    }
    assert!(!node.connections.is_connected(&peer(7)));
}

#[tokio::test]
async fn test_consumption_stops_at_first_failure() {
    let snapshot = DirectorySnapshot::new()
        .with_don(DonEntry::new(don(1, &[ME], 0, false, true)))
        .with_don(
            DonEntry::new(don(2, &[10], 0, true, false))
                .with_capability("a-target@1.0.0", blob())
                .with_capability("b-missing@1.0.0", blob())
                .with_capability("c-target@1.0.0", blob()),
        )
        .with_capability("a-target@1.0.0", CapabilityType::Target)
        .with_capability("c-target@1.0.0", CapabilityType::Target);
    let node = node_for(ME);

    let err = node.launcher.launch(Arc::new(snapshot)).await.unwrap_err();

    assert!(matches!(
        err,
        LaunchError::CapabilityNotFound { ref capability_id } if capability_id == "b-missing@1.0.0"
    ));
    assert!(node.registry.get("a-target@1.0.0").is_ok());
    assert!(node.registry.get("c-target@1.0.0").is_err());
    assert_eq!(node.launcher.sub_service_count().await, 1);
}

#[tokio::test]
async fn test_undecodable_config_is_fatal() {
    let snapshot = DirectorySnapshot::new()
        .with_don(DonEntry::new(don(1, &[ME], 0, false, true)))
        .with_don(
            DonEntry::new(don(2, &[10], 0, true, false))
                .with_capability("a-target@1.0.0", vec![0xff, 0xff, 0xff]),
        )
        .with_capability("a-target@1.0.0", CapabilityType::Target);
    let node = node_for(ME);

    let err = node.launcher.launch(Arc::new(snapshot)).await.unwrap_err();
    assert!(matches!(err, LaunchError::ConfigDecode { .. }));
}

#[tokio::test]
async fn test_streams_trigger_requires_known_signers() {
    let mut snapshot = consumer_snapshot();
    snapshot.nodes.remove(&peer(12));
    let node = node_for(ME);

    let err = node.launcher.launch(Arc::new(snapshot)).await.unwrap_err();
    assert!(matches!(err, LaunchError::SignerNotFound { don_id: 2, .. }));
}

#[tokio::test]
async fn test_unsupported_streams_version_is_fatal() {
    let snapshot = DirectorySnapshot::new()
        .with_don(DonEntry::new(don(1, &[ME], 0, false, true)))
        .with_don(
            DonEntry::new(don(2, &[10], 0, true, false))
                .with_capability("streams-trigger@3.0.0", blob()),
        )
        .with_capability("streams-trigger@3.0.0", CapabilityType::Trigger)
        .with_node(node(10));
    let node = node_for(ME);

    let err = node.launcher.launch(Arc::new(snapshot)).await.unwrap_err();
    assert!(matches!(err, LaunchError::UnsupportedStreamTrigger { .. }));
}

#[tokio::test]
async fn test_local_capability_shadows_remote() {
    let node = node_for(ME);
    node.registry
        .add(local("write-target@1.0.0", CapabilityType::Target))
        .unwrap();

    node.launcher
        .launch(Arc::new(consumer_snapshot()))
        .await
        .unwrap();

    assert!(node.registry.get("write-target@1.0.0").unwrap().info().is_local);
    assert!(!node.dispatcher.has_receiver("write-target@1.0.0", 2));
    assert_eq!(node.launcher.sub_service_count().await, 2);
}

/// Capability DON 3 containing this node, remote workflow DON 1
fn producer_snapshot() -> DirectorySnapshot {
    let config = CapabilityConfiguration {
        remote_target_config: Some(RemoteTargetConfig {
            request_hash_excluded_attributes: vec!["signed_report.signatures".to_string()],
        }),
        ..Default::default()
    };
    DirectorySnapshot::new()
        .with_don(DonEntry::new(don(1, &[2, 3, 4, 5], 1, false, true)))
        .with_don(
            DonEntry::new(don(3, &[ME, 6], 0, true, false))
                .with_capability("mismatched@1.0.0", blob())
                .with_capability("not-local@1.0.0", blob())
                .with_capability("write-target@1.0.0", config.encode_to_vec())
                .with_capability("ocr@1.0.0", blob()),
        )
        .with_capability("mismatched@1.0.0", CapabilityType::Trigger)
        .with_capability("not-local@1.0.0", CapabilityType::Action)
        .with_capability("write-target@1.0.0", CapabilityType::Target)
        .with_capability("ocr@1.0.0", CapabilityType::Consensus)
}

#[tokio::test]
async fn test_exposure_skips_broken_capabilities() {
    init_tracing();
    let node = node_for(ME);
    node.registry
        .add(local("mismatched@1.0.0", CapabilityType::Action))
        .unwrap();
    node.registry
        .add(local("write-target@1.0.0", CapabilityType::Target))
        .unwrap();

    node.launcher
        .launch(Arc::new(producer_snapshot()))
        .await
        .unwrap();

    assert!(node.dispatcher.has_receiver("write-target@1.0.0", 3));
    assert!(!node.dispatcher.has_receiver("mismatched@1.0.0", 3));
    assert!(!node.dispatcher.has_receiver("not-local@1.0.0", 3));
    assert!(!node.dispatcher.has_receiver("ocr@1.0.0", 3));
    assert_eq!(
        node.launcher.sub_service_names().await,
        vec!["ExecutableServer(write-target@1.0.0)"]
    );
    assert!(node.notifier.current().is_none());

    node.launcher
        .launch(Arc::new(producer_snapshot()))
        .await
        .unwrap();
    assert_eq!(node.launcher.sub_service_count().await, 1);
}

#[tokio::test]
async fn test_exposes_local_trigger() {
    let snapshot = DirectorySnapshot::new()
        .with_don(DonEntry::new(don(1, &[2, 3, 4, 5], 1, false, true)))
        .with_don(
            DonEntry::new(don(3, &[ME, 6], 0, true, false))
                .with_capability("beacon-trigger@1.0.0", blob()),
        )
        .with_capability("beacon-trigger@1.0.0", CapabilityType::Trigger);
    let node = node_for(ME);
    node.registry
        .add(CapabilityInstance::Trigger(Arc::new(Beacon::default())))
        .unwrap();

    node.launcher.launch(Arc::new(snapshot)).await.unwrap();

    assert!(node.dispatcher.has_receiver("beacon-trigger@1.0.0", 3));
    assert_eq!(
        node.launcher.sub_service_names().await,
        vec!["TriggerPublisher(beacon-trigger@1.0.0)"]
    );
    assert!(node.registry.get("beacon-trigger@1.0.0").unwrap().info().is_local);

    node.launcher.close().await.unwrap();
}

#[tokio::test]
async fn test_consumes_and_exposes_in_one_pass() {
    init_tracing();
    let snapshot = DirectorySnapshot::new()
        .with_don(DonEntry::new(don(1, &[ME, 2], 0, false, true)))
        .with_don(
            DonEntry::new(don(2, &[10, 11], 0, true, false))
                .with_capability("cron-trigger@1.0.0", blob()),
        )
        .with_don(
            DonEntry::new(don(3, &[ME, 6], 0, true, false))
                .with_capability("write-target@1.0.0", blob()),
        )
        .with_don(DonEntry::new(don(4, &[20, 21], 0, true, true)))
        .with_capability("cron-trigger@1.0.0", CapabilityType::Trigger)
        .with_capability("write-target@1.0.0", CapabilityType::Target);
    let node = node_for(ME);
    node.registry
        .add(local("write-target@1.0.0", CapabilityType::Target))
        .unwrap();

    node.launcher.launch(Arc::new(snapshot)).await.unwrap();

    assert_eq!(node.notifier.current().map(|d| d.id), Some(1));
    assert!(node.dispatcher.has_receiver("cron-trigger@1.0.0", 2));
    assert!(node.dispatcher.has_receiver("write-target@1.0.0", 3));
    assert!(!node.registry.get("cron-trigger@1.0.0").unwrap().info().is_local);
    assert_eq!(
        node.launcher.sub_service_names().await,
        vec![
            "TriggerSubscriber(cron-trigger@1.0.0)",
            "ExecutableServer(write-target@1.0.0)",
        ]
    );
    for n in [6, 10, 11, 20, 21] {
        assert!(node.connections.is_connected(&peer(n)), "peer {}", n);
    }
    assert!(!node.connections.is_connected(&peer(2)));

    node.launcher.close().await.unwrap();
}

#[tokio::test]
async fn test_close_stops_shims_and_drops_connections() {
    let node = node_for(ME);
    node.launcher
        .launch(Arc::new(consumer_snapshot()))
        .await
        .unwrap();
    assert!(node.connections.connection_count() > 0);

    node.launcher.close().await.unwrap();

    assert_eq!(node.launcher.sub_service_count().await, 0);
    assert_eq!(node.connections.connection_count(), 0);
    assert_eq!(node.connections.update_count(), 2);
}

#[tokio::test]
async fn test_remote_execution_end_to_end() {
    init_tracing();
    let snapshot = Arc::new(
        DirectorySnapshot::new()
            .with_don(DonEntry::new(don(1, &[1], 0, true, true)))
            .with_don(DonEntry::new(don(2, &[2], 0, true, false)).with_capability("echo@1.0.0", blob()))
            .with_capability("echo@1.0.0", CapabilityType::Action),
    );

    let mut workflow_node = node_for(1);
    let mut capability_node = node_for(2);
    capability_node
        .registry
        .add(local("echo@1.0.0", CapabilityType::Action))
        .unwrap();

    workflow_node.launcher.launch(snapshot.clone()).await.unwrap();
    capability_node.launcher.launch(snapshot).await.unwrap();

    let a_dispatcher = workflow_node.dispatcher.clone();
    let b_dispatcher = capability_node.dispatcher.clone();
    let mut a_out = std::mem::replace(&mut workflow_node.outbound, mpsc::unbounded_channel().1);
    let mut b_out = std::mem::replace(&mut capability_node.outbound, mpsc::unbounded_channel().1);
    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = a_out.recv() => { let _ = b_dispatcher.dispatch(msg); }
                Some(msg) = b_out.recv() => { let _ = a_dispatcher.dispatch(msg); }
                else => break,
            }
        }
    });

    let client = workflow_node
        .registry
        .get("echo@1.0.0")
        .unwrap()
        .as_executable()
        .unwrap();
    let request = CapabilityRequest {
        metadata: RequestMetadata {
            workflow_id: "wf-1".to_string(),
            workflow_execution_id: "exec-1".to_string(),
            reference_id: "step-1".to_string(),
            workflow_don_id: 1,
            ..Default::default()
        },
        config: json!({}),
        inputs: json!({ "value": 42 }),
    };

    let response = tokio::time::timeout(Duration::from_secs(5), client.execute(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.value, json!({ "echo": { "value": 42 } }));

    workflow_node.launcher.close().await.unwrap();
    capability_node.launcher.close().await.unwrap();
    pump.abort();
}
