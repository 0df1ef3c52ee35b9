//! Capability Topology Launcher
//!
//! Reconciles the node's remote capability wiring against a directory snapshot:
//!
//! 1. Install the snapshot in the registry
//! 2. Converge peer connections onto every member of every public DON
//! 3. Classify DONs relative to this node
//! 4. As a workflow DON member, install consumer shims for remote capabilities
//! 5. As a capability DON member, expose local capabilities through producer shims
//!
//! Wiring is idempotent: the registry and dispatcher report `AlreadyPresent` for work
//! done by an earlier pass. Shims are only ever added; a DON that disappears from a
//! later snapshot keeps its shims until [`Launcher::close`].

use crate::aggregator::build_aggregator;
use crate::config::LauncherConfig;
use crate::error::{LaunchError, LaunchResult};
use crate::notifier::WorkflowDonNotifier;
use crate::topology::{classify, desired_connections};
use async_trait::async_trait;
use capmesh_capabilities::{
    CapabilityConfiguration, CapabilityDescriptor, CapabilityInfo, CapabilityInstance,
    CapabilityType, DirectorySnapshot, Don, DonEntry, DonId, Registration, Registry,
    RemoteExecutableConfig, Service, ServiceError,
};
use capmesh_p2p::{PeerConnections, PeerId};
use capmesh_remote::{
    CapabilityShim, ConsumerShim, Dispatcher, ExecutableClient, ExecutableServer,
    TriggerPublisher, TriggerSubscriber,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Name reported by the launcher's lifecycle checks
pub const LAUNCHER_NAME: &str = "CapabilitiesLauncher";

/// Reconciliation state carried across launches
#[derive(Default)]
pub struct LauncherState {
    /// Snapshot of the latest launch
    pub snapshot: Option<Arc<DirectorySnapshot>>,
    /// Started shims in start order; appended to by launches, drained by close
    pub sub_services: Vec<Arc<dyn Service>>,
}

/// Capability topology launcher
pub struct Launcher {
    peers: Arc<dyn PeerConnections>,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<Registry>,
    notifier: Arc<dyn WorkflowDonNotifier>,
    config: LauncherConfig,
    state: Mutex<LauncherState>,
}

impl Launcher {
    /// Create a launcher
    pub fn new(
        peers: Arc<dyn PeerConnections>,
        dispatcher: Arc<dyn Dispatcher>,
        registry: Arc<Registry>,
        notifier: Arc<dyn WorkflowDonNotifier>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            peers,
            dispatcher,
            registry,
            notifier,
            config,
            state: Mutex::new(LauncherState::default()),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Snapshot of the latest launch, including one that failed
    pub async fn snapshot(&self) -> Option<Arc<DirectorySnapshot>> {
        self.state.lock().await.snapshot.clone()
    }

    /// Number of started shims awaiting shutdown
    pub async fn sub_service_count(&self) -> usize {
        self.state.lock().await.sub_services.len()
    }

    /// Names of started shims, in start order
    pub async fn sub_service_names(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .sub_services
            .iter()
            .map(|s| s.name())
            .collect()
    }

    /// Reconcile against `snapshot`
    ///
    /// Launches are serialized. A failure leaves shims installed so far running; a
    /// later launch with a corrected snapshot completes the wiring.
    pub async fn launch(&self, snapshot: Arc<DirectorySnapshot>) -> LaunchResult<()> {
        let mut state = self.state.lock().await;
        debug!(dons = snapshot.dons.len(), "{} triggered", LAUNCHER_NAME);

        self.registry.set_snapshot(Arc::clone(&snapshot));
        state.snapshot = Some(Arc::clone(&snapshot));

        let connections = desired_connections(&snapshot, self.config.stream);
        debug!(peers = connections.len(), "Updating peer connections");
        self.peers.update_connections(connections)?;

        let my_id = self.peers.my_id();
        let classification = classify(&snapshot, &my_id);

        if classification.my_workflow_dons.len() > 1 {
            let ids: Vec<DonId> = classification.my_workflow_dons.iter().map(|d| d.id).collect();
            return Err(LaunchError::InvariantViolation(format!(
                "node is part of more than one workflow DON: {:?}",
                ids
            )));
        }

        if let Some(my_workflow_don) = classification.my_workflow_dons.first() {
            debug!(don_id = my_workflow_don.id, "Notifying workflow DON set");
            self.notifier.notify_don_set(my_workflow_don.clone());

            for remote_don in &classification.remote_capability_dons {
                self.add_remote_capabilities(&mut state, my_workflow_don, remote_don, &snapshot)
                    .await?;
            }
        }

        for my_don in &classification.my_capability_dons {
            self.expose_capabilities(
                &mut state,
                my_id,
                my_don,
                &snapshot,
                &classification.remote_workflow_dons,
            )
            .await?;
        }

        Ok(())
    }

    /// Install consumer shims for every capability hosted by `remote_don`
    ///
    /// Stops at the first failure.
    async fn add_remote_capabilities(
        &self,
        state: &mut LauncherState,
        my_don: &Don,
        remote_don: &DonEntry,
        snapshot: &DirectorySnapshot,
    ) -> LaunchResult<()> {
        for (capability_id, blob) in &remote_don.capability_configurations {
            let (descriptor, config) = resolve(snapshot, capability_id, blob)?;

            match descriptor.capability_type {
                CapabilityType::Trigger => {
                    let aggregator = build_aggregator(
                        capability_id,
                        &self.config.stream_trigger_prefix,
                        &remote_don.don,
                        snapshot,
                        self.config.signed_report_max_age(),
                    )?;
                    let trigger_config = config.remote_trigger_config.unwrap_or_default();
                    let remote = remote_don.don.clone();
                    let local = my_don.clone();
                    let dispatcher = Arc::clone(&self.dispatcher);

                    self.add_to_registry_and_set_dispatcher(state, descriptor, &remote_don.don, |info| {
                        Ok(Arc::new(TriggerSubscriber::new(
                            trigger_config,
                            info,
                            remote,
                            local,
                            dispatcher,
                            aggregator,
                        )))
                    })
                    .await?;
                }
                CapabilityType::Action | CapabilityType::Target => {
                    let local = my_don.clone();
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let timeout = self.config.request_timeout();

                    self.add_to_registry_and_set_dispatcher(state, descriptor, &remote_don.don, |info| {
                        Ok(Arc::new(ExecutableClient::new(info, local, dispatcher, timeout)?))
                    })
                    .await?;
                }
                CapabilityType::Consensus => {
                    debug!(capability_id = %capability_id, "Remote consensus capabilities are not supported");
                }
                CapabilityType::Unknown(code) => {
                    warn!(capability_id = %capability_id, code, "Unknown capability type, skipping");
                }
            }
        }
        Ok(())
    }

    /// Install producer shims for every capability hosted by `my_don`
    ///
    /// Resolution failures abort; per-capability wiring failures are logged and skipped.
    async fn expose_capabilities(
        &self,
        state: &mut LauncherState,
        my_id: PeerId,
        my_don: &DonEntry,
        snapshot: &DirectorySnapshot,
        remote_workflow_dons: &[Don],
    ) -> LaunchResult<()> {
        let workflow_dons: HashMap<DonId, Don> = remote_workflow_dons
            .iter()
            .map(|d| (d.id, d.clone()))
            .collect();

        for (capability_id, blob) in &my_don.capability_configurations {
            let (descriptor, config) = resolve(snapshot, capability_id, blob)?;

            let result = match descriptor.capability_type {
                CapabilityType::Trigger => {
                    let trigger_config = config.remote_trigger_config.unwrap_or_default();
                    let don = my_don.don.clone();
                    let audience = workflow_dons.clone();
                    let dispatcher = Arc::clone(&self.dispatcher);

                    self.add_receiver(state, descriptor, &my_don.don, |underlying, info| {
                        let trigger = underlying.as_trigger().ok_or_else(|| {
                            LaunchError::InterfaceMismatch {
                                capability_id: info.id.clone(),
                                capability_type: info.capability_type,
                            }
                        })?;
                        Ok(Arc::new(TriggerPublisher::new(
                            trigger_config,
                            trigger,
                            info,
                            don,
                            audience,
                            dispatcher,
                        )))
                    })
                    .await
                }
                CapabilityType::Action | CapabilityType::Target => {
                    let server_config = config
                        .remote_target_config
                        .as_ref()
                        .map(RemoteExecutableConfig::from)
                        .unwrap_or_default();
                    let don = my_don.don.clone();
                    let audience = workflow_dons.clone();
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let timeout = self.config.request_timeout();
                    let max_parallel = self.config.max_parallel_requests;

                    self.add_receiver(state, descriptor, &my_don.don, |underlying, info| {
                        let executable = underlying.as_executable().ok_or_else(|| {
                            LaunchError::InterfaceMismatch {
                                capability_id: info.id.clone(),
                                capability_type: info.capability_type,
                            }
                        })?;
                        Ok(Arc::new(ExecutableServer::new(
                            server_config,
                            my_id,
                            executable,
                            info,
                            don,
                            audience,
                            dispatcher,
                            timeout,
                            max_parallel,
                        )))
                    })
                    .await
                }
                CapabilityType::Consensus => {
                    warn!(capability_id = %capability_id, "No remote server for consensus capabilities, skipping");
                    continue;
                }
                CapabilityType::Unknown(code) => {
                    warn!(capability_id = %capability_id, code, "Unknown capability type, skipping");
                    continue;
                }
            };

            if let Err(e) = result {
                error!(
                    capability_id = %capability_id,
                    don_id = my_don.don.id,
                    error = %e,
                    "Failed to expose capability, it won't be reachable remotely"
                );
            }
        }
        Ok(())
    }

    /// Register a consumer shim, route its messages and start it
    ///
    /// An ID already in the registry (a local capability or an earlier pass) leaves
    /// everything untouched.
    async fn add_to_registry_and_set_dispatcher<S, F>(
        &self,
        state: &mut LauncherState,
        descriptor: &CapabilityDescriptor,
        don: &Don,
        construct: F,
    ) -> LaunchResult<Registration>
    where
        S: ConsumerShim,
        F: FnOnce(CapabilityInfo) -> LaunchResult<Arc<S>>,
    {
        let info = remote_info(descriptor, don)?;
        debug!(capability_id = %info.id, don_id = don.id, "Adding remote capability to registry");
        let shim = construct(info)?;

        if self.registry.add(Arc::clone(&shim).instance())? == Registration::AlreadyPresent {
            debug!(capability_id = %descriptor.id, "Capability already registered");
            return Ok(Registration::AlreadyPresent);
        }

        self.dispatcher
            .set_receiver(&descriptor.id, don.id, Arc::clone(&shim).into_receiver())?;
        debug!(capability_id = %descriptor.id, don_id = don.id, "Receiver set for capability");

        shim.start().await.map_err(|source| LaunchError::StartFailed {
            name: shim.name(),
            source,
        })?;
        info!(capability_id = %descriptor.id, don_id = don.id, "Remote capability installed");
        state.sub_services.push(shim.into_service());
        Ok(Registration::Added)
    }

    /// Route a producer shim wrapping the local instance of `descriptor` and start it
    ///
    /// An existing route means an earlier pass did the work.
    async fn add_receiver<S, F>(
        &self,
        state: &mut LauncherState,
        descriptor: &CapabilityDescriptor,
        don: &Don,
        construct: F,
    ) -> LaunchResult<Registration>
    where
        S: CapabilityShim,
        F: FnOnce(CapabilityInstance, CapabilityInfo) -> LaunchResult<Arc<S>>,
    {
        let info = remote_info(descriptor, don)?;
        let underlying = self.registry.get(&descriptor.id).map_err(|source| {
            LaunchError::LocalCapabilityMissing {
                capability_id: descriptor.id.clone(),
                source,
            }
        })?;
        let shim = construct(underlying, info)?;

        debug!(capability_id = %descriptor.id, don_id = don.id, "Enabling external access for capability");
        let registration = self.dispatcher.set_receiver(
            &descriptor.id,
            don.id,
            Arc::clone(&shim).into_receiver(),
        )?;
        if registration == Registration::AlreadyPresent {
            debug!(capability_id = %descriptor.id, don_id = don.id, "Receiver already exists");
            return Ok(Registration::AlreadyPresent);
        }

        if let Err(source) = shim.start().await {
            self.dispatcher.remove_receiver(&descriptor.id, don.id);
            return Err(LaunchError::StartFailed {
                name: shim.name(),
                source,
            });
        }
        info!(capability_id = %descriptor.id, don_id = don.id, "Capability exposed");
        state.sub_services.push(shim.into_service());
        Ok(Registration::Added)
    }

    /// Stop every started shim, then drop all peer connections
    ///
    /// Shim failures are logged; the connection reset always runs.
    pub async fn close(&self) -> LaunchResult<()> {
        let services: Vec<Arc<dyn Service>> = {
            let mut state = self.state.lock().await;
            state.sub_services.drain(..).collect()
        };

        for service in services {
            if let Err(e) = service.close().await {
                error!(name = %service.name(), error = %e, "Failed to close a sub-service");
            }
        }

        self.peers.update_connections(HashMap::new())?;
        Ok(())
    }
}

#[async_trait]
impl Service for Launcher {
    fn name(&self) -> String {
        LAUNCHER_NAME.to_string()
    }

    async fn start(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ServiceError> {
        Launcher::close(self).await.map_err(|e| ServiceError::Failed {
            name: LAUNCHER_NAME.to_string(),
            reason: e.to_string(),
        })
    }
}

fn resolve<'a>(
    snapshot: &'a DirectorySnapshot,
    capability_id: &str,
    blob: &[u8],
) -> LaunchResult<(&'a CapabilityDescriptor, CapabilityConfiguration)> {
    let descriptor = snapshot
        .capabilities
        .get(capability_id)
        .ok_or_else(|| LaunchError::CapabilityNotFound {
            capability_id: capability_id.to_string(),
        })?;
    let config =
        CapabilityConfiguration::decode(blob).map_err(|source| LaunchError::ConfigDecode {
            capability_id: capability_id.to_string(),
            source,
        })?;
    Ok((descriptor, config))
}

fn remote_info(descriptor: &CapabilityDescriptor, don: &Don) -> LaunchResult<CapabilityInfo> {
    Ok(CapabilityInfo::new_remote(
        descriptor.id.clone(),
        descriptor.capability_type,
        format!("Remote Capability for {}", descriptor.id),
        don,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::DonNotifier;
    use capmesh_p2p::ConnectionTable;
    use capmesh_capabilities::{
        BaseCapability, CapabilityError, CapabilityRequest, CapabilityResponse,
        ExecutableCapability,
    };
    use capmesh_remote::{LocalDispatcher, MessageBody, Receiver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        name: &'static str,
        fail: bool,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Service for Tracked {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn start(&self) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), ServiceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServiceError::Failed {
                    name: self.name.to_string(),
                    reason: "stuck".to_string(),
                });
            }
            Ok(())
        }
    }

    fn tracked(name: &'static str, fail: bool) -> Arc<Tracked> {
        Arc::new(Tracked {
            name,
            fail,
            closes: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_close_survives_failing_shim() {
        let me = PeerId::from_bytes([1; 32]);
        let peers = Arc::new(ConnectionTable::new(me));
        let (dispatcher, _outbound) = LocalDispatcher::new(me);
        let launcher = Launcher::new(
            peers.clone(),
            Arc::new(dispatcher),
            Arc::new(Registry::new()),
            Arc::new(DonNotifier::new()),
            LauncherConfig::default(),
        );

        let shims = [tracked("a", false), tracked("b", true), tracked("c", false)];
        {
            let mut state = launcher.state.lock().await;
            for p in &shims {
                state.sub_services.push(p.clone());
            }
        }

        launcher.close().await.unwrap();
        launcher.close().await.unwrap();

        for p in &shims {
            assert_eq!(p.closes.load(Ordering::SeqCst), 1, "{}", p.name);
        }
        assert_eq!(launcher.sub_service_count().await, 0);
        assert_eq!(peers.update_count(), 2);
        assert_eq!(peers.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_a_no_op() {
        let me = PeerId::from_bytes([1; 32]);
        let peers = Arc::new(ConnectionTable::new(me));
        let (dispatcher, _outbound) = LocalDispatcher::new(me);
        let registry = Arc::new(Registry::new());
        let launcher = Launcher::new(
            peers.clone(),
            Arc::new(dispatcher),
            registry.clone(),
            Arc::new(DonNotifier::new()),
            LauncherConfig::default(),
        );

        launcher
            .launch(Arc::new(DirectorySnapshot::new()))
            .await
            .unwrap();

        assert_eq!(peers.connection_count(), 0);
        assert_eq!(launcher.sub_service_count().await, 0);
        assert!(registry.snapshot().is_ok());
        assert!(launcher.snapshot().await.is_some_and(|s| s.dons.is_empty()));
        assert_eq!(launcher.name(), LAUNCHER_NAME);
        assert!(launcher.ready().is_ok());
        assert_eq!(
            launcher.health_report().get(LAUNCHER_NAME).cloned(),
            Some(Ok(()))
        );
    }

    /// Shim whose start always fails
    struct Stuck;

    impl Receiver for Stuck {
        fn receive(&self, _message: MessageBody) {}
    }

    #[async_trait]
    impl Service for Stuck {
        fn name(&self) -> String {
            "Stuck".to_string()
        }

        async fn start(&self) -> Result<(), ServiceError> {
            Err(ServiceError::Failed {
                name: "Stuck".to_string(),
                reason: "no worker".to_string(),
            })
        }

        async fn close(&self) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    impl ConsumerShim for Stuck {
        fn instance(self: Arc<Self>) -> CapabilityInstance {
            CapabilityInstance::Executable(Arc::new(Noop))
        }
    }

    struct Noop;

    impl BaseCapability for Noop {
        fn info(&self) -> CapabilityInfo {
            CapabilityInfo::new_local("write@1.0.0", CapabilityType::Target, "noop").unwrap()
        }
    }

    #[async_trait]
    impl ExecutableCapability for Noop {
        async fn execute(
            &self,
            _request: CapabilityRequest,
        ) -> Result<CapabilityResponse, CapabilityError> {
            Ok(CapabilityResponse {
                value: serde_json::Value::Null,
            })
        }
    }

    fn wiring() -> (Launcher, Arc<LocalDispatcher>, Arc<Registry>) {
        let me = PeerId::from_bytes([1; 32]);
        let (dispatcher, _outbound) = LocalDispatcher::new(me);
        let dispatcher = Arc::new(dispatcher);
        let registry = Arc::new(Registry::new());
        let launcher = Launcher::new(
            Arc::new(ConnectionTable::new(me)),
            dispatcher.clone(),
            registry.clone(),
            Arc::new(DonNotifier::new()),
            LauncherConfig::default(),
        );
        (launcher, dispatcher, registry)
    }

    fn hosting_don() -> Don {
        Don {
            id: 3,
            config_version: 1,
            members: vec![PeerId::from_bytes([1; 32])],
            f: 0,
            is_public: true,
            accepts_workflows: false,
        }
    }

    fn write_target() -> CapabilityDescriptor {
        CapabilityDescriptor {
            id: "write@1.0.0".to_string(),
            capability_type: CapabilityType::Target,
        }
    }

    #[tokio::test]
    async fn test_failed_producer_start_removes_route() {
        let (launcher, dispatcher, registry) = wiring();
        registry
            .add(CapabilityInstance::Executable(Arc::new(Noop)))
            .unwrap();

        let mut state = launcher.state.lock().await;
        let result = launcher
            .add_receiver(&mut state, &write_target(), &hosting_don(), |_, _| {
                Ok(Arc::new(Stuck))
            })
            .await;

        assert!(matches!(result, Err(LaunchError::StartFailed { ref name, .. }) if name == "Stuck"));
        assert!(!dispatcher.has_receiver("write@1.0.0", 3));
        assert!(state.sub_services.is_empty());
    }

    #[tokio::test]
    async fn test_failed_consumer_start_is_fatal() {
        let (launcher, dispatcher, registry) = wiring();

        let mut state = launcher.state.lock().await;
        let result = launcher
            .add_to_registry_and_set_dispatcher(&mut state, &write_target(), &hosting_don(), |_| {
                Ok(Arc::new(Stuck))
            })
            .await;

        assert!(matches!(result, Err(LaunchError::StartFailed { .. })));
        assert!(dispatcher.has_receiver("write@1.0.0", 3));
        assert!(registry.get("write@1.0.0").is_ok());
        assert!(state.sub_services.is_empty());
    }
}
