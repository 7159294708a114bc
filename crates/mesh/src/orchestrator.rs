//! Orchestration integrator.
//!
//! Wires discovery, connection establishment, routing and health together,
//! runs each on its own timer, reacts to alerts through the resilience
//! control loops and exposes the aggregate status of the mesh.

use crate::alerts::{Alert, AlertCategory, AlertSeverity, AlertSource};
use crate::connection::ConnectionEstablisher;
use crate::discovery::{BeaconTransport, DiscoveryBeacon, DiscoveryProtocol, StaticBeaconTransport};
use crate::error::{MeshError, MeshResult};
use crate::health::{HealthMonitor, HealthReport};
use crate::link::{ConnectionStatus, ConnectionType};
use crate::node::{Node, NodeCapabilities, NodeId};
use crate::optimize::{suggest_optimizations, OptimizationSuggestion};
use crate::registry::{NoopRegistry, RegistryNotifier, ServiceRegistry};
use crate::resilience::failover::{ActiveFailover, FailoverDecisions, FailoverManager, FailoverPolicy};
use crate::resilience::healing::{HealingActionKind, HealingExecutor, HealingRecord, HealingTrigger, SelfHealer};
use crate::resilience::scaling::{AutoScaler, ProposedScaling, ScalingAction, ScalingDirection, ScalingRecord, ScalingStatistics};
use crate::resilience::PolicySet;
use crate::routing::{Route, RoutingProtocol, RoutingReport};
use crate::scheduler::spawn_periodic;
use crate::topology::{NetworkStatistics, NodeRemoval, Topology, TopologyStore};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use qmesh_core::{current_timestamp_ms, Config, Event, EventBuilder, EventKind, EventSeverity};
use qmesh_crypto::{KeyAlgorithm, KeyProvider, SecureChannelProvider, SoftwareKeyProvider, X25519SessionProvider};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub const COMPONENT_CHANNEL: &str = "secure-channel";
pub const COMPONENT_DISCOVERY: &str = "discovery";
pub const COMPONENT_ROUTING: &str = "routing";
pub const COMPONENT_HEALTH: &str = "health";
pub const COMPONENT_ORCHESTRATION: &str = "orchestration";

const COMPONENTS: [&str; 5] = [
    COMPONENT_CHANNEL,
    COMPONENT_DISCOVERY,
    COMPONENT_ROUTING,
    COMPONENT_HEALTH,
    COMPONENT_ORCHESTRATION,
];

/// Lifecycle state of one sub-resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentState {
    Initializing,
    Running,
    /// A dependency reported a non-fatal error
    Degraded,
    /// Terminal until the orchestrator is started again
    Failed,
}

impl ComponentState {
    fn severity(&self) -> u8 {
        match self {
            ComponentState::Running => 0,
            ComponentState::Initializing => 1,
            ComponentState::Degraded => 2,
            ComponentState::Failed => 3,
        }
    }

    /// Worst state among `states`. A failed dependency degrades the whole
    /// but does not fail it.
    pub fn overall<'a>(states: impl IntoIterator<Item = &'a ComponentState>) -> ComponentState {
        match states.into_iter().max_by_key(|s| s.severity()) {
            None => ComponentState::Initializing,
            Some(ComponentState::Failed) => ComponentState::Degraded,
            Some(state) => *state,
        }
    }
}

/// Snapshot of the integrator and the mesh it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub node_id: NodeId,
    pub overall: ComponentState,
    pub components: BTreeMap<String, ComponentState>,
    pub statistics: NetworkStatistics,
    pub suggestions: Vec<OptimizationSuggestion>,
    pub last_cycle_ms: Option<u64>,
    pub alerts_processed: u64,
    pub actions_executed: u64,
    pub actions_failed: u64,
    pub auto_scaling_enabled: bool,
    pub failover_enabled: bool,
    pub self_healing_enabled: bool,
    pub optimization_enabled: bool,
    pub scaling: ScalingStatistics,
    pub active_failovers: Vec<ActiveFailover>,
    pub healing_success_rate: Option<f64>,
}

/// What one alert set in motion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertDispatch {
    pub scaling: Vec<ScalingRecord>,
    pub failover: FailoverDecisions,
    pub healing: Vec<HealingRecord>,
}

/// Builder for [`Orchestrator`]. Every collaborator has an in-process default.
pub struct OrchestratorBuilder {
    config: Config,
    policies: PolicySet,
    keys: Option<Arc<dyn KeyProvider>>,
    channel: Option<Arc<dyn SecureChannelProvider>>,
    transport: Option<Arc<dyn BeaconTransport>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    alerts: Option<AlertSource>,
}

impl OrchestratorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            policies: PolicySet::default(),
            keys: None,
            channel: None,
            transport: None,
            registry: None,
            alerts: None,
        }
    }

    pub fn policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    pub fn key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn channel_provider(mut self, channel: Arc<dyn SecureChannelProvider>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn beacon_transport(mut self, transport: Arc<dyn BeaconTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn alert_source(mut self, alerts: AlertSource) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn build(self) -> MeshResult<Arc<Orchestrator>> {
        self.config.validate()?;
        let config = self.config;
        let local_id = config.node.node_id.clone();

        let store = TopologyStore::new(config.orchestration.event_log_capacity);
        let keys = self
            .keys
            .unwrap_or_else(|| Arc::new(SoftwareKeyProvider::new()));
        let channel = self
            .channel
            .unwrap_or_else(|| Arc::new(X25519SessionProvider::new(local_id.clone())));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(StaticBeaconTransport::default()));
        let registry = RegistryNotifier::new(self.registry.unwrap_or_else(|| Arc::new(NoopRegistry)));
        let history = config.orchestration.healing_history_capacity;

        let discovery = DiscoveryProtocol::new(
            local_id.clone(),
            store.clone(),
            transport,
            channel.clone(),
            registry.clone(),
            config.discovery.clone(),
            config.connection.handshake_timeout(),
        );
        let establisher = ConnectionEstablisher::new(
            store.clone(),
            channel.clone(),
            registry.clone(),
            config.connection.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);
        let toggles = &config.orchestration;

        Ok(Arc::new(Orchestrator {
            local_id,
            routing: RoutingProtocol::new(store.clone()),
            health: HealthMonitor::new(store.clone(), config.health.clone()),
            scaler: Mutex::new(AutoScaler::new(self.policies.auto_scaling, history)),
            failover: Mutex::new(FailoverManager::new(self.policies.failover, history)),
            healer: SelfHealer::new(self.policies.healing, history),
            auto_scaling_enabled: AtomicBool::new(toggles.auto_scaling_enabled),
            failover_enabled: AtomicBool::new(toggles.failover_enabled),
            self_healing_enabled: AtomicBool::new(toggles.self_healing_enabled),
            optimization_enabled: AtomicBool::new(toggles.optimization_enabled),
            alerts: self.alerts.unwrap_or_default(),
            components: RwLock::new(BTreeMap::new()),
            suggestions: RwLock::new(Vec::new()),
            last_cycle_ms: RwLock::new(None),
            alerts_processed: AtomicU64::new(0),
            actions_executed: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            store,
            keys,
            channel,
            registry,
            discovery,
            establisher,
            config,
        }))
    }
}

/// Top-level coordinator of one mesh node.
pub struct Orchestrator {
    config: Config,
    local_id: NodeId,
    store: TopologyStore,
    keys: Arc<dyn KeyProvider>,
    channel: Arc<dyn SecureChannelProvider>,
    registry: RegistryNotifier,
    alerts: AlertSource,
    discovery: DiscoveryProtocol,
    establisher: ConnectionEstablisher,
    routing: RoutingProtocol,
    health: HealthMonitor,
    scaler: Mutex<AutoScaler>,
    failover: Mutex<FailoverManager>,
    healer: SelfHealer,
    auto_scaling_enabled: AtomicBool,
    failover_enabled: AtomicBool,
    self_healing_enabled: AtomicBool,
    optimization_enabled: AtomicBool,
    components: RwLock<BTreeMap<&'static str, ComponentState>>,
    suggestions: RwLock<Vec<OptimizationSuggestion>>,
    last_cycle_ms: RwLock<Option<u64>>,
    alerts_processed: AtomicU64,
    actions_executed: AtomicU64,
    actions_failed: AtomicU64,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn store(&self) -> &TopologyStore {
        &self.store
    }

    pub fn establisher(&self) -> &ConnectionEstablisher {
        &self.establisher
    }

    pub fn alert_source(&self) -> &AlertSource {
        &self.alerts
    }

    pub fn local_beacon(&self) -> Option<DiscoveryBeacon> {
        self.discovery.local_beacon()
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // ---- lifecycle ----

    /// Create the local identity key, add the local node and sign the
    /// discovery beacon. Safe to call again after a restart.
    pub async fn bootstrap_local_node_at(&self, now: u64) -> MeshResult<Node> {
        let handle = self.keys.generate_key_pair(KeyAlgorithm::Ed25519, &self.local_id)?;
        let public_key = self.keys.get_public_key(&self.local_id)?;
        let capabilities = NodeCapabilities::from(&self.config.node);
        let node = Node::local(
            self.local_id.clone(),
            self.config.node.address.clone(),
            capabilities.clone(),
            &public_key,
            now,
        );

        if self.store.add_node(node.clone())? {
            self.registry.node_added(&node).await;
        } else {
            let key_hex = node.trust.public_key.clone();
            self.store.update_node_trust(&self.local_id, |trust| trust.public_key = key_hex)?;
            self.store.touch_node_at(&self.local_id, now)?;
        }
        let beacon = DiscoveryBeacon::signed(
            &self.local_id,
            &self.config.node.address,
            capabilities,
            self.keys.as_ref(),
            now,
        )?;
        self.discovery.set_local_beacon(beacon);

        tracing::info!(node_id = %self.local_id, key_id = %handle.public_key_id, "Local node bootstrapped");
        Ok(node)
    }

    /// Bootstrap the local node, wait for the secure-channel provider and
    /// start every periodic task plus the alert listener. Fails with
    /// `InvalidRequest` while already running.
    pub async fn start(self: &Arc<Self>) -> MeshResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(MeshError::InvalidRequest(format!(
                "orchestrator {} is already running",
                self.local_id
            )));
        }
        let started = self.start_tasks().await;
        if started.is_err() {
            self.running.store(false, Ordering::Release);
        }
        started
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn start_tasks(self: &Arc<Self>) -> MeshResult<()> {
        let now = current_timestamp_ms();
        for name in COMPONENTS {
            self.set_component(name, ComponentState::Initializing, now);
        }
        self.shutdown_tx.send_replace(false);

        self.bootstrap_local_node_at(now).await?;

        let timeout = self.config.orchestration.init_timeout();
        match tokio::time::timeout(timeout, self.channel.ready()).await {
            Ok(Ok(())) => self.set_component(COMPONENT_CHANNEL, ComponentState::Running, now),
            Ok(Err(e)) => {
                self.set_component(COMPONENT_CHANNEL, ComponentState::Failed, current_timestamp_ms());
                return Err(e.into());
            }
            Err(_) => {
                self.set_component(COMPONENT_CHANNEL, ComponentState::Failed, current_timestamp_ms());
                tracing::error!(timeout_ms = timeout.as_millis() as u64, "Secure-channel provider did not become ready");
                return Err(MeshError::InitializationTimeout {
                    component: COMPONENT_CHANNEL.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }

        let mut tasks = Vec::new();

        let this = Arc::clone(self);
        tasks.push(spawn_periodic(
            COMPONENT_DISCOVERY,
            self.config.discovery.interval(),
            self.shutdown_signal(),
            move || {
                let this = this.clone();
                async move { this.discovery_tick().await }
            },
        ));

        let this = Arc::clone(self);
        tasks.push(spawn_periodic(
            COMPONENT_ROUTING,
            self.config.routing.interval(),
            self.shutdown_signal(),
            move || {
                let this = this.clone();
                async move {
                    this.run_routing_cycle_at(current_timestamp_ms());
                }
            },
        ));

        let this = Arc::clone(self);
        tasks.push(spawn_periodic(
            COMPONENT_HEALTH,
            self.config.health.interval(),
            self.shutdown_signal(),
            move || {
                let this = this.clone();
                async move {
                    this.run_health_cycle_at(current_timestamp_ms()).await;
                }
            },
        ));

        let this = Arc::clone(self);
        tasks.push(spawn_periodic(
            COMPONENT_ORCHESTRATION,
            self.config.orchestration.interval(),
            self.shutdown_signal(),
            move || {
                let this = this.clone();
                async move {
                    this.run_orchestration_cycle_at(current_timestamp_ms()).await;
                }
            },
        ));

        tasks.push(self.spawn_alert_listener());
        self.tasks.lock().extend(tasks);

        let now = current_timestamp_ms();
        for name in [COMPONENT_DISCOVERY, COMPONENT_ROUTING, COMPONENT_HEALTH, COMPONENT_ORCHESTRATION] {
            self.set_component(name, ComponentState::Running, now);
        }
        tracing::info!(node_id = %self.local_id, "Orchestrator started");
        Ok(())
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Task ended abnormally");
            }
        }
        self.running.store(false, Ordering::Release);
        tracing::info!(node_id = %self.local_id, "Orchestrator stopped");
    }

    fn spawn_alert_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut alerts = self.alerts.subscribe();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = alerts.recv() => match received {
                        Ok(alert) => {
                            this.handle_alert(alert).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Alert listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn set_component(&self, name: &'static str, state: ComponentState, now: u64) {
        let previous = self.components.write().insert(name, state);
        if previous == Some(state) {
            return;
        }
        tracing::info!(component = name, state = ?state, "Component state changed");
        let severity = match state {
            ComponentState::Failed => EventSeverity::Error,
            ComponentState::Degraded => EventSeverity::Warning,
            _ => EventSeverity::Info,
        };
        self.store.append_event(
            EventBuilder::new(EventKind::ComponentState, COMPONENT_ORCHESTRATION)
                .at(now)
                .severity(severity)
                .entity(name)
                .message(format!("{name} is {state:?}"))
                .build(),
        );
    }

    fn cycle_failed(&self, component: &'static str, error: &MeshError, now: u64) {
        tracing::warn!(cycle = component, error = %error, "Cycle failed");
        self.store.append_event(
            EventBuilder::new(EventKind::CycleFailed, component)
                .at(now)
                .severity(EventSeverity::Warning)
                .message(format!("{component} cycle failed: {error}"))
                .build(),
        );
        self.set_component(component, ComponentState::Degraded, now);
    }

    // ---- periodic cycles ----

    async fn discovery_tick(&self) {
        let now = current_timestamp_ms();
        match self.discovery.run_cycle_at(now).await {
            Ok(_) => self.set_component(COMPONENT_DISCOVERY, ComponentState::Running, now),
            Err(e) => self.cycle_failed(COMPONENT_DISCOVERY, &e, now),
        }
    }

    /// Recompute every route at `now`.
    pub fn run_routing_cycle_at(&self, now: u64) -> RoutingReport {
        self.routing.run_cycle_at(now)
    }

    /// Run a health pass at `now`, close the sessions of links it failed,
    /// then heal offline nodes and untrusted channels and rotate keys that
    /// are due.
    pub async fn run_health_cycle_at(&self, now: u64) -> HealthReport {
        let report = self.health.run_cycle_at(now);
        self.establisher.release_sessions(&report.released_sessions).await;

        if self.is_self_healing_enabled() {
            for node_id in &report.offline {
                self.heal(HealingTrigger::NodeOffline, node_id).await;
            }
            for node_id in &report.untrusted_channels {
                self.heal(HealingTrigger::HighErrorRate, node_id).await;
            }
        }
        for connection_id in &report.rotation_due {
            if let Err(e) = self.establisher.rotate_session_key_at(connection_id, now).await {
                tracing::warn!(connection_id = %connection_id, error = %e, "Key rotation failed");
            }
        }
        report
    }

    /// Refresh metrics, evaluate the scaling policies against them, run the
    /// optimisation pass if enabled and release failovers whose primaries
    /// recovered.
    pub async fn run_orchestration_cycle_at(&self, now: u64) -> OrchestratorStatus {
        let statistics = self.store.recompute_metrics_at(now);

        // sustained windows advance on every cycle, not only on alerts
        if self.is_auto_scaling_enabled() {
            let records = self.run_scaling_at(&statistics.as_metrics(), now).await;
            if !records.is_empty() {
                tracing::info!(actions = records.len(), "Periodic scaling evaluation acted");
            }
        }

        if self.is_optimization_enabled() {
            let suggestions =
                suggest_optimizations(&self.store.snapshot(), self.health.error_rate_threshold());
            if !suggestions.is_empty() {
                tracing::debug!(count = suggestions.len(), "Optimisation suggestions");
            }
            *self.suggestions.write() = suggestions;
        } else {
            self.suggestions.write().clear();
        }

        let has_failovers = !self.failover.lock().active_bindings().is_empty();
        if self.is_failover_enabled() && has_failovers {
            self.run_failover_at(now).await;
        }

        *self.last_cycle_ms.write() = Some(now);
        self.set_component(COMPONENT_ORCHESTRATION, ComponentState::Running, now);
        self.status()
    }

    // ---- alerts ----

    pub fn publish_alert(&self, alert: Alert) -> usize {
        self.alerts.publish(alert)
    }

    /// Dispatch an alert to the control loops.
    pub async fn handle_alert(&self, alert: Alert) -> AlertDispatch {
        self.handle_alert_at(alert, current_timestamp_ms()).await
    }

    pub async fn handle_alert_at(&self, alert: Alert, now: u64) -> AlertDispatch {
        self.alerts_processed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            alert_id = %alert.id,
            category = ?alert.category,
            severity = ?alert.severity,
            affected = alert.affected.len(),
            "Alert received"
        );
        let mut dispatch = AlertDispatch::default();

        if alert.category == AlertCategory::Performance && self.is_auto_scaling_enabled() {
            let mut metrics = self.store.recompute_metrics_at(now).as_metrics();
            metrics.extend(alert.metrics.iter().map(|(k, v)| (k.clone(), *v)));
            dispatch.scaling = self.run_scaling_at(&metrics, now).await;
        }

        if alert.severity == AlertSeverity::Critical && self.is_failover_enabled() {
            dispatch.failover = self.run_failover_at(now).await;
        }

        if self.is_self_healing_enabled() {
            let trigger = HealingTrigger::from(alert.category);
            let targets = if alert.affected.is_empty() {
                vec![self.local_id.clone()]
            } else {
                alert.affected.clone()
            };
            for target in &targets {
                if let Some(record) = self.heal(trigger, target).await {
                    dispatch.healing.push(record);
                }
            }
        }
        dispatch
    }

    // ---- auto-scaling ----

    async fn run_scaling_at(&self, metrics: &HashMap<String, f64>, now: u64) -> Vec<ScalingRecord> {
        let proposals = self.scaler.lock().evaluate_at(metrics, now);
        let mut records = Vec::with_capacity(proposals.len());
        for proposal in &proposals {
            let outcome = self.execute_scaling(proposal, now).await;
            self.count_action(&outcome);
            records.push(self.scaler.lock().record(proposal, &outcome, now));
        }
        records
    }

    async fn execute_scaling(&self, proposal: &ProposedScaling, now: u64) -> MeshResult<String> {
        let action = &proposal.action;
        let node_id = self.scaling_target(action)?;
        let outcome = match action.direction {
            ScalingDirection::ScaleOut => self.scale_out(&node_id, action, now).await,
            ScalingDirection::ScaleIn => self.scale_in(&node_id, action, now).await,
            ScalingDirection::ScaleUp | ScalingDirection::ScaleDown => {
                self.resize_channels(&node_id, action)
            }
        };

        let (severity, message) = match &outcome {
            Ok(detail) => (EventSeverity::Info, detail.clone()),
            Err(e) => (EventSeverity::Warning, e.to_string()),
        };
        self.store.append_event(
            EventBuilder::new(EventKind::ScalingAction, "auto-scaling")
                .at(now)
                .severity(severity)
                .entity(node_id)
                .message(message)
                .payload("policy", proposal.policy.clone())
                .payload("direction", action.direction.as_str())
                .payload("success", outcome.is_ok())
                .build(),
        );
        outcome
    }

    /// The node a scaling action applies to. Resources that are not nodes
    /// resolve to the least connected online node for scale-out, the most
    /// connected for scale-in and the local node otherwise.
    fn scaling_target(&self, action: &ScalingAction) -> MeshResult<NodeId> {
        let topology = self.store.snapshot();
        if topology.nodes.contains_key(&action.resource) {
            return Ok(action.resource.clone());
        }
        let degrees = topology
            .nodes
            .values()
            .filter(|n| n.status.online)
            .map(|n| (topology.live_connections_of(&n.id).len(), n.id.clone()));
        let chosen = match action.direction {
            ScalingDirection::ScaleOut => degrees.min(),
            ScalingDirection::ScaleIn => degrees.max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1))),
            ScalingDirection::ScaleUp | ScalingDirection::ScaleDown => {
                return Ok(self.local_id.clone())
            }
        };
        chosen
            .map(|(_, id)| id)
            .ok_or_else(|| MeshError::ActionFailed {
                action: action.direction.as_str().to_string(),
                resource: action.resource.clone(),
                reason: "no online node".into(),
            })
    }

    async fn scale_out(&self, node_id: &str, action: &ScalingAction, now: u64) -> MeshResult<String> {
        let failed = |reason: String| MeshError::ActionFailed {
            action: action.direction.as_str().to_string(),
            resource: node_id.to_string(),
            reason,
        };
        let topology = self.store.snapshot();
        let mut candidates: Vec<&Node> = topology
            .nodes
            .values()
            .filter(|n| n.id != node_id && n.status.online && n.trust.trust_level > 0.0)
            .filter(|n| !action.requires_secure_channel || n.status.secure_channel_ready)
            .filter(|n| {
                topology
                    .connection_between(node_id, &n.id)
                    .map_or(true, |c| !c.status.is_live())
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.status
                .load
                .total_cmp(&b.status.load)
                .then_with(|| a.id.cmp(&b.id))
        });
        if candidates.is_empty() {
            return Err(failed("no unconnected online node".into()));
        }

        let mut connected = Vec::new();
        let mut last_error = None;
        for candidate in candidates {
            if connected.len() >= action.amount as usize {
                break;
            }
            match self
                .establisher
                .establish_at(node_id, &candidate.id, ConnectionType::Direct, now)
                .await
            {
                Ok(_) => connected.push(candidate.id.clone()),
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        if connected.is_empty() {
            return Err(failed(last_error.unwrap_or_else(|| "no connection made".into())));
        }
        Ok(format!("{node_id} connected to {}", connected.join(", ")))
    }

    async fn scale_in(&self, node_id: &str, action: &ScalingAction, now: u64) -> MeshResult<String> {
        let mut retired = Vec::new();
        for _ in 0..action.amount.max(1) {
            let topology = self.store.snapshot();
            let mut live = topology.live_connections_of(node_id);
            if live.len() < 2 {
                break;
            }
            live.sort_by(|a, b| {
                a.qos
                    .reliability
                    .total_cmp(&b.qos.reliability)
                    .then_with(|| a.id.cmp(&b.id))
            });
            let weakest = live[0];
            let removed = self.store.remove_connection(&weakest.id)?;
            self.channel.close_session(&removed.security.session_id).await;
            retired.push(removed.id);
        }
        if retired.is_empty() {
            return Err(MeshError::ActionFailed {
                action: action.direction.as_str().to_string(),
                resource: node_id.to_string(),
                reason: "node has fewer than two live connections".into(),
            });
        }
        self.routing.run_cycle_at(now);
        Ok(format!("{node_id} retired {}", retired.join(", ")))
    }

    fn resize_channels(&self, node_id: &str, action: &ScalingAction) -> MeshResult<String> {
        let up = action.direction == ScalingDirection::ScaleUp;
        let limit = self.store.update_node_capabilities(node_id, |caps| {
            caps.max_secure_channels = if up {
                caps.max_secure_channels.saturating_add(action.amount)
            } else {
                caps.max_secure_channels.saturating_sub(action.amount).max(1)
            };
            caps.max_secure_channels
        })?;
        Ok(format!("{node_id} max secure channels now {limit}"))
    }

    // ---- failover ----

    /// Per-node health as seen by the failover engine.
    fn resource_health(&self) -> HashMap<String, bool> {
        self.store
            .snapshot()
            .nodes
            .values()
            .map(|n| (n.id.clone(), n.is_healthy()))
            .collect()
    }

    async fn run_failover_at(&self, now: u64) -> FailoverDecisions {
        let health = self.resource_health();
        let decisions = self.failover.lock().evaluate_at(&health, now);

        for binding in &decisions.failovers {
            let outcome = self.execute_failover(binding, now).await;
            self.count_action(&outcome);
            if let Err(e) = &outcome {
                tracing::warn!(primary = %binding.primary, backup = %binding.backup, error = %e, "Failover failed");
                self.failover.lock().abort(&binding.primary, now);
            }
        }
        for binding in &decisions.failbacks {
            self.failback_event(binding, now);
        }
        decisions
    }

    /// Connect the backup to every online former peer of the primary.
    async fn execute_failover(&self, binding: &ActiveFailover, now: u64) -> MeshResult<String> {
        let topology = self.store.snapshot();
        let peers = former_peers(&topology, &binding.primary, &binding.backup);

        let mut connected = Vec::new();
        let mut last_error = None;
        for peer in &peers {
            match self
                .establisher
                .establish_at(&binding.backup, peer, ConnectionType::Fallback, now)
                .await
            {
                Ok(_) => connected.push(peer.clone()),
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        if !peers.is_empty() && connected.is_empty() {
            return Err(MeshError::ActionFailed {
                action: "failover".into(),
                resource: binding.primary.clone(),
                reason: last_error.unwrap_or_default(),
            });
        }
        if !connected.is_empty() {
            self.routing.run_cycle_at(now);
        }

        self.store.append_event(
            EventBuilder::new(EventKind::Failover, "failover")
                .at(now)
                .severity(EventSeverity::Warning)
                .entity(binding.primary.clone())
                .entity(binding.backup.clone())
                .message(format!("{} took over for {}", binding.backup, binding.primary))
                .payload("policy", binding.policy.clone())
                .payload("peers", connected.len())
                .build(),
        );
        Ok(format!(
            "{} serving {} with {} links",
            binding.backup,
            binding.primary,
            connected.len()
        ))
    }

    /// Release the backup serving `primary`.
    pub fn failback(&self, primary: &str) -> MeshResult<ActiveFailover> {
        let now = current_timestamp_ms();
        let released = self.failover.lock().failback(primary, now)?;
        self.failback_event(&released, now);
        Ok(released)
    }

    fn failback_event(&self, binding: &ActiveFailover, now: u64) {
        self.store.append_event(
            EventBuilder::new(EventKind::Failback, "failover")
                .at(now)
                .entity(binding.primary.clone())
                .entity(binding.backup.clone())
                .message(format!("{} released from {}", binding.backup, binding.primary))
                .build(),
        );
    }

    pub fn add_failover_policy(&self, policy: FailoverPolicy) {
        self.failover.lock().add_policy(policy);
    }

    pub fn set_failover_policy_enabled(&self, name: &str, enabled: bool) -> MeshResult<()> {
        self.failover.lock().set_policy_enabled(name, enabled)
    }

    pub fn set_scaling_policy_enabled(&self, name: &str, enabled: bool) -> MeshResult<()> {
        self.scaler.lock().set_policy_enabled(name, enabled)
    }

    pub fn set_healing_automated(
        &self,
        trigger: HealingTrigger,
        action: HealingActionKind,
        automated: bool,
    ) -> MeshResult<()> {
        self.healer.set_automated(trigger, action, automated)
    }

    pub fn active_failovers(&self) -> Vec<ActiveFailover> {
        self.failover.lock().active_bindings()
    }

    pub fn healing_history(&self) -> Vec<HealingRecord> {
        self.healer.history()
    }

    // ---- self-healing ----

    async fn heal(&self, trigger: HealingTrigger, target: &str) -> Option<HealingRecord> {
        let record = self.healer.heal(trigger, target, self).await?;
        let counter = if record.success {
            &self.actions_executed
        } else {
            &self.actions_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.store.append_event(
            EventBuilder::new(EventKind::Healing, "self-healing")
                .at(record.timestamp)
                .severity(if record.success {
                    EventSeverity::Info
                } else {
                    EventSeverity::Warning
                })
                .entity(target)
                .message(record.detail.clone())
                .payload("trigger", trigger.as_str())
                .payload("action", record.action.as_str())
                .payload("success", record.success)
                .build(),
        );
        Some(record)
    }

    async fn reconnect_links(&self, node_id: &str, now: u64) -> MeshResult<String> {
        let node = self
            .store
            .node(node_id)
            .ok_or_else(|| MeshError::unknown_node(node_id))?;
        if !node.status.online {
            return Err(MeshError::ActionFailed {
                action: HealingActionKind::ReconnectLinks.as_str().into(),
                resource: node_id.to_string(),
                reason: "node is offline".into(),
            });
        }

        let topology = self.store.snapshot();
        let broken: Vec<(String, String)> = node
            .connections
            .iter()
            .filter_map(|id| topology.connections.get(id))
            .filter(|c| c.status != ConnectionStatus::Active)
            .filter_map(|c| c.other_end(node_id).map(|peer| (c.id.clone(), peer.to_string())))
            .collect();
        if broken.is_empty() {
            return Ok(format!("{node_id} has no broken links"));
        }

        let mut restored = 0;
        let mut last_error = None;
        for (connection_id, peer) in &broken {
            if let Ok(old) = self.store.remove_connection(connection_id) {
                self.channel.close_session(&old.security.session_id).await;
            }
            let peer_online = topology.nodes.get(peer).is_some_and(|p| p.status.online);
            if !peer_online {
                continue;
            }
            match self
                .establisher
                .establish_at(node_id, peer, ConnectionType::Direct, now)
                .await
            {
                Ok(_) => restored += 1,
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        if restored == 0 {
            if let Some(reason) = last_error {
                return Err(MeshError::ActionFailed {
                    action: HealingActionKind::ReconnectLinks.as_str().into(),
                    resource: node_id.to_string(),
                    reason,
                });
            }
        }
        self.routing.run_cycle_at(now);
        Ok(format!("{node_id} restored {restored} of {} links", broken.len()))
    }

    async fn rotate_keys(&self, target: &str, now: u64) -> MeshResult<String> {
        let topology = self.store.snapshot();
        let connection_ids: Vec<String> = if topology.connections.contains_key(target) {
            vec![target.to_string()]
        } else if topology.nodes.contains_key(target) {
            topology
                .live_connections_of(target)
                .into_iter()
                .map(|c| c.id.clone())
                .collect()
        } else {
            return Err(MeshError::unknown_node(target));
        };

        let mut rotated = 0;
        for id in &connection_ids {
            match self.establisher.rotate_session_key_at(id, now).await {
                Ok(_) => rotated += 1,
                Err(e) => tracing::warn!(connection_id = %id, error = %e, "Key rotation failed"),
            }
        }
        if rotated == 0 && !connection_ids.is_empty() {
            return Err(MeshError::ActionFailed {
                action: HealingActionKind::RotateKeys.as_str().into(),
                resource: target.to_string(),
                reason: "no key could be rotated".into(),
            });
        }
        Ok(format!("rotated {rotated} session keys for {target}"))
    }

    fn quarantine(&self, node_id: &str) -> MeshResult<String> {
        if node_id == self.local_id {
            return Err(MeshError::InvalidRequest("the local node cannot be quarantined".into()));
        }
        self.store.update_node_trust(node_id, |trust| {
            trust.trust_level = 0.0;
            trust.attestation_valid = false;
        })?;
        self.store
            .update_node_status(node_id, |status| status.secure_channel_ready = false)?;
        tracing::warn!(node_id, "Node quarantined");
        Ok(format!("{node_id} quarantined"))
    }

    // ---- management ----

    /// Remove a node and everything attached to it, closing the sessions of
    /// its connections.
    pub async fn evict_node(&self, node_id: &str) -> MeshResult<NodeRemoval> {
        let removal = self.store.remove_node(node_id)?;
        for connection_id in &removal.removed_connections {
            tracing::debug!(connection_id = %connection_id, "Connection removed with node");
        }
        self.establisher.release_sessions(&removal.released_sessions).await;
        tracing::info!(node_id, connections = removal.removed_connections.len(), "Node evicted");
        self.store.append_event(
            EventBuilder::new(EventKind::NodeLeft, COMPONENT_ORCHESTRATION)
                .at(current_timestamp_ms())
                .severity(EventSeverity::Warning)
                .entity(node_id)
                .message(format!("{node_id} evicted"))
                .payload("removed_connections", removal.removed_connections.len())
                .build(),
        );
        self.registry.node_removed(node_id).await;
        Ok(removal)
    }

    fn count_action<T, E>(&self, outcome: &Result<T, E>) {
        if outcome.is_ok() {
            self.actions_executed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.actions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ---- queries ----

    pub fn get_topology(&self) -> Topology {
        self.store.snapshot()
    }

    pub fn find_route(&self, source: &str, target: &str) -> MeshResult<Route> {
        self.store.find_route(source, target)
    }

    pub fn get_network_statistics(&self) -> NetworkStatistics {
        self.store.statistics()
    }

    /// Most recent events, newest last.
    pub fn get_event_log(&self, limit: usize) -> Vec<Event> {
        self.store.recent_events(limit)
    }

    pub fn component_state(&self, name: &str) -> Option<ComponentState> {
        self.components.read().get(name).copied()
    }

    pub fn status(&self) -> OrchestratorStatus {
        let components: BTreeMap<String, ComponentState> = self
            .components
            .read()
            .iter()
            .map(|(name, state)| (name.to_string(), *state))
            .collect();
        let (scaling, active_failovers) = (
            self.scaler.lock().statistics(),
            self.failover.lock().active_bindings(),
        );
        OrchestratorStatus {
            node_id: self.local_id.clone(),
            overall: ComponentState::overall(components.values()),
            components,
            statistics: self.store.statistics(),
            suggestions: self.suggestions.read().clone(),
            last_cycle_ms: *self.last_cycle_ms.read(),
            alerts_processed: self.alerts_processed.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            auto_scaling_enabled: self.is_auto_scaling_enabled(),
            failover_enabled: self.is_failover_enabled(),
            self_healing_enabled: self.is_self_healing_enabled(),
            optimization_enabled: self.is_optimization_enabled(),
            scaling,
            active_failovers,
            healing_success_rate: self.healer.success_rate(),
        }
    }

    // ---- toggles ----

    pub fn enable_auto_scaling(&self) {
        self.toggle("auto-scaling", &self.auto_scaling_enabled, true);
    }

    pub fn disable_auto_scaling(&self) {
        self.toggle("auto-scaling", &self.auto_scaling_enabled, false);
    }

    pub fn enable_failover(&self) {
        self.toggle("failover", &self.failover_enabled, true);
    }

    pub fn disable_failover(&self) {
        self.toggle("failover", &self.failover_enabled, false);
    }

    pub fn enable_self_healing(&self) {
        self.toggle("self-healing", &self.self_healing_enabled, true);
    }

    pub fn disable_self_healing(&self) {
        self.toggle("self-healing", &self.self_healing_enabled, false);
    }

    pub fn set_optimization_enabled(&self, enabled: bool) {
        self.toggle("optimization", &self.optimization_enabled, enabled);
    }

    pub fn is_auto_scaling_enabled(&self) -> bool {
        self.auto_scaling_enabled.load(Ordering::Relaxed)
    }

    pub fn is_failover_enabled(&self) -> bool {
        self.failover_enabled.load(Ordering::Relaxed)
    }

    pub fn is_self_healing_enabled(&self) -> bool {
        self.self_healing_enabled.load(Ordering::Relaxed)
    }

    pub fn is_optimization_enabled(&self) -> bool {
        self.optimization_enabled.load(Ordering::Relaxed)
    }

    fn toggle(&self, name: &str, flag: &AtomicBool, enabled: bool) {
        if flag.swap(enabled, Ordering::Relaxed) != enabled {
            tracing::info!(control_loop = name, enabled, "Control loop toggled");
        }
    }
}

#[async_trait]
impl HealingExecutor for Orchestrator {
    async fn execute(&self, action: HealingActionKind, target: &str) -> MeshResult<String> {
        let now = current_timestamp_ms();
        match action {
            HealingActionKind::ReconnectLinks => self.reconnect_links(target, now).await,
            HealingActionKind::RotateKeys => self.rotate_keys(target, now).await,
            HealingActionKind::RecomputeRoutes => {
                let report = self.routing.run_cycle_at(now);
                Ok(format!(
                    "{} active routes from {} sources",
                    report.active_routes, report.sources
                ))
            }
            HealingActionKind::EvictNode => {
                let removal = self.evict_node(target).await?;
                Ok(format!(
                    "{target} evicted with {} connections",
                    removal.removed_connections.len()
                ))
            }
            HealingActionKind::QuarantineNode => self.quarantine(target),
        }
    }
}

/// Online nodes that had any connection with `primary`, except `backup`.
fn former_peers(topology: &Topology, primary: &str, backup: &str) -> Vec<NodeId> {
    let mut peers: Vec<NodeId> = topology
        .nodes
        .get(primary)
        .map(|node| {
            node.connections
                .iter()
                .filter_map(|id| topology.connections.get(id))
                .filter_map(|c| c.other_end(primary))
                .filter(|peer| *peer != backup)
                .filter(|peer| topology.nodes.get(*peer).is_some_and(|n| n.status.online))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    peers.sort();
    peers.dedup();
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::tests::online_node;
    use qmesh_crypto::{CryptoResult, SessionId, SessionKey};
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.node.node_id = "local".into();
        config.node.address = "127.0.0.1:47800".into();
        config
    }

    fn orchestrator(policies: PolicySet) -> Arc<Orchestrator> {
        Orchestrator::builder(test_config())
            .policies(policies)
            .build()
            .unwrap()
    }

    async fn with_nodes(orch: &Orchestrator, ids: &[&str]) {
        orch.bootstrap_local_node_at(0).await.unwrap();
        for id in ids {
            orch.store().add_node(online_node(id, 0)).unwrap();
        }
    }

    async fn link(orch: &Orchestrator, a: &str, b: &str) -> String {
        orch.establisher()
            .establish_at(a, b, ConnectionType::Direct, 0)
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_overall_state_is_worst_component() {
        use ComponentState::*;
        assert_eq!(ComponentState::overall([Running, Running].iter()), Running);
        assert_eq!(ComponentState::overall([Running, Initializing].iter()), Initializing);
        assert_eq!(ComponentState::overall([Running, Degraded, Initializing].iter()), Degraded);
        assert_eq!(ComponentState::overall([Running, Failed].iter()), Degraded);
        assert_eq!(ComponentState::overall([].iter()), Initializing);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let orch = orchestrator(PolicySet::default());
        orch.start().await.unwrap();

        let status = orch.status();
        assert_eq!(status.overall, ComponentState::Running);
        assert_eq!(status.components.len(), COMPONENTS.len());
        let local = orch.store().node("local").unwrap();
        assert!(local.is_local);
        assert!(orch.local_beacon().unwrap().verify().is_ok());
        assert!(orch.is_running());

        orch.shutdown().await;
        assert!(*orch.shutdown_signal().borrow());
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let orch = orchestrator(PolicySet::default());
        orch.start().await.unwrap();
        let spawned = orch.tasks.lock().len();
        assert_eq!(spawned, 5);

        let err = orch.start().await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest(_)));
        assert_eq!(orch.tasks.lock().len(), spawned);

        // a stopped orchestrator can be started again
        orch.shutdown().await;
        assert!(orch.tasks.lock().is_empty());
        orch.start().await.unwrap();
        assert_eq!(orch.tasks.lock().len(), spawned);
        orch.shutdown().await;
    }

    /// Provider that never becomes ready.
    struct StuckProvider;

    #[async_trait]
    impl SecureChannelProvider for StuckProvider {
        async fn ready(&self) -> CryptoResult<()> {
            std::future::pending().await
        }

        async fn start_secure_session(&self, _peer: &str, _bits: usize) -> CryptoResult<SessionId> {
            Ok(SessionId::new())
        }

        async fn get_session_key(&self, _session_id: &SessionId) -> Option<SessionKey> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialization_timeout() {
        let orch = Orchestrator::builder(test_config())
            .channel_provider(Arc::new(StuckProvider))
            .build()
            .unwrap();

        let err = orch.start().await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::InitializationTimeout { timeout_ms: 30_000, .. }
        ));
        assert_eq!(orch.component_state(COMPONENT_CHANNEL), Some(ComponentState::Failed));
        assert_eq!(orch.status().overall, ComponentState::Degraded);
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_performance_alert_scales_out() {
        let mut policies = PolicySet::default();
        policies.auto_scaling[0].trigger.sustained_ms = 0;
        let orch = orchestrator(policies);
        with_nodes(&orch, &["a", "b", "c"]).await;
        link(&orch, "a", "b").await;

        let alert = Alert::new(AlertCategory::Performance, AlertSeverity::High, vec!["a".into()])
            .with_metric("average_load", 0.95);
        let dispatch = orch.handle_alert_at(alert, 1_000).await;

        assert_eq!(dispatch.scaling.len(), 1);
        assert!(dispatch.scaling[0].success, "{}", dispatch.scaling[0].detail);
        // "mesh" is not a node: the least connected online node is "c"
        let c = orch.store().node("c").unwrap();
        assert_eq!(c.degree(), 1);
        assert!(orch.store().connection_between("c", "a").is_some());
        assert_eq!(orch.store().events_of_kind(EventKind::ScalingAction).len(), 1);

        // performance alerts also reach self-healing
        assert_eq!(dispatch.healing.len(), 1);
        assert_eq!(dispatch.healing[0].action, HealingActionKind::RecomputeRoutes);
    }

    #[tokio::test]
    async fn test_scaling_cooldown_across_alerts() {
        let mut policies = PolicySet::default();
        policies.auto_scaling.truncate(1);
        policies.auto_scaling[0].trigger.sustained_ms = 0;
        let orch = orchestrator(policies);
        with_nodes(&orch, &["a", "b", "c", "d"]).await;
        orch.disable_self_healing();

        let alert = |t| {
            Alert::new(AlertCategory::Performance, AlertSeverity::Medium, vec![])
                .with_metric("average_load", 0.9)
                .at(t)
        };
        assert_eq!(orch.handle_alert_at(alert(0), 0).await.scaling.len(), 1);
        assert!(orch.handle_alert_at(alert(1), 299_999).await.scaling.is_empty());
        assert_eq!(orch.handle_alert_at(alert(2), 300_000).await.scaling.len(), 1);
    }

    #[tokio::test]
    async fn test_critical_alert_fails_over() {
        let mut policies = PolicySet::default();
        policies.failover.push(FailoverPolicy::new("gw", "p", vec!["b".into()]));
        let orch = orchestrator(policies);
        with_nodes(&orch, &["p", "b", "x", "y"]).await;
        link(&orch, "p", "x").await;
        link(&orch, "p", "y").await;
        orch.store().mark_node_offline("p", 10).unwrap();

        let alert = Alert::new(AlertCategory::Availability, AlertSeverity::Critical, vec!["p".into()]);
        let dispatch = orch.handle_alert_at(alert, 20).await;

        assert_eq!(dispatch.failover.failovers.len(), 1);
        assert_eq!(dispatch.failover.failovers[0].backup, "b");
        let topology = orch.get_topology();
        for peer in ["x", "y"] {
            let conn = topology.connection_between("b", peer).unwrap();
            assert_eq!(conn.connection_type, ConnectionType::Fallback);
            assert_eq!(conn.status, ConnectionStatus::Active);
        }
        assert!(orch.find_route("x", "y").is_ok());
        assert_eq!(orch.status().active_failovers.len(), 1);

        let released = orch.failback("p").unwrap();
        assert_eq!(released.backup, "b");
        assert!(orch.active_failovers().is_empty());
    }

    #[tokio::test]
    async fn test_failover_disabled() {
        let mut policies = PolicySet::default();
        policies.failover.push(FailoverPolicy::new("gw", "p", vec!["b".into()]));
        let orch = orchestrator(policies);
        with_nodes(&orch, &["p", "b"]).await;
        orch.store().mark_node_offline("p", 10).unwrap();
        orch.disable_failover();

        let alert = Alert::new(AlertCategory::Availability, AlertSeverity::Critical, vec!["p".into()]);
        assert!(orch.handle_alert_at(alert, 20).await.failover.is_empty());
    }

    #[tokio::test]
    async fn test_security_alert_quarantines() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &["a"]).await;

        let alert = Alert::new(AlertCategory::Security, AlertSeverity::High, vec!["a".into()]);
        let dispatch = orch.handle_alert_at(alert, 5).await;

        assert!(dispatch.healing[0].success);
        let node = orch.store().node("a").unwrap();
        assert_eq!(node.trust.trust_level, 0.0);
        assert!(!node.status.secure_channel_ready);
        assert_eq!(orch.status().actions_executed, 1);
    }

    #[tokio::test]
    async fn test_channel_quality_alert_rotates_keys() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &["a", "b"]).await;
        let id = link(&orch, "a", "b").await;
        let before = orch.store().connection(&id).unwrap().security.session_id;

        let alert = Alert::new(AlertCategory::ChannelQuality, AlertSeverity::Medium, vec!["a".into()]);
        let dispatch = orch.handle_alert_at(alert, 5).await;

        assert!(dispatch.healing[0].success);
        assert_ne!(orch.store().connection(&id).unwrap().security.session_id, before);
        assert_eq!(orch.store().events_of_kind(EventKind::KeyRotated).len(), 1);
    }

    #[tokio::test]
    async fn test_healing_failure_is_recorded_not_raised() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &[]).await;

        let alert = Alert::new(AlertCategory::Security, AlertSeverity::Low, vec!["ghost".into()]);
        let dispatch = orch.handle_alert_at(alert, 5).await;

        assert!(!dispatch.healing[0].success);
        let status = orch.status();
        assert_eq!(status.actions_failed, 1);
        assert_eq!(status.healing_success_rate, Some(0.0));
    }

    #[tokio::test]
    async fn test_health_cycle_heals_offline_node() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &["a", "b", "c"]).await;
        link(&orch, "a", "b").await;
        link(&orch, "b", "c").await;
        orch.run_routing_cycle_at(0);
        assert!(orch.find_route("a", "c").is_ok());

        for id in ["local", "a", "b"] {
            orch.store().touch_node_at(id, 60_000).unwrap();
        }
        let report = orch.run_health_cycle_at(61_000).await;

        assert_eq!(report.offline, vec!["c"]);
        assert_eq!(report.released_sessions.len(), 1);
        // node-offline heals by recomputing routes
        assert!(orch.find_route("a", "c").is_err());
        assert!(orch.find_route("a", "b").is_ok());
        assert_eq!(orch.healing_history()[0].trigger, HealingTrigger::NodeOffline);
    }

    #[tokio::test]
    async fn test_reconnect_links() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &["a", "b"]).await;
        let id = link(&orch, "a", "b").await;
        orch.store()
            .set_connection_status(&id, ConnectionStatus::Failed, 1)
            .unwrap();

        let detail = orch
            .execute(HealingActionKind::ReconnectLinks, "a")
            .await
            .unwrap();
        assert!(detail.contains("restored 1"));
        assert!(orch.store().connection(&id).is_none());
        assert_eq!(
            orch.store().connection_between("a", "b").unwrap().status,
            ConnectionStatus::Active
        );

        orch.store().mark_node_offline("a", 2).unwrap();
        assert!(orch
            .execute(HealingActionKind::ReconnectLinks, "a")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_scale_in_keeps_one_link() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &["a", "b", "c"]).await;
        let ab = link(&orch, "a", "b").await;
        let ac = link(&orch, "a", "c").await;
        orch.store().record_measurement(&ab, 0.05, 100.0, 1).unwrap();
        orch.store().record_measurement(&ac, 0.01, 100.0, 1).unwrap();

        let proposal = ProposedScaling {
            policy: "manual".into(),
            action: ScalingAction::new(ScalingDirection::ScaleIn, "a").amount(5),
            observed: 0.0,
            proposed_at: 2,
        };
        let detail = orch.execute_scaling(&proposal, 2).await.unwrap();
        assert!(detail.contains(&ab));
        assert!(orch.store().connection(&ac).is_some());
        assert!(orch.execute_scaling(&proposal, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &["a"]).await;
        let up = ProposedScaling {
            policy: "manual".into(),
            action: ScalingAction::new(ScalingDirection::ScaleUp, "a").amount(4),
            observed: 0.0,
            proposed_at: 0,
        };
        orch.execute_scaling(&up, 0).await.unwrap();
        assert_eq!(orch.store().node("a").unwrap().capabilities.max_secure_channels, 20);

        let down = ProposedScaling {
            action: ScalingAction::new(ScalingDirection::ScaleDown, "a").amount(100),
            ..up
        };
        orch.execute_scaling(&down, 1).await.unwrap();
        assert_eq!(orch.store().node("a").unwrap().capabilities.max_secure_channels, 1);
    }

    #[tokio::test]
    async fn test_orchestration_cycle_and_toggles() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &["a", "b", "c"]).await;
        link(&orch, "a", "b").await;

        let status = orch.run_orchestration_cycle_at(500).await;
        assert_eq!(status.last_cycle_ms, Some(500));
        assert!(!status.suggestions.is_empty());
        assert_eq!(status.statistics.active_connection_count, 1);

        orch.set_optimization_enabled(false);
        orch.disable_auto_scaling();
        let status = orch.run_orchestration_cycle_at(600).await;
        assert!(status.suggestions.is_empty());
        assert!(!status.auto_scaling_enabled);

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"overall\""));
    }

    #[tokio::test]
    async fn test_default_policies_fire_from_periodic_cycles() {
        let orch = orchestrator(PolicySet::default());
        with_nodes(&orch, &["a", "b", "c"]).await;
        for id in ["local", "a", "b", "c"] {
            orch.store().update_node_status(id, |s| s.load = 0.9).unwrap();
        }

        // load-scale-out needs average_load > 0.8 held for 60 s
        orch.run_orchestration_cycle_at(1_000).await;
        orch.run_orchestration_cycle_at(31_000).await;
        assert_eq!(orch.status().scaling.proposed, 0);

        let status = orch.run_orchestration_cycle_at(61_000).await;
        assert_eq!(status.scaling.proposed, 1);
        let fired = orch.store().events_of_kind(EventKind::ScalingAction);
        assert_eq!(fired.len(), 1);
        assert_eq!(
            fired[0].payload.get("policy").and_then(|v| v.as_str()),
            Some("load-scale-out")
        );

        // cooldown holds while the load stays high
        let status = orch.run_orchestration_cycle_at(91_000).await;
        assert_eq!(
            orch.store()
                .events_of_kind(EventKind::ScalingAction)
                .iter()
                .filter(|e| e.payload.get("policy").and_then(|v| v.as_str()) == Some("load-scale-out"))
                .count(),
            1
        );
        assert!(status.scaling.evaluations >= 4);
    }

    #[tokio::test]
    async fn test_evict_node() {
        let channel = Arc::new(X25519SessionProvider::new("local"));
        let orch = Orchestrator::builder(test_config())
            .channel_provider(channel.clone())
            .build()
            .unwrap();
        with_nodes(&orch, &["a", "b"]).await;
        link(&orch, "a", "b").await;
        assert_eq!(channel.session_count(), 1);

        let removal = orch.evict_node("b").await.unwrap();
        assert_eq!(removal.removed_connections.len(), 1);
        assert_eq!(channel.session_count(), 0);
        assert!(orch.store().node("a").unwrap().connections.is_empty());
        assert!(orch.evict_node("local").await.is_err());
        assert!(orch
            .get_event_log(10)
            .iter()
            .any(|e| e.kind == EventKind::NodeLeft));
    }

    #[tokio::test]
    async fn test_alert_listener_dispatches() {
        let orch = orchestrator(PolicySet::default());
        orch.start().await.unwrap();
        orch.store().add_node(online_node("a", current_timestamp_ms())).unwrap();

        orch.publish_alert(Alert::new(AlertCategory::Security, AlertSeverity::High, vec!["a".into()]));
        for _ in 0..100 {
            if orch.status().alerts_processed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(orch.status().alerts_processed, 1);
        assert_eq!(orch.store().node("a").unwrap().trust.trust_level, 0.0);
        orch.shutdown().await;
    }
}
