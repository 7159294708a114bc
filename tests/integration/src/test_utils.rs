//! Test utilities for mesh integration tests

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use qmesh_core::Config;
use qmesh_crypto::{
    ChannelMetrics, CryptoError, CryptoResult, KeyAlgorithm, KeyProvider, SecureChannelProvider,
    SessionId, SessionKey, SoftwareKeyProvider,
};
use qmesh_mesh::{
    Connection, ConnectionEstablisher, ConnectionType, DiscoveryBeacon, DiscoveryProtocol,
    HealthMonitor, MeshResult, Node, NodeCapabilities, RegistryNotifier, RoutingProtocol,
    ServiceRegistry, StaticBeaconTransport, TopologyStore,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed clock origin shared by every scenario.
pub const T0: u64 = 1_700_000_000_000;

/// Metrics that give an edge a routing cost of exactly 1.0:
/// 1.5 km, no errors, no key rate, reliability 1.
pub fn unit_cost_metrics() -> ChannelMetrics {
    ChannelMetrics {
        error_rate: 0.0,
        key_rate: 0.0,
        fidelity: 1.0,
        distance_km: 1.5,
    }
}

pub fn metrics(error_rate: f64, key_rate: f64) -> ChannelMetrics {
    ChannelMetrics {
        error_rate,
        key_rate,
        fidelity: 1.0 - 2.0 * error_rate,
        distance_km: 1.0,
    }
}

/// Secure-channel provider with scripted per-peer quality and failures.
#[derive(Default)]
pub struct ScriptedChannel {
    profiles: RwLock<HashMap<String, ChannelMetrics>>,
    failing: RwLock<HashSet<String>>,
    sessions: RwLock<HashMap<SessionId, SessionKey>>,
    started: AtomicUsize,
}

impl ScriptedChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Quality reported for every session with `peer`.
    pub fn set_metrics(&self, peer: &str, metrics: ChannelMetrics) {
        self.profiles.write().insert(peer.to_string(), metrics);
    }

    /// Make sessions with `peer` fail.
    pub fn fail(&self, peer: &str) {
        self.failing.write().insert(peer.to_string());
    }

    pub fn heal(&self, peer: &str) {
        self.failing.write().remove(peer);
    }

    /// Sessions started since creation, including failed ones.
    pub fn sessions_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.read().len()
    }
}

#[async_trait]
impl SecureChannelProvider for ScriptedChannel {
    async fn start_secure_session(
        &self,
        peer_hint: &str,
        bit_length: usize,
    ) -> CryptoResult<SessionId> {
        let seq = self.started.fetch_add(1, Ordering::SeqCst);
        if self.failing.read().contains(peer_hint) {
            return Err(CryptoError::SessionFailed {
                peer: peer_hint.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let metrics = self
            .profiles
            .read()
            .get(peer_hint)
            .copied()
            .unwrap_or_else(unit_cost_metrics);
        let session_id = SessionId::new();
        let material = vec![(seq % 251) as u8; bit_length / 8];
        self.sessions.write().insert(
            session_id.clone(),
            SessionKey::new(session_id.clone(), material, metrics),
        );
        Ok(session_id)
    }

    async fn get_session_key(&self, session_id: &SessionId) -> Option<SessionKey> {
        self.sessions.read().get(session_id).cloned()
    }

    async fn close_session(&self, session_id: &SessionId) {
        self.sessions.write().remove(session_id);
    }
}

/// Registry that remembers every notification.
#[derive(Default)]
pub struct RecordingRegistry {
    pub added: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub connections: Mutex<Vec<String>>,
}

#[async_trait]
impl ServiceRegistry for RecordingRegistry {
    async fn node_added(&self, node: &Node) -> MeshResult<()> {
        self.added.lock().push(node.id.clone());
        Ok(())
    }

    async fn node_removed(&self, node_id: &str) -> MeshResult<()> {
        self.removed.lock().push(node_id.to_string());
        Ok(())
    }

    async fn connection_established(&self, connection: &Connection) -> MeshResult<()> {
        self.connections.lock().push(connection.id.clone());
        Ok(())
    }
}

/// A remote node with its own identity key.
pub struct TestPeer {
    pub id: String,
    pub address: String,
    pub keys: SoftwareKeyProvider,
}

impl TestPeer {
    pub fn new(id: &str, port: u16) -> Self {
        let keys = SoftwareKeyProvider::new();
        keys.generate_key_pair(KeyAlgorithm::Ed25519, id)
            .expect("generate peer key");
        Self {
            id: id.to_string(),
            address: format!("10.0.0.{}:{port}", port % 250),
            keys,
        }
    }

    /// A correctly signed beacon created at `now`.
    pub fn beacon(&self, now: u64) -> DiscoveryBeacon {
        DiscoveryBeacon::signed(
            &self.id,
            &self.address,
            NodeCapabilities::default(),
            &self.keys,
            now,
        )
        .expect("sign beacon")
    }

    /// The node as it looks after a completed handshake.
    pub fn node(&self, now: u64) -> Node {
        let public_key = self.keys.get_public_key(&self.id).expect("peer key");
        Node::new(&self.id, &self.address, NodeCapabilities::default(), now)
            .verified(hex::encode(public_key))
    }
}

/// Configuration for a node named `node_id` with library defaults.
pub fn test_config(node_id: &str) -> Config {
    let mut config = Config::default();
    config.node.node_id = node_id.to_string();
    config.node.address = "127.0.0.1:47800".to_string();
    config
}

/// The mesh components wired around one shared store, without the
/// orchestrator on top.
pub struct MeshHarness {
    pub local: TestPeer,
    pub config: Config,
    pub store: TopologyStore,
    pub channel: Arc<ScriptedChannel>,
    pub transport: Arc<StaticBeaconTransport>,
    pub registry: Arc<RecordingRegistry>,
    pub discovery: DiscoveryProtocol,
    pub establisher: ConnectionEstablisher,
    pub routing: RoutingProtocol,
    pub health: HealthMonitor,
}

impl MeshHarness {
    /// A harness whose store already holds the local node, seen at `T0`.
    pub fn new(local_id: &str) -> Self {
        let config = test_config(local_id);
        let local = TestPeer::new(local_id, 47800);
        let store = TopologyStore::new(config.orchestration.event_log_capacity);
        let channel = ScriptedChannel::new();
        let transport = Arc::new(StaticBeaconTransport::default());
        let registry = Arc::new(RecordingRegistry::default());
        let notifier = RegistryNotifier::new(registry.clone());

        let public_key = local.keys.get_public_key(local_id).expect("local key");
        store
            .add_node(Node::local(
                local_id,
                &local.address,
                NodeCapabilities::from(&config.node),
                &public_key,
                T0,
            ))
            .expect("add local node");

        let discovery = DiscoveryProtocol::new(
            local_id,
            store.clone(),
            transport.clone(),
            channel.clone(),
            notifier.clone(),
            config.discovery.clone(),
            config.connection.handshake_timeout(),
        );
        discovery.set_local_beacon(local.beacon(T0));
        let establisher = ConnectionEstablisher::new(
            store.clone(),
            channel.clone(),
            notifier,
            config.connection.clone(),
        );

        Self {
            routing: RoutingProtocol::new(store.clone()),
            health: HealthMonitor::new(store.clone(), config.health.clone()),
            local,
            config,
            store,
            channel,
            transport,
            registry,
            discovery,
            establisher,
        }
    }

    /// Add verified peers seen at `now`.
    pub fn add_peers(&self, ids: &[&str], now: u64) {
        for (i, id) in ids.iter().enumerate() {
            let peer = TestPeer::new(id, 47801 + i as u16);
            self.store.add_node(peer.node(now)).expect("add peer");
        }
    }

    /// Establish a direct link whose quality is `metrics`.
    pub async fn link(&self, a: &str, b: &str, metrics: ChannelMetrics, now: u64) -> Connection {
        self.channel.set_metrics(b, metrics);
        self.establisher
            .establish_at(a, b, ConnectionType::Direct, now)
            .await
            .expect("establish link")
    }
}
