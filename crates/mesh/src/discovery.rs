//! Node discovery.
//!
//! Each cycle broadcasts the local node's signed [`DiscoveryBeacon`] and
//! collects the beacons other nodes answer with. A candidate must carry a
//! valid signature; new candidates are then handshaken through the
//! secure-channel provider (concurrently, one task per candidate) and only
//! added to the topology on success. Known candidates just get their
//! `last_seen` refreshed. The cycle ends with a stale sweep that removes nodes
//! unseen for `stale_multiplier` discovery intervals.
//!
//! Beacons travel over a [`BeaconTransport`]. [`UdpBeaconTransport`] and
//! [`BeaconResponder`] implement it over UDP broadcast with JSON datagrams;
//! [`StaticBeaconTransport`] serves a fixed candidate list.

use crate::error::{MeshError, MeshResult};
use crate::node::{Node, NodeCapabilities, NodeId};
use crate::registry::RegistryNotifier;
use crate::topology::TopologyStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use qmesh_core::{
    current_timestamp_ms, elapsed_ms, DiscoveryConfig, EventBuilder, EventKind, EventSeverity,
};
use qmesh_crypto::{verify_signature, KeyProvider, SecureChannelProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Largest beacon datagram accepted.
pub const MAX_BEACON_BYTES: usize = 8 * 1024;

/// Signed self-description a node broadcasts during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryBeacon {
    pub node_id: NodeId,
    pub address: String,
    pub capabilities: NodeCapabilities,
    /// Ed25519 public key, hex encoded
    pub public_key: String,
    /// Creation time (Unix epoch milliseconds)
    pub timestamp: u64,
    /// Signature over every other field, hex encoded
    pub signature: String,
}

impl DiscoveryBeacon {
    /// Build a beacon for `node_id` signed with its identity key.
    pub fn signed(
        node_id: &str,
        address: &str,
        capabilities: NodeCapabilities,
        keys: &dyn KeyProvider,
        now: u64,
    ) -> MeshResult<Self> {
        let mut beacon = Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
            capabilities,
            public_key: hex::encode(keys.get_public_key(node_id)?),
            timestamp: now,
            signature: String::new(),
        };
        let signature = keys.sign(node_id, &beacon.signing_payload()?)?;
        beacon.signature = hex::encode(signature);
        Ok(beacon)
    }

    fn signing_payload(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(&(
            &self.node_id,
            &self.address,
            &self.capabilities,
            &self.public_key,
            self.timestamp,
        ))?)
    }

    /// Check the signature against the embedded public key.
    pub fn verify(&self) -> MeshResult<()> {
        let public_key = hex::decode(&self.public_key)
            .map_err(|e| MeshError::InvalidRequest(format!("beacon public key: {e}")))?;
        let signature = hex::decode(&self.signature)
            .map_err(|e| MeshError::InvalidRequest(format!("beacon signature: {e}")))?;
        verify_signature(&public_key, &self.signing_payload()?, &signature)?;
        Ok(())
    }
}

/// Datagram exchanged between discovery peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BeaconMessage {
    Probe { beacon: DiscoveryBeacon },
    Reply { beacon: DiscoveryBeacon },
}

/// Carries beacons between nodes.
#[async_trait]
pub trait BeaconTransport: Send + Sync {
    /// Announce `beacon` and return the beacons received within `window`.
    async fn exchange(
        &self,
        beacon: &DiscoveryBeacon,
        window: Duration,
    ) -> MeshResult<Vec<DiscoveryBeacon>>;
}

/// Transport answering every exchange with a fixed set of beacons.
#[derive(Debug, Default)]
pub struct StaticBeaconTransport {
    beacons: RwLock<Vec<DiscoveryBeacon>>,
}

impl StaticBeaconTransport {
    pub fn new(beacons: Vec<DiscoveryBeacon>) -> Self {
        Self {
            beacons: RwLock::new(beacons),
        }
    }

    /// Add or replace the beacon of one node.
    pub fn upsert(&self, beacon: DiscoveryBeacon) {
        let mut beacons = self.beacons.write();
        beacons.retain(|b| b.node_id != beacon.node_id);
        beacons.push(beacon);
    }

    /// Stop answering for `node_id`.
    pub fn remove(&self, node_id: &str) {
        self.beacons.write().retain(|b| b.node_id != node_id);
    }
}

#[async_trait]
impl BeaconTransport for StaticBeaconTransport {
    async fn exchange(
        &self,
        _beacon: &DiscoveryBeacon,
        _window: Duration,
    ) -> MeshResult<Vec<DiscoveryBeacon>> {
        Ok(self.beacons.read().clone())
    }
}

/// UDP broadcast transport.
pub struct UdpBeaconTransport {
    socket: UdpSocket,
    broadcast: SocketAddr,
}

impl UdpBeaconTransport {
    /// Bind to `bind` and send probes to `broadcast`.
    pub async fn bind(bind: SocketAddr, broadcast: SocketAddr) -> MeshResult<Self> {
        let socket = UdpSocket::bind(bind).await?;
        socket.set_broadcast(true)?;
        tracing::info!(local = %socket.local_addr()?, %broadcast, "Beacon transport bound");
        Ok(Self { socket, broadcast })
    }

    pub fn local_addr(&self) -> MeshResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl BeaconTransport for UdpBeaconTransport {
    async fn exchange(
        &self,
        beacon: &DiscoveryBeacon,
        window: Duration,
    ) -> MeshResult<Vec<DiscoveryBeacon>> {
        let probe = serde_json::to_vec(&BeaconMessage::Probe {
            beacon: beacon.clone(),
        })?;
        self.socket.send_to(&probe, self.broadcast).await?;

        let deadline = tokio::time::Instant::now() + window;
        let mut buf = vec![0u8; MAX_BEACON_BYTES];
        let mut replies: Vec<DiscoveryBeacon> = Vec::new();
        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_) => break,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Beacon receive failed");
                    continue;
                }
                Ok(Ok(datagram)) => datagram,
            };
            match serde_json::from_slice::<BeaconMessage>(&buf[..len]) {
                Ok(BeaconMessage::Reply { beacon: reply }) if reply.node_id != beacon.node_id => {
                    replies.retain(|b| b.node_id != reply.node_id);
                    replies.push(reply);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(%from, error = %e, "Ignoring malformed beacon"),
            }
        }
        Ok(replies)
    }
}

/// Answers probes with the local beacon.
pub struct BeaconResponder {
    socket: UdpSocket,
}

impl BeaconResponder {
    pub async fn bind(addr: SocketAddr) -> MeshResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> MeshResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `shutdown` flips to true.
    pub fn spawn(self, beacon: DiscoveryBeacon, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let reply = match serde_json::to_vec(&BeaconMessage::Reply {
                beacon: beacon.clone(),
            }) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(error = %e, "Cannot encode local beacon");
                    return;
                }
            };
            let mut buf = vec![0u8; MAX_BEACON_BYTES];
            loop {
                tokio::select! {
                    received = self.socket.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(datagram) => datagram,
                            Err(e) => {
                                tracing::warn!(error = %e, "Responder receive failed");
                                continue;
                            }
                        };
                        let Ok(BeaconMessage::Probe { beacon: probe }) =
                            serde_json::from_slice::<BeaconMessage>(&buf[..len])
                        else {
                            continue;
                        };
                        if probe.node_id == beacon.node_id {
                            continue;
                        }
                        if let Err(e) = self.socket.send_to(&reply, from).await {
                            tracing::warn!(%from, error = %e, "Failed to answer probe");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Beacon responder stopped");
        })
    }
}

/// Summary of one discovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub candidates: usize,
    pub joined: Vec<NodeId>,
    pub refreshed: Vec<NodeId>,
    /// Beacons with a bad signature
    pub rejected: Vec<NodeId>,
    pub handshake_failed: Vec<NodeId>,
    pub evicted: Vec<NodeId>,
}

/// Periodic discovery of verified nodes.
pub struct DiscoveryProtocol {
    local_id: NodeId,
    store: TopologyStore,
    transport: Arc<dyn BeaconTransport>,
    channel: Arc<dyn SecureChannelProvider>,
    registry: RegistryNotifier,
    config: DiscoveryConfig,
    handshake_timeout: Duration,
    local_beacon: RwLock<Option<DiscoveryBeacon>>,
}

impl DiscoveryProtocol {
    pub fn new(
        local_id: impl Into<NodeId>,
        store: TopologyStore,
        transport: Arc<dyn BeaconTransport>,
        channel: Arc<dyn SecureChannelProvider>,
        registry: RegistryNotifier,
        config: DiscoveryConfig,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            store,
            transport,
            channel,
            registry,
            config,
            handshake_timeout,
            local_beacon: RwLock::new(None),
        }
    }

    /// Set the beacon announced in every cycle.
    pub fn set_local_beacon(&self, beacon: DiscoveryBeacon) {
        *self.local_beacon.write() = Some(beacon);
    }

    pub fn local_beacon(&self) -> Option<DiscoveryBeacon> {
        self.local_beacon.read().clone()
    }

    /// Run one discovery cycle now.
    pub async fn run_cycle(&self) -> MeshResult<DiscoveryReport> {
        self.run_cycle_at(current_timestamp_ms()).await
    }

    /// Run one discovery cycle at `now`.
    pub async fn run_cycle_at(&self, now: u64) -> MeshResult<DiscoveryReport> {
        let beacon = self
            .local_beacon()
            .ok_or_else(|| MeshError::InvalidRequest("local beacon not set".into()))?;
        let candidates = self
            .transport
            .exchange(&beacon, self.config.window())
            .await?;

        let mut report = DiscoveryReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut handshakes = JoinSet::new();

        for candidate in candidates {
            if candidate.node_id == self.local_id || !seen.insert(candidate.node_id.clone()) {
                continue;
            }
            if let Err(e) = candidate.verify() {
                self.channel_error(&candidate.node_id, &format!("beacon rejected: {e}"), now);
                report.rejected.push(candidate.node_id);
                continue;
            }
            if self.store.contains_node(&candidate.node_id) {
                if self.store.touch_node_at(&candidate.node_id, now).is_ok() {
                    tracing::debug!(node_id = %candidate.node_id, "Refreshed known node");
                    report.refreshed.push(candidate.node_id);
                }
                continue;
            }

            let channel = self.channel.clone();
            let bits = self.config.handshake_bits;
            let timeout = self.handshake_timeout;
            handshakes.spawn(async move {
                let result = handshake(channel.as_ref(), &candidate.node_id, bits, timeout).await;
                (candidate, result)
            });
        }

        while let Some(joined) = handshakes.join_next().await {
            let (candidate, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(error = %e, "Handshake task aborted");
                    continue;
                }
            };
            if let Err(e) = result {
                self.channel_error(&candidate.node_id, &format!("handshake failed: {e}"), now);
                report.handshake_failed.push(candidate.node_id);
                continue;
            }

            let node = Node::new(
                candidate.node_id.clone(),
                candidate.address,
                candidate.capabilities,
                now,
            )
            .verified(candidate.public_key);
            match self.store.add_node(node.clone()) {
                Ok(true) => {
                    tracing::info!(node_id = %node.id, address = %node.address, "Node joined");
                    self.store.append_event(
                        EventBuilder::new(EventKind::NodeJoined, "discovery")
                            .at(now)
                            .entity(node.id.clone())
                            .message(format!("{} joined at {}", node.id, node.address))
                            .build(),
                    );
                    self.registry.node_added(&node).await;
                    report.joined.push(node.id);
                }
                Ok(false) => report.refreshed.push(node.id),
                Err(e) => tracing::warn!(node_id = %node.id, error = %e, "Failed to add node"),
            }
        }

        report.joined.sort();
        report.handshake_failed.sort();
        report.evicted = self.sweep_stale_at(now).await;

        tracing::debug!(
            candidates = report.candidates,
            joined = report.joined.len(),
            refreshed = report.refreshed.len(),
            evicted = report.evicted.len(),
            "Discovery cycle complete"
        );
        Ok(report)
    }

    /// Remove every non-local node unseen for longer than the stale window,
    /// closing the sessions of its connections.
    pub async fn sweep_stale_at(&self, now: u64) -> Vec<NodeId> {
        let stale_after = self.config.stale_after_ms();
        let stale: Vec<NodeId> = self
            .store
            .snapshot()
            .nodes
            .values()
            .filter(|n| !n.is_local && elapsed_ms(n.status.last_seen, now) > stale_after)
            .map(|n| n.id.clone())
            .collect();

        let mut evicted = Vec::new();
        for node_id in stale {
            match self.store.remove_node(&node_id) {
                Ok(removal) => {
                    for session_id in &removal.released_sessions {
                        self.channel.close_session(session_id).await;
                    }
                    tracing::info!(
                        node_id = %node_id,
                        connections = removal.removed_connections.len(),
                        "Stale node removed"
                    );
                    self.store.append_event(
                        EventBuilder::new(EventKind::NodeLeft, "discovery")
                            .at(now)
                            .severity(EventSeverity::Warning)
                            .entity(node_id.clone())
                            .message(format!("{node_id} removed after {stale_after} ms unseen"))
                            .payload("removed_connections", removal.removed_connections.len())
                            .build(),
                    );
                    self.registry.node_removed(&node_id).await;
                    evicted.push(node_id);
                }
                Err(e) if e.is_unknown_entity() => {}
                Err(e) => tracing::warn!(node_id = %node_id, error = %e, "Failed to remove stale node"),
            }
        }
        evicted
    }

    fn channel_error(&self, node_id: &str, message: &str, now: u64) {
        tracing::warn!(node_id, "{message}");
        self.store.append_event(
            EventBuilder::new(EventKind::ChannelError, "discovery")
                .at(now)
                .severity(EventSeverity::Warning)
                .entity(node_id)
                .message(message)
                .build(),
        );
    }
}

/// Prove reachability with a throwaway secure session.
async fn handshake(
    channel: &dyn SecureChannelProvider,
    peer: &str,
    bits: usize,
    timeout: Duration,
) -> MeshResult<()> {
    let session = tokio::time::timeout(timeout, channel.start_secure_session(peer, bits))
        .await
        .map_err(|_| MeshError::ConnectionFailed {
            source_id: String::new(),
            target_id: peer.to_string(),
            reason: format!("handshake timed out after {} ms", timeout.as_millis()),
        })??;
    let key = channel.get_session_key(&session).await;
    channel.close_session(&session).await;
    match key {
        Some(_) => Ok(()),
        None => Err(MeshError::ConnectionFailed {
            source_id: String::new(),
            target_id: peer.to_string(),
            reason: "session produced no key".into(),
        }),
    }
}
