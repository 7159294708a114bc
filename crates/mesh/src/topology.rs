//! Topology Store - the canonical in-memory graph of the mesh.
//!
//! Holds nodes, connections, the per-source route table, aggregate network
//! statistics and the bounded event log. Every mutation takes the write lock
//! for its whole duration, so a mutation never interleaves with another one
//! and readers always observe whole entities. Node removal cascades to
//! incident connections and routes inside a single critical section.
//!
//! The lock is never held across an `.await`; callers that talk to providers
//! read what they need, release, await, then re-validate on write.

use crate::error::{MeshError, MeshResult};
use crate::link::{Connection, ConnectionStatus, SecurityBinding};
use crate::node::{Node, NodeCapabilities, NodeStatus, NodeTrust};
use crate::routing::{Route, RouteStatus};
use parking_lot::RwLock;
use qmesh_core::{current_timestamp_ms, Event, EventKind, EventLog};
use qmesh_crypto::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Derived network-wide metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatistics {
    pub node_count: usize,
    pub online_node_count: usize,
    pub connection_count: usize,
    pub active_connection_count: usize,
    pub degraded_connection_count: usize,
    /// Active routes across all sources
    pub route_count: usize,
    /// Mean error rate over live connections
    pub average_error_rate: f64,
    /// Sum of key rates over active connections
    pub total_key_rate: f64,
    /// Mean reliability over live connections
    pub network_reliability: f64,
    /// Mean load over online nodes
    pub average_load: f64,
    /// When the statistics were computed (Unix epoch milliseconds)
    pub computed_at: u64,
}

impl NetworkStatistics {
    /// Named metric values, as consumed by auto-scaling policies.
    pub fn as_metrics(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("node_count".to_string(), self.node_count as f64),
            ("online_nodes".to_string(), self.online_node_count as f64),
            ("active_connections".to_string(), self.active_connection_count as f64),
            ("degraded_connections".to_string(), self.degraded_connection_count as f64),
            ("route_count".to_string(), self.route_count as f64),
            ("average_error_rate".to_string(), self.average_error_rate),
            ("total_key_rate".to_string(), self.total_key_rate),
            ("network_reliability".to_string(), self.network_reliability),
            ("average_load".to_string(), self.average_load),
        ])
    }
}

/// Nodes, connections, routes and derived metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: BTreeMap<String, Node>,
    pub connections: BTreeMap<String, Connection>,
    /// Routes keyed by source node
    pub routes: BTreeMap<String, Vec<Route>>,
    pub statistics: NetworkStatistics,
    /// Bumped on every mutation
    pub revision: u64,
}

impl Topology {
    /// Live connections incident to `node_id`.
    pub fn live_connections_of<'a>(&'a self, node_id: &str) -> Vec<&'a Connection> {
        self.nodes
            .get(node_id)
            .map(|node| {
                node.connections
                    .iter()
                    .filter_map(|id| self.connections.get(id))
                    .filter(|c| c.status.is_live())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// IDs of nodes reachable over one live connection.
    pub fn live_neighbours(&self, node_id: &str) -> Vec<String> {
        let mut neighbours: Vec<String> = self
            .live_connections_of(node_id)
            .into_iter()
            .filter_map(|c| c.other_end(node_id).map(str::to_string))
            .collect();
        neighbours.sort();
        neighbours.dedup();
        neighbours
    }

    /// The best connection between two nodes: active first, then degraded.
    pub fn connection_between(&self, a: &str, b: &str) -> Option<&Connection> {
        let node = self.nodes.get(a)?;
        let mut candidates: Vec<&Connection> = node
            .connections
            .iter()
            .filter_map(|id| self.connections.get(id))
            .filter(|c| c.connects(a, b))
            .collect();
        candidates.sort_by_key(|c| match c.status {
            ConnectionStatus::Active => 0,
            ConnectionStatus::Degraded => 1,
            ConnectionStatus::Establishing => 2,
            ConnectionStatus::Failed => 3,
        });
        candidates.into_iter().next()
    }

    fn compute_statistics(&self, now: u64) -> NetworkStatistics {
        let online: Vec<&Node> = self.nodes.values().filter(|n| n.status.online).collect();
        let live: Vec<&Connection> = self
            .connections
            .values()
            .filter(|c| c.status.is_live())
            .collect();
        let active = live
            .iter()
            .filter(|c| c.status == ConnectionStatus::Active)
            .count();

        NetworkStatistics {
            node_count: self.nodes.len(),
            online_node_count: online.len(),
            connection_count: self.connections.len(),
            active_connection_count: active,
            degraded_connection_count: live.len() - active,
            route_count: self
                .routes
                .values()
                .flatten()
                .filter(|r| r.status == RouteStatus::Active)
                .count(),
            average_error_rate: mean(live.iter().map(|c| c.quality.error_rate)),
            total_key_rate: live
                .iter()
                .filter(|c| c.status == ConnectionStatus::Active)
                .map(|c| c.quality.key_rate)
                .sum(),
            network_reliability: mean(live.iter().map(|c| c.qos.reliability)),
            average_load: mean(online.iter().map(|n| n.status.load)),
            computed_at: now,
        }
    }

    /// Recompute a node's error rate as the mean over its live connections.
    fn refresh_node_error_rate(&mut self, node_id: &str) {
        let rate = mean(
            self.live_connections_of(node_id)
                .into_iter()
                .map(|c| c.quality.error_rate),
        );
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.status.error_rate = rate;
        }
    }

    fn validate_route(&self, route: &Route) -> bool {
        if route.path.len() < 2 || route.connections.len() != route.path.len() - 1 {
            return false;
        }
        if route.path.first() != Some(&route.source) || route.path.last() != Some(&route.target) {
            return false;
        }
        if !route.path.iter().all(|id| self.nodes.contains_key(id)) {
            return false;
        }
        route
            .path
            .windows(2)
            .zip(&route.connections)
            .all(|(pair, conn_id)| {
                self.connections.get(conn_id).is_some_and(|c| {
                    c.status == ConnectionStatus::Active && c.connects(&pair[0], &pair[1])
                })
            })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// What a node removal took with it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRemoval {
    pub node: Node,
    pub removed_connections: Vec<String>,
    /// Sessions of the removed connections, still open on the provider
    pub released_sessions: Vec<SessionId>,
    /// Routes whose path crossed the node, now marked failed
    pub failed_routes: usize,
    /// Routes from or to the node, dropped
    pub dropped_routes: usize,
}

/// What taking a node offline failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOffline {
    pub failed_connections: Vec<String>,
    /// Sessions of the failed connections, still open on the provider
    pub released_sessions: Vec<SessionId>,
}

/// Outcome of replacing one source's routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteReplacement {
    /// The stored paths differ from the previous table
    pub changed: bool,
    pub accepted: usize,
    /// Routes that no longer match the live topology
    pub rejected: usize,
}

#[derive(Debug)]
struct StoreState {
    topology: Topology,
    events: EventLog,
}

/// Shared handle to the topology. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct TopologyStore {
    inner: Arc<RwLock<StoreState>>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new(EventLog::DEFAULT_CAPACITY)
    }
}

impl TopologyStore {
    /// Create an empty store retaining at most `event_capacity` events.
    pub fn new(event_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreState {
                topology: Topology::default(),
                events: EventLog::new(event_capacity),
            })),
        }
    }

    // ---- nodes ----

    /// Add a node. Returns `false` and leaves the stored node untouched when
    /// the ID is already present.
    pub fn add_node(&self, mut node: Node) -> MeshResult<bool> {
        if node.id.trim().is_empty() {
            return Err(MeshError::InvalidRequest("node id must not be empty".into()));
        }
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        if topology.nodes.contains_key(&node.id) {
            return Ok(false);
        }
        node.connections.clear();
        topology.nodes.insert(node.id.clone(), node);
        topology.revision += 1;
        Ok(true)
    }

    /// Refresh `last_seen` and mark the node online.
    pub fn touch_node_at(&self, node_id: &str, now: u64) -> MeshResult<()> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        let node = topology
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::unknown_node(node_id))?;
        node.status.last_seen = node.status.last_seen.max(now);
        node.status.online = true;
        topology.revision += 1;
        Ok(())
    }

    /// Apply `update` to a node's status.
    pub fn update_node_status<R>(
        &self,
        node_id: &str,
        update: impl FnOnce(&mut NodeStatus) -> R,
    ) -> MeshResult<R> {
        self.with_node(node_id, |node| update(&mut node.status))
    }

    /// Apply `update` to a node's trust metadata.
    pub fn update_node_trust<R>(
        &self,
        node_id: &str,
        update: impl FnOnce(&mut NodeTrust) -> R,
    ) -> MeshResult<R> {
        self.with_node(node_id, |node| update(&mut node.trust))
    }

    /// Apply `update` to a node's capabilities.
    pub fn update_node_capabilities<R>(
        &self,
        node_id: &str,
        update: impl FnOnce(&mut NodeCapabilities) -> R,
    ) -> MeshResult<R> {
        self.with_node(node_id, |node| update(&mut node.capabilities))
    }

    fn with_node<R>(&self, node_id: &str, update: impl FnOnce(&mut Node) -> R) -> MeshResult<R> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        let node = topology
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::unknown_node(node_id))?;
        let result = update(node);
        topology.revision += 1;
        Ok(result)
    }

    /// Mark a node offline and fail all of its live connections. Routes that
    /// cross the node are marked failed.
    pub fn mark_node_offline(&self, node_id: &str, now: u64) -> MeshResult<NodeOffline> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        let node = topology
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::unknown_node(node_id))?;
        node.status.online = false;
        let incident: Vec<String> = node.connections.iter().cloned().collect();

        let mut offline = NodeOffline::default();
        let mut peers = Vec::new();
        for id in incident {
            if let Some(conn) = topology.connections.get_mut(&id) {
                if conn.status != ConnectionStatus::Failed {
                    conn.status = ConnectionStatus::Failed;
                    conn.updated_at = now;
                    if let Some(peer) = conn.other_end(node_id) {
                        peers.push(peer.to_string());
                    }
                    offline.released_sessions.push(conn.security.session_id.clone());
                    offline.failed_connections.push(id);
                }
            }
        }
        for peer in peers {
            topology.refresh_node_error_rate(&peer);
        }
        for route in topology.routes.values_mut().flatten() {
            if route.path.iter().any(|id| id == node_id) {
                route.status = RouteStatus::Failed;
            }
        }
        topology.revision += 1;
        Ok(offline)
    }

    /// Remove a node together with every incident connection. Routes that
    /// merely cross the node are marked failed; routes from or to it are
    /// dropped. The local node cannot be removed.
    pub fn remove_node(&self, node_id: &str) -> MeshResult<NodeRemoval> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        match topology.nodes.get(node_id) {
            None => return Err(MeshError::unknown_node(node_id)),
            Some(node) if node.is_local => {
                return Err(MeshError::InvalidRequest(format!(
                    "local node {node_id} cannot be removed"
                )))
            }
            Some(_) => {}
        }
        let Some(node) = topology.nodes.remove(node_id) else {
            return Err(MeshError::unknown_node(node_id));
        };

        let mut removed_connections = Vec::new();
        let mut released_sessions = Vec::new();
        for id in &node.connections {
            if let Some(conn) = topology.connections.remove(id) {
                if let Some(peer) = conn.other_end(node_id) {
                    if let Some(peer_node) = topology.nodes.get_mut(peer) {
                        peer_node.connections.remove(id);
                    }
                }
                removed_connections.push(id.clone());
                released_sessions.push(conn.security.session_id);
            }
        }
        let peers: Vec<String> = topology.nodes.keys().cloned().collect();
        for peer in peers {
            topology.refresh_node_error_rate(&peer);
        }

        let mut dropped_routes = topology
            .routes
            .remove(node_id)
            .map(|routes| routes.len())
            .unwrap_or(0);
        let mut failed_routes = 0;
        for routes in topology.routes.values_mut() {
            let before = routes.len();
            routes.retain(|r| r.target != node_id);
            dropped_routes += before - routes.len();
            for route in routes.iter_mut() {
                if route.path.iter().any(|id| id == node_id) && route.status != RouteStatus::Failed
                {
                    route.status = RouteStatus::Failed;
                    failed_routes += 1;
                }
            }
        }
        topology.revision += 1;

        Ok(NodeRemoval {
            node,
            removed_connections,
            released_sessions,
            failed_routes,
            dropped_routes,
        })
    }

    // ---- connections ----

    /// Insert a connection. Both endpoints must exist.
    pub fn insert_connection(&self, connection: Connection) -> MeshResult<()> {
        let mut state = self.inner.write();
        Self::insert_locked(&mut state.topology, connection)
    }

    /// Insert `connection` unless an active connection between the same pair
    /// already exists, in which case the existing one is returned. The check
    /// and the insert happen under one write lock.
    pub fn insert_connection_if_absent(&self, connection: Connection) -> MeshResult<(Connection, bool)> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        if let Some(existing) = topology
            .connection_between(&connection.source, &connection.target)
            .filter(|c| c.status == ConnectionStatus::Active)
        {
            return Ok((existing.clone(), false));
        }
        Self::insert_locked(topology, connection.clone())?;
        Ok((connection, true))
    }

    fn insert_locked(topology: &mut Topology, connection: Connection) -> MeshResult<()> {
        if connection.source == connection.target {
            return Err(MeshError::InvalidRequest(format!(
                "connection from {} to itself",
                connection.source
            )));
        }
        for endpoint in [&connection.source, &connection.target] {
            if !topology.nodes.contains_key(endpoint) {
                return Err(MeshError::unknown_node(endpoint.as_str()));
            }
        }
        for endpoint in [&connection.source, &connection.target] {
            if let Some(node) = topology.nodes.get_mut(endpoint) {
                node.connections.insert(connection.id.clone());
            }
        }
        let (source, target) = (connection.source.clone(), connection.target.clone());
        topology.connections.insert(connection.id.clone(), connection);
        topology.refresh_node_error_rate(&source);
        topology.refresh_node_error_rate(&target);
        topology.revision += 1;
        Ok(())
    }

    /// Change a connection's status, enforcing the lifecycle. Returns the
    /// previous status.
    pub fn set_connection_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
        now: u64,
    ) -> MeshResult<ConnectionStatus> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        let conn = topology
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| MeshError::unknown_connection(connection_id))?;
        let previous = conn.status;
        if !previous.can_transition_to(status) {
            return Err(MeshError::InvalidRequest(format!(
                "connection {connection_id} cannot move from {previous:?} to {status:?}"
            )));
        }
        conn.status = status;
        conn.updated_at = now;
        let (source, target) = (conn.source.clone(), conn.target.clone());
        topology.refresh_node_error_rate(&source);
        topology.refresh_node_error_rate(&target);
        topology.revision += 1;
        Ok(previous)
    }

    /// Remove a connection and detach it from both endpoints.
    pub fn remove_connection(&self, connection_id: &str) -> MeshResult<Connection> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        let conn = topology
            .connections
            .remove(connection_id)
            .ok_or_else(|| MeshError::unknown_connection(connection_id))?;
        for endpoint in [&conn.source, &conn.target] {
            if let Some(node) = topology.nodes.get_mut(endpoint) {
                node.connections.remove(connection_id);
            }
        }
        topology.refresh_node_error_rate(&conn.source);
        topology.refresh_node_error_rate(&conn.target);
        topology.revision += 1;
        Ok(conn)
    }

    /// Record a fresh channel measurement on a connection.
    pub fn record_measurement(
        &self,
        connection_id: &str,
        error_rate: f64,
        key_rate: f64,
        now: u64,
    ) -> MeshResult<()> {
        if !(0.0..=1.0).contains(&error_rate) || key_rate < 0.0 {
            return Err(MeshError::InvalidRequest(format!(
                "measurement out of range: error_rate={error_rate}, key_rate={key_rate}"
            )));
        }
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        let conn = topology
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| MeshError::unknown_connection(connection_id))?;
        conn.quality.error_rate = error_rate;
        conn.quality.key_rate = key_rate;
        conn.quality.fidelity = (1.0 - 2.0 * error_rate).clamp(0.0, 1.0);
        conn.qos.reliability = (1.0 - error_rate).clamp(0.0, 1.0);
        conn.updated_at = now;
        let (source, target) = (conn.source.clone(), conn.target.clone());
        topology.refresh_node_error_rate(&source);
        topology.refresh_node_error_rate(&target);
        topology.revision += 1;
        Ok(())
    }

    /// Add to a connection's traffic counters.
    pub fn record_traffic(&self, connection_id: &str, sent: u64, received: u64) -> MeshResult<()> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        let conn = topology
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| MeshError::unknown_connection(connection_id))?;
        conn.traffic.bytes_sent = conn.traffic.bytes_sent.saturating_add(sent);
        conn.traffic.bytes_received = conn.traffic.bytes_received.saturating_add(received);
        topology.revision += 1;
        Ok(())
    }

    /// Replace a connection's session binding after key rotation.
    pub fn update_security(
        &self,
        connection_id: &str,
        security: SecurityBinding,
    ) -> MeshResult<SecurityBinding> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        let conn = topology
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| MeshError::unknown_connection(connection_id))?;
        if !conn.status.is_live() {
            return Err(MeshError::InvalidRequest(format!(
                "connection {connection_id} is not live"
            )));
        }
        conn.updated_at = security.last_rotation;
        let previous = std::mem::replace(&mut conn.security, security);
        topology.revision += 1;
        Ok(previous)
    }

    // ---- routes ----

    /// Replace every route of `source`. Routes whose path no longer matches
    /// the live topology (missing node, connection gone or not active) are
    /// discarded.
    pub fn replace_routes_for_source(
        &self,
        source: &str,
        routes: Vec<Route>,
    ) -> MeshResult<RouteReplacement> {
        let mut state = self.inner.write();
        let topology = &mut state.topology;
        if !topology.nodes.contains_key(source) {
            return Err(MeshError::unknown_node(source));
        }
        let total = routes.len();
        let accepted: Vec<Route> = routes
            .into_iter()
            .filter(|r| r.source == source && topology.validate_route(r))
            .collect();

        let signature = |routes: &[Route]| -> Vec<(String, Vec<String>, RouteStatus)> {
            routes
                .iter()
                .map(|r| (r.target.clone(), r.path.clone(), r.status))
                .collect()
        };
        let previous = topology.routes.get(source).map(|r| signature(r)).unwrap_or_default();
        let changed = previous != signature(&accepted);

        let replacement = RouteReplacement {
            changed,
            accepted: accepted.len(),
            rejected: total - accepted.len(),
        };
        if accepted.is_empty() {
            topology.routes.remove(source);
        } else {
            topology.routes.insert(source.to_string(), accepted);
        }
        topology.revision += 1;
        Ok(replacement)
    }

    /// The active route from `source` to `target`.
    pub fn find_route(&self, source: &str, target: &str) -> MeshResult<Route> {
        self.find_route_with_status(source, target, RouteStatus::Active)
    }

    /// The backup route from `source` to `target`, if one was computed.
    pub fn find_backup_route(&self, source: &str, target: &str) -> MeshResult<Route> {
        self.find_route_with_status(source, target, RouteStatus::Backup)
    }

    fn find_route_with_status(
        &self,
        source: &str,
        target: &str,
        status: RouteStatus,
    ) -> MeshResult<Route> {
        let state = self.inner.read();
        let topology = &state.topology;
        for id in [source, target] {
            if !topology.nodes.contains_key(id) {
                return Err(MeshError::unknown_node(id));
            }
        }
        topology
            .routes
            .get(source)
            .and_then(|routes| {
                routes
                    .iter()
                    .find(|r| r.target == target && r.status == status)
            })
            .cloned()
            .ok_or_else(|| MeshError::UnknownRoute {
                source_id: source.to_string(),
                target_id: target.to_string(),
            })
    }

    /// All stored routes of `source`, any status.
    pub fn routes_from(&self, source: &str) -> Vec<Route> {
        self.inner
            .read()
            .topology
            .routes
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    // ---- events ----

    /// Append an event to the bounded log.
    pub fn append_event(&self, event: Event) {
        tracing::debug!(kind = %event.kind, entities = ?event.entities, "{}", event.message);
        self.inner.write().events.append(event);
    }

    /// The most recent `limit` events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.inner.read().events.recent(limit)
    }

    /// Retained events of one kind.
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.inner.read().events.of_kind(kind)
    }

    // ---- reads ----

    /// A consistent copy of the whole topology.
    pub fn snapshot(&self) -> Topology {
        self.inner.read().topology.clone()
    }

    pub fn node(&self, node_id: &str) -> Option<Node> {
        self.inner.read().topology.nodes.get(node_id).cloned()
    }

    pub fn connection(&self, connection_id: &str) -> Option<Connection> {
        self.inner
            .read()
            .topology
            .connections
            .get(connection_id)
            .cloned()
    }

    /// The best connection between two nodes, if any.
    pub fn connection_between(&self, a: &str, b: &str) -> Option<Connection> {
        self.inner.read().topology.connection_between(a, b).cloned()
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.inner.read().topology.nodes.contains_key(node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.inner.read().topology.nodes.keys().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().topology.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().topology.connections.len()
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().topology.revision
    }

    /// Recompute and store aggregate metrics.
    pub fn recompute_metrics_at(&self, now: u64) -> NetworkStatistics {
        let mut state = self.inner.write();
        let statistics = state.topology.compute_statistics(now);
        state.topology.statistics = statistics.clone();
        statistics
    }

    /// Recompute aggregate metrics at the current time.
    pub fn recompute_metrics(&self) -> NetworkStatistics {
        self.recompute_metrics_at(current_timestamp_ms())
    }

    /// Last computed aggregate metrics.
    pub fn statistics(&self) -> NetworkStatistics {
        self.inner.read().topology.statistics.clone()
    }
}
