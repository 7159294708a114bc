//! Quality-aware multi-hop routing.
//!
//! Each cycle takes one snapshot of the topology and recomputes the whole
//! route table with Dijkstra, once per source node, over active connections
//! only. Edge cost rewards key rate and reliability and penalises distance
//! and error rate:
//!
//! ```text
//! cost = distance_km + error_rate * 100 - ln(key_rate + 1) * 0.1 - reliability * 0.5
//! ```
//!
//! floored at [`MIN_EDGE_COST`]. Along a path, cost, distance and latency are
//! summed, key rate and reliability take the bottleneck (minimum) and error
//! rate is the mean of the edges.
//!
//! Ties are deterministic: lower cost wins (within 1e-9), then fewer hops,
//! then the path found first. Neighbours are expanded in ascending node ID
//! order, so "found first" does not depend on map iteration order.
//!
//! For every target a backup route is also computed with the primary's first
//! connection removed from the graph.

use crate::link::{Connection, ConnectionStatus, ConnectionType};
use crate::node::NodeId;
use crate::topology::{Topology, TopologyStore};
use qmesh_core::{current_timestamp_ms, EventBuilder, EventKind};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// Weight applied to the error rate.
pub const ERROR_RATE_WEIGHT: f64 = 100.0;
/// Bonus per unit of `ln(key_rate + 1)`.
pub const RATE_BONUS: f64 = 0.1;
/// Bonus per unit of reliability.
pub const RELIABILITY_BONUS: f64 = 0.5;
/// Lowest cost an edge can have.
pub const MIN_EDGE_COST: f64 = 1e-3;

const COST_EPSILON: f64 = 1e-9;

/// Cost of traversing one connection.
pub fn edge_cost(connection: &Connection) -> f64 {
    let quality = &connection.quality;
    let cost = quality.distance_km + quality.error_rate * ERROR_RATE_WEIGHT
        - (quality.key_rate.max(0.0) + 1.0).ln() * RATE_BONUS
        - connection.qos.reliability * RELIABILITY_BONUS;
    cost.max(MIN_EDGE_COST)
}

/// Shape of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteType {
    /// One direct connection
    Direct,
    /// Several direct connections
    MultiHop,
    /// Uses at least one relayed or fallback connection
    Hybrid,
}

/// Route status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteStatus {
    Active,
    Backup,
    /// Crosses a node that went offline or was removed
    Failed,
}

/// Aggregate metrics along a path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub cost: f64,
    pub distance_km: f64,
    pub latency_ms: f64,
    /// Minimum reliability along the path
    pub reliability: f64,
    /// Bottleneck key rate along the path
    pub min_key_rate: f64,
    /// Mean error rate of the edges
    pub average_error_rate: f64,
}

/// A computed route. Derived data; superseded every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub source: NodeId,
    pub target: NodeId,
    /// Node IDs from source to target inclusive
    pub path: Vec<NodeId>,
    /// Connection IDs between consecutive path nodes
    pub connections: Vec<String>,
    pub route_type: RouteType,
    pub metrics: RouteMetrics,
    pub status: RouteStatus,
    /// Computation time (Unix epoch milliseconds)
    pub computed_at: u64,
}

impl Route {
    fn from_edges(path: Vec<NodeId>, edges: &[&Connection], status: RouteStatus, now: u64) -> Self {
        let hybrid = edges
            .iter()
            .any(|c| c.connection_type != ConnectionType::Direct);
        let route_type = match (hybrid, edges.len()) {
            (true, _) => RouteType::Hybrid,
            (false, 1) => RouteType::Direct,
            (false, _) => RouteType::MultiHop,
        };
        let metrics = RouteMetrics {
            cost: edges.iter().map(|c| edge_cost(c)).sum(),
            distance_km: edges.iter().map(|c| c.quality.distance_km).sum(),
            latency_ms: edges.iter().map(|c| c.qos.latency_ms).sum(),
            reliability: edges
                .iter()
                .map(|c| c.qos.reliability)
                .fold(f64::INFINITY, f64::min),
            min_key_rate: edges
                .iter()
                .map(|c| c.quality.key_rate)
                .fold(f64::INFINITY, f64::min),
            average_error_rate: edges.iter().map(|c| c.quality.error_rate).sum::<f64>()
                / edges.len() as f64,
        };
        Self {
            source: path[0].clone(),
            target: path[path.len() - 1].clone(),
            path,
            connections: edges.iter().map(|c| c.id.clone()).collect(),
            route_type,
            metrics,
            status,
            computed_at: now,
        }
    }

    /// Number of connections traversed.
    pub fn hop_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether the path visits `node_id`.
    pub fn traverses(&self, node_id: &str) -> bool {
        self.path.iter().any(|id| id == node_id)
    }
}

struct Edge<'a> {
    to: &'a str,
    connection: &'a Connection,
    cost: f64,
}

/// Active-edge graph with neighbours sorted by node ID.
struct Graph<'a> {
    adjacency: BTreeMap<&'a str, Vec<Edge<'a>>>,
}

impl<'a> Graph<'a> {
    fn build(topology: &'a Topology) -> Self {
        let mut adjacency: BTreeMap<&'a str, Vec<Edge<'a>>> = BTreeMap::new();
        for conn in topology.connections.values() {
            if conn.status != ConnectionStatus::Active
                || !topology.nodes.contains_key(&conn.source)
                || !topology.nodes.contains_key(&conn.target)
            {
                continue;
            }
            let cost = edge_cost(conn);
            for (from, to) in [(&conn.source, &conn.target), (&conn.target, &conn.source)] {
                adjacency.entry(from.as_str()).or_default().push(Edge {
                    to: to.as_str(),
                    connection: conn,
                    cost,
                });
            }
        }
        for edges in adjacency.values_mut() {
            edges.sort_by(|a, b| a.to.cmp(b.to).then_with(|| a.connection.id.cmp(&b.connection.id)));
        }
        Self { adjacency }
    }

    fn neighbours(&self, node: &str) -> &[Edge<'a>] {
        self.adjacency.get(node).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct Label<'a> {
    cost: f64,
    hops: usize,
    previous: Option<(&'a str, &'a Connection)>,
}

struct QueueEntry<'a> {
    cost: f64,
    hops: usize,
    seq: u64,
    node: &'a str,
}

impl PartialEq for QueueEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry<'_> {}

impl PartialOrd for QueueEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry<'_> {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.hops.cmp(&self.hops))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Single-source shortest paths, skipping `excluded` connection if given.
fn shortest_paths<'a>(
    graph: &Graph<'a>,
    source: &'a str,
    excluded: Option<&str>,
) -> HashMap<&'a str, Label<'a>> {
    let mut labels: HashMap<&'a str, Label<'a>> = HashMap::new();
    let mut settled: HashSet<&'a str> = HashSet::new();
    let mut queue = BinaryHeap::new();
    let mut seq = 0u64;

    labels.insert(
        source,
        Label {
            cost: 0.0,
            hops: 0,
            previous: None,
        },
    );
    queue.push(QueueEntry {
        cost: 0.0,
        hops: 0,
        seq,
        node: source,
    });

    while let Some(entry) = queue.pop() {
        if !settled.insert(entry.node) {
            continue;
        }
        // Expand from the stored label; it can beat the entry within epsilon.
        let (base_cost, base_hops) = match labels.get(entry.node) {
            Some(label) => (label.cost, label.hops),
            None => (entry.cost, entry.hops),
        };
        for edge in graph.neighbours(entry.node) {
            if excluded == Some(edge.connection.id.as_str()) || settled.contains(edge.to) {
                continue;
            }
            let cost = base_cost + edge.cost;
            let hops = base_hops + 1;
            let better = match labels.get(edge.to) {
                None => true,
                Some(label) => {
                    cost < label.cost - COST_EPSILON
                        || ((cost - label.cost).abs() <= COST_EPSILON && hops < label.hops)
                }
            };
            if better {
                labels.insert(
                    edge.to,
                    Label {
                        cost,
                        hops,
                        previous: Some((entry.node, edge.connection)),
                    },
                );
                seq += 1;
                queue.push(QueueEntry {
                    cost,
                    hops,
                    seq,
                    node: edge.to,
                });
            }
        }
    }
    labels
}

fn trace_path<'a>(
    labels: &HashMap<&'a str, Label<'a>>,
    target: &'a str,
) -> Option<(Vec<NodeId>, Vec<&'a Connection>)> {
    let mut path = vec![target.to_string()];
    let mut edges = Vec::new();
    let mut current = target;
    while let Some((previous, connection)) = labels.get(current)?.previous {
        edges.push(connection);
        path.push(previous.to_string());
        current = previous;
    }
    if edges.is_empty() {
        return None;
    }
    path.reverse();
    edges.reverse();
    Some((path, edges))
}

/// Routes from `source` to every reachable node, sorted by target, each
/// followed by its backup when one exists.
pub fn compute_routes_from(topology: &Topology, source: &str, now: u64) -> Vec<Route> {
    let graph = Graph::build(topology);
    let Some((source, _)) = topology.nodes.get_key_value(source) else {
        return Vec::new();
    };
    let labels = shortest_paths(&graph, source.as_str(), None);

    let mut targets: Vec<&str> = labels.keys().copied().filter(|t| *t != source.as_str()).collect();
    targets.sort_unstable();

    let mut routes = Vec::new();
    for target in targets {
        let Some((path, edges)) = trace_path(&labels, target) else {
            continue;
        };
        let first_hop = edges[0].id.clone();
        routes.push(Route::from_edges(path, &edges, RouteStatus::Active, now));

        let alternative = shortest_paths(&graph, source.as_str(), Some(first_hop.as_str()));
        if let Some((path, edges)) = trace_path(&alternative, target) {
            routes.push(Route::from_edges(path, &edges, RouteStatus::Backup, now));
        }
    }
    routes
}

/// The full route table for every node of the topology.
pub fn compute_routing_table(topology: &Topology, now: u64) -> BTreeMap<String, Vec<Route>> {
    topology
        .nodes
        .keys()
        .map(|source| (source.clone(), compute_routes_from(topology, source, now)))
        .collect()
}

/// Summary of one routing cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingReport {
    pub sources: usize,
    pub active_routes: usize,
    pub backup_routes: usize,
    /// Routes dropped because the topology moved on during the cycle
    pub rejected_routes: usize,
    pub changed_sources: Vec<String>,
}

/// Periodic full recomputation of the route table.
pub struct RoutingProtocol {
    store: TopologyStore,
}

impl RoutingProtocol {
    pub fn new(store: TopologyStore) -> Self {
        Self { store }
    }

    /// Run one routing cycle now.
    pub fn run_cycle(&self) -> RoutingReport {
        self.run_cycle_at(current_timestamp_ms())
    }

    /// Run one routing cycle against a single snapshot.
    pub fn run_cycle_at(&self, now: u64) -> RoutingReport {
        let snapshot = self.store.snapshot();
        let table = compute_routing_table(&snapshot, now);
        let mut report = RoutingReport {
            sources: table.len(),
            ..Default::default()
        };

        for (source, routes) in table {
            let active = routes.iter().filter(|r| r.status == RouteStatus::Active).count();
            let backups = routes.len() - active;
            match self.store.replace_routes_for_source(&source, routes) {
                Ok(replacement) => {
                    report.active_routes += active;
                    report.backup_routes += backups;
                    report.rejected_routes += replacement.rejected;
                    if replacement.changed {
                        self.store.append_event(
                            EventBuilder::new(EventKind::RouteChanged, "routing")
                                .at(now)
                                .entity(source.clone())
                                .message(format!("routes from {source} changed"))
                                .payload("routes", replacement.accepted)
                                .build(),
                        );
                        report.changed_sources.push(source);
                    }
                }
                Err(e) if e.is_unknown_entity() => {
                    tracing::debug!(source = %source, "Source left the topology during routing");
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Failed to store routes");
                }
            }
        }

        self.store.recompute_metrics_at(now);
        tracing::debug!(
            sources = report.sources,
            active = report.active_routes,
            changed = report.changed_sources.len(),
            "Routing cycle complete"
        );
        report
    }
}
