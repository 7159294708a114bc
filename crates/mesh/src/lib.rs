//! qmesh Mesh - orchestration core for secured mesh networks
//!
//! Discovers nodes, establishes secured links between them, keeps a live
//! topology, computes quality-aware routes and reacts to degradation.
//!
//! # Core Components
//!
//! - **Topology Store**: canonical in-memory graph of nodes, connections and routes
//! - **Discovery**: signed beacons, secure handshakes, stale-node sweeps
//! - **Connection Establishment**: links keyed through the secure-channel provider
//! - **Routing**: full Dijkstra recomputation over active links with a composite cost
//! - **Health Monitor**: liveness and error-rate checks, key rotation scheduling
//! - **Resilience**: auto-scaling, failover and self-healing control loops
//! - **Orchestrator**: periodic cycles, alert dispatch and aggregate status
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use qmesh_core::Config;
//! use qmesh_mesh::Orchestrator;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::builder(Config::default()).build()?;
//! orchestrator.start().await?;
//!
//! let status = orchestrator.status();
//! println!("overall: {:?}", status.overall);
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod health;
pub mod link;
pub mod node;
pub mod optimize;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod routing;
pub mod scheduler;
pub mod topology;

// Re-export main types
pub use alerts::{Alert, AlertCategory, AlertSeverity, AlertSource};
pub use connection::ConnectionEstablisher;
pub use discovery::{
    BeaconMessage, BeaconResponder, BeaconTransport, DiscoveryBeacon, DiscoveryProtocol,
    DiscoveryReport, StaticBeaconTransport, UdpBeaconTransport,
};
pub use error::{MeshError, MeshResult};
pub use health::{HealthMonitor, HealthReport};
pub use link::{
    ChannelQuality, Connection, ConnectionStatus, ConnectionType, QosStats, SecurityBinding,
    TrafficCounters,
};
pub use node::{Node, NodeCapabilities, NodeId, NodeStatus, NodeTrust};
pub use optimize::{suggest_optimizations, OptimizationSuggestion, SuggestionKind};
pub use orchestrator::{
    AlertDispatch, ComponentState, Orchestrator, OrchestratorBuilder, OrchestratorStatus,
};
pub use registry::{NoopRegistry, RegistryNotifier, ServiceRegistry};
pub use resilience::failover::{ActiveFailover, FailoverDecisions, FailoverManager, FailoverPolicy};
pub use resilience::healing::{
    HealingActionKind, HealingBinding, HealingExecutor, HealingRecord, HealingTrigger, SelfHealer,
};
pub use resilience::scaling::{
    AutoScaler, ProposedScaling, ScalingAction, ScalingDirection, ScalingPolicy, ScalingRecord,
};
pub use resilience::{Comparator, PolicySet, TriggerCondition};
pub use routing::{
    compute_routing_table, edge_cost, Route, RouteMetrics, RouteStatus, RouteType,
    RoutingProtocol, RoutingReport,
};
pub use scheduler::spawn_periodic;
pub use topology::{NetworkStatistics, NodeOffline, NodeRemoval, Topology, TopologyStore};
