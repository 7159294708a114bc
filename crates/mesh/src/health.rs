//! Health monitor.
//!
//! Each pass checks every non-local node and every connection against the
//! liveness window and the error-rate threshold:
//!
//! - a node unseen for `offline_multiplier` health intervals goes offline and
//!   all of its connections fail;
//! - a node whose error rate exceeds the threshold loses
//!   `secure_channel_ready` but stays in the topology;
//! - an active connection above the threshold degrades, a degraded one back
//!   under it recovers.
//!
//! The pass finishes by recomputing aggregate metrics.

use crate::link::ConnectionStatus;
use crate::node::NodeId;
use crate::topology::{NetworkStatistics, TopologyStore};
use qmesh_core::{
    current_timestamp_ms, elapsed_ms, EventBuilder, EventKind, EventSeverity, HealthConfig,
};
use qmesh_crypto::SessionId;
use serde::{Deserialize, Serialize};

/// What a health pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Nodes that went offline in this pass
    pub offline: Vec<NodeId>,
    /// Nodes that lost secure-channel readiness
    pub untrusted_channels: Vec<NodeId>,
    /// Nodes whose channels became usable again
    pub restored_channels: Vec<NodeId>,
    pub degraded_connections: Vec<String>,
    pub recovered_connections: Vec<String>,
    /// Live connections whose session key is due for rotation
    pub rotation_due: Vec<String>,
    /// Sessions of connections failed by this pass, for the owner of the
    /// secure-channel provider to close
    pub released_sessions: Vec<SessionId>,
    pub statistics: NetworkStatistics,
}

impl HealthReport {
    /// Whether the pass changed anything.
    pub fn has_changes(&self) -> bool {
        !(self.offline.is_empty()
            && self.untrusted_channels.is_empty()
            && self.restored_channels.is_empty()
            && self.degraded_connections.is_empty()
            && self.recovered_connections.is_empty())
    }
}

/// Periodic liveness and channel-quality checks.
pub struct HealthMonitor {
    store: TopologyStore,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(store: TopologyStore, config: HealthConfig) -> Self {
        Self { store, config }
    }

    pub fn error_rate_threshold(&self) -> f64 {
        self.config.error_rate_threshold
    }

    /// Run one health pass now.
    pub fn run_cycle(&self) -> HealthReport {
        self.run_cycle_at(current_timestamp_ms())
    }

    /// Run one health pass at `now`.
    pub fn run_cycle_at(&self, now: u64) -> HealthReport {
        let threshold = self.config.error_rate_threshold;
        let offline_after = self.config.offline_after_ms();
        let mut report = HealthReport::default();

        let snapshot = self.store.snapshot();
        for node in snapshot.nodes.values().filter(|n| !n.is_local) {
            if node.status.online && elapsed_ms(node.status.last_seen, now) > offline_after {
                match self.store.mark_node_offline(&node.id, now) {
                    Ok(offline) => {
                        let failed = offline.failed_connections;
                        tracing::warn!(node_id = %node.id, failed_connections = failed.len(), "Node offline");
                        self.store.append_event(
                            EventBuilder::new(EventKind::NodeLeft, "health")
                                .at(now)
                                .severity(EventSeverity::Warning)
                                .entity(node.id.clone())
                                .message(format!("{} unseen for more than {offline_after} ms", node.id))
                                .payload("failed_connections", failed.len())
                                .build(),
                        );
                        for id in failed {
                            self.store.append_event(
                                EventBuilder::new(EventKind::ConnectionFailed, "health")
                                    .at(now)
                                    .severity(EventSeverity::Warning)
                                    .entity(id.clone())
                                    .entity(node.id.clone())
                                    .message(format!("{id} failed: endpoint {} offline", node.id))
                                    .build(),
                            );
                        }
                        report.released_sessions.extend(offline.released_sessions);
                        report.offline.push(node.id.clone());
                    }
                    Err(e) => tracing::debug!(node_id = %node.id, error = %e, "Node vanished during health pass"),
                }
                continue;
            }

            let error_rate = node.status.error_rate;
            if error_rate > threshold && node.status.secure_channel_ready {
                let changed = self
                    .store
                    .update_node_status(&node.id, |status| {
                        std::mem::replace(&mut status.secure_channel_ready, false)
                    })
                    .unwrap_or(false);
                if changed {
                    tracing::warn!(node_id = %node.id, error_rate, threshold, "Channel error rate above threshold");
                    self.store.append_event(
                        EventBuilder::new(EventKind::ChannelError, "health")
                            .at(now)
                            .severity(EventSeverity::Error)
                            .entity(node.id.clone())
                            .message(format!("{} error rate {error_rate:.4} above {threshold}", node.id))
                            .payload("error_rate", error_rate)
                            .build(),
                    );
                    report.untrusted_channels.push(node.id.clone());
                }
            } else if error_rate <= threshold
                && node.status.online
                && !node.status.secure_channel_ready
                && node.trust.trust_level > 0.0
            {
                let restored = self
                    .store
                    .update_node_status(&node.id, |status| {
                        !std::mem::replace(&mut status.secure_channel_ready, true)
                    })
                    .unwrap_or(false);
                if restored {
                    tracing::info!(node_id = %node.id, error_rate, "Channel error rate back under threshold");
                    report.restored_channels.push(node.id.clone());
                }
            }
        }

        for conn in snapshot.connections.values() {
            if report.offline.iter().any(|id| conn.involves(id)) {
                continue;
            }
            let error_rate = conn.quality.error_rate;
            let transition = match conn.status {
                ConnectionStatus::Active if error_rate > threshold => Some(ConnectionStatus::Degraded),
                ConnectionStatus::Degraded if error_rate <= threshold => Some(ConnectionStatus::Active),
                _ => None,
            };
            if let Some(next) = transition {
                if self.store.set_connection_status(&conn.id, next, now).is_ok() {
                    let (kind, severity) = if next == ConnectionStatus::Degraded {
                        report.degraded_connections.push(conn.id.clone());
                        (EventKind::ConnectionDegraded, EventSeverity::Warning)
                    } else {
                        report.recovered_connections.push(conn.id.clone());
                        (EventKind::ConnectionRecovered, EventSeverity::Info)
                    };
                    self.store.append_event(
                        EventBuilder::new(kind, "health")
                            .at(now)
                            .severity(severity)
                            .entity(conn.id.clone())
                            .entity(conn.source.clone())
                            .entity(conn.target.clone())
                            .message(format!("{} is now {next:?}", conn.id))
                            .payload("error_rate", error_rate)
                            .build(),
                    );
                }
            }
            if conn.status.is_live() && conn.security.rotation_due(now) {
                report.rotation_due.push(conn.id.clone());
            }
        }

        report.statistics = self.store.recompute_metrics_at(now);
        tracing::debug!(
            offline = report.offline.len(),
            degraded = report.degraded_connections.len(),
            rotation_due = report.rotation_due.len(),
            "Health pass complete"
        );
        report
    }
}
