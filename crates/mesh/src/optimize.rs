//! Heuristic optimisation suggestions. Read-only: nothing here changes the
//! topology.

use crate::link::ConnectionStatus;
use crate::topology::Topology;
use serde::{Deserialize, Serialize};

/// Load above which a node is considered overloaded.
pub const OVERLOAD_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestionKind {
    /// Node hangs off a single live link
    AddRedundancy,
    /// Link error rate is approaching the health threshold
    RotateKeys,
    /// Node is overloaded
    ScaleOut,
    /// Online node with no live link at all
    ConnectIsolated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub kind: SuggestionKind,
    pub targets: Vec<String>,
    pub message: String,
}

/// Suggestions for `topology`, given the health monitor's error-rate
/// threshold. Links are flagged at half of it.
pub fn suggest_optimizations(topology: &Topology, error_rate_threshold: f64) -> Vec<OptimizationSuggestion> {
    let mut suggestions = Vec::new();
    let online_count = topology.nodes.values().filter(|n| n.status.online).count();

    for node in topology.nodes.values().filter(|n| n.status.online) {
        let live = topology.live_connections_of(&node.id).len();
        if live == 0 && online_count > 1 {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::ConnectIsolated,
                targets: vec![node.id.clone()],
                message: format!("{} is online but has no live connection", node.id),
            });
        } else if live == 1 && online_count > 2 {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::AddRedundancy,
                targets: vec![node.id.clone()],
                message: format!("{} depends on a single connection", node.id),
            });
        }
        if node.status.load > OVERLOAD_THRESHOLD {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::ScaleOut,
                targets: vec![node.id.clone()],
                message: format!("{} load {:.2} above {OVERLOAD_THRESHOLD}", node.id, node.status.load),
            });
        }
    }

    let warning = error_rate_threshold / 2.0;
    for conn in topology
        .connections
        .values()
        .filter(|c| c.status == ConnectionStatus::Active && c.quality.error_rate > warning)
    {
        suggestions.push(OptimizationSuggestion {
            kind: SuggestionKind::RotateKeys,
            targets: vec![conn.id.clone(), conn.source.clone(), conn.target.clone()],
            message: format!(
                "{} error rate {:.4} is over half the {error_rate_threshold} limit",
                conn.id, conn.quality.error_rate
            ),
        });
    }

    suggestions
}
