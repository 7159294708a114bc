//! Resilience control loops.
//!
//! Auto-scaling, failover and self-healing are independent engines. None of
//! them touches the topology: they keep their own evaluation state and hand
//! proposed actions to the orchestrator, which executes them.

pub mod failover;
pub mod healing;
pub mod scaling;

use crate::error::{MeshError, MeshResult};
use failover::FailoverPolicy;
use healing::{HealingActionKind, HealingBinding, HealingTrigger};
use scaling::{ScalingAction, ScalingDirection, ScalingPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// How a metric is compared against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Comparator {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

impl Comparator {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::GreaterThan => value > threshold,
            Comparator::GreaterOrEqual => value >= threshold,
            Comparator::LessThan => value < threshold,
            Comparator::LessOrEqual => value <= threshold,
        }
    }
}

/// A metric condition that must hold for `sustained_ms` before it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    #[serde(default)]
    pub sustained_ms: u64,
}

impl TriggerCondition {
    pub fn new(metric: impl Into<String>, comparator: Comparator, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            comparator,
            threshold,
            sustained_ms: 0,
        }
    }

    pub fn sustained_for(mut self, sustained_ms: u64) -> Self {
        self.sustained_ms = sustained_ms;
        self
    }

    /// Observed value of the metric, if the condition holds for it. A missing
    /// metric never satisfies a condition.
    pub fn observe(&self, metrics: &HashMap<String, f64>) -> Option<f64> {
        metrics
            .get(&self.metric)
            .copied()
            .filter(|value| self.comparator.holds(*value, self.threshold))
    }
}

fn enabled() -> bool {
    true
}

/// All control-loop policies, as loaded at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySet {
    pub auto_scaling: Vec<ScalingPolicy>,
    pub failover: Vec<FailoverPolicy>,
    pub healing: Vec<HealingBinding>,
}

#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: PolicySet,
}

impl PolicySet {
    /// Parse the `[policies]` table of a TOML document. Sections that are
    /// absent keep their built-in defaults.
    pub fn from_toml_str(content: &str) -> MeshResult<Self> {
        let file: PolicyFile =
            toml::from_str(content).map_err(|e| MeshError::Config(e.to_string()))?;
        Ok(file.policies)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Built-in self-healing catalog.
    pub fn default_healing_catalog() -> Vec<HealingBinding> {
        use HealingActionKind::*;
        use HealingTrigger::*;
        [
            (NodeOffline, RecomputeRoutes),
            (HighErrorRate, RotateKeys),
            (ConnectionFailed, ReconnectLinks),
            (SecurityIncident, QuarantineNode),
            (PerformanceDegradation, RecomputeRoutes),
            (CapacityExhausted, RecomputeRoutes),
        ]
        .into_iter()
        .map(|(trigger, action)| HealingBinding::new(trigger, action))
        .collect()
    }

    /// Built-in auto-scaling policies acting on the mesh as a whole.
    pub fn default_scaling_policies() -> Vec<ScalingPolicy> {
        vec![
            ScalingPolicy {
                name: "load-scale-out".into(),
                enabled: true,
                trigger: TriggerCondition::new("average_load", Comparator::GreaterThan, 0.8)
                    .sustained_for(60_000),
                action: ScalingAction::new(ScalingDirection::ScaleOut, "mesh").secure(),
                cooldown_ms: 300_000,
            },
            ScalingPolicy {
                name: "redundancy-scale-out".into(),
                enabled: true,
                trigger: TriggerCondition::new("network_reliability", Comparator::LessThan, 0.9)
                    .sustained_for(120_000),
                action: ScalingAction::new(ScalingDirection::ScaleOut, "mesh").secure(),
                cooldown_ms: 600_000,
            },
        ]
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            auto_scaling: Self::default_scaling_policies(),
            failover: Vec::new(),
            healing: Self::default_healing_catalog(),
        }
    }
}
