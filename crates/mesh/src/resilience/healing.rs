//! Self-healing engine.
//!
//! A catalog of trigger to action bindings. Success rates are kept for
//! reporting only; they never influence which action is chosen.

use crate::alerts::AlertCategory;
use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use qmesh_core::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealingTrigger {
    NodeOffline,
    HighErrorRate,
    PerformanceDegradation,
    SecurityIncident,
    CapacityExhausted,
    ConnectionFailed,
}

impl HealingTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealingTrigger::NodeOffline => "node-offline",
            HealingTrigger::HighErrorRate => "high-error-rate",
            HealingTrigger::PerformanceDegradation => "performance-degradation",
            HealingTrigger::SecurityIncident => "security-incident",
            HealingTrigger::CapacityExhausted => "capacity-exhausted",
            HealingTrigger::ConnectionFailed => "connection-failed",
        }
    }
}

impl From<AlertCategory> for HealingTrigger {
    fn from(category: AlertCategory) -> Self {
        match category {
            AlertCategory::Performance => HealingTrigger::PerformanceDegradation,
            AlertCategory::Availability => HealingTrigger::NodeOffline,
            AlertCategory::ChannelQuality => HealingTrigger::HighErrorRate,
            AlertCategory::Security => HealingTrigger::SecurityIncident,
            AlertCategory::Capacity => HealingTrigger::CapacityExhausted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealingActionKind {
    /// Re-establish failed or degraded links with former peers
    ReconnectLinks,
    RotateKeys,
    RecomputeRoutes,
    EvictNode,
    /// Trust level to zero, channel marked not ready
    QuarantineNode,
}

impl HealingActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealingActionKind::ReconnectLinks => "reconnect-links",
            HealingActionKind::RotateKeys => "rotate-keys",
            HealingActionKind::RecomputeRoutes => "recompute-routes",
            HealingActionKind::EvictNode => "evict-node",
            HealingActionKind::QuarantineNode => "quarantine-node",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingBinding {
    pub trigger: HealingTrigger,
    pub action: HealingActionKind,
    /// Only automated bindings are run by [`SelfHealer::heal`]
    #[serde(default = "super::enabled")]
    pub automated: bool,
}

impl HealingBinding {
    pub fn new(trigger: HealingTrigger, action: HealingActionKind) -> Self {
        Self {
            trigger,
            action,
            automated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingRecord {
    pub trigger: HealingTrigger,
    pub action: HealingActionKind,
    pub target: String,
    pub success: bool,
    pub detail: String,
    pub timestamp: u64,
}

/// Attempts/successes of one binding over the healer's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingStatistics {
    pub trigger: HealingTrigger,
    pub action: HealingActionKind,
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
}

/// Carries out healing actions against the mesh.
#[async_trait]
pub trait HealingExecutor: Send + Sync {
    /// Run `action` against `target`; the returned string describes what was done.
    async fn execute(&self, action: HealingActionKind, target: &str) -> MeshResult<String>;
}

pub struct SelfHealer {
    bindings: RwLock<Vec<HealingBinding>>,
    history: Mutex<VecDeque<HealingRecord>>,
    history_capacity: usize,
    counters: Mutex<BTreeMap<(HealingTrigger, HealingActionKind), (u64, u64)>>,
}

impl SelfHealer {
    pub fn new(bindings: Vec<HealingBinding>, history_capacity: usize) -> Self {
        Self {
            bindings: RwLock::new(bindings),
            history: Mutex::new(VecDeque::new()),
            history_capacity: history_capacity.max(1),
            counters: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn bindings(&self) -> Vec<HealingBinding> {
        self.bindings.read().clone()
    }

    pub fn set_automated(
        &self,
        trigger: HealingTrigger,
        action: HealingActionKind,
        automated: bool,
    ) -> MeshResult<()> {
        let mut bindings = self.bindings.write();
        let binding = bindings
            .iter_mut()
            .find(|b| b.trigger == trigger && b.action == action)
            .ok_or_else(|| {
                MeshError::PolicyNotFound(format!("{} -> {}", trigger.as_str(), action.as_str()))
            })?;
        binding.automated = automated;
        Ok(())
    }

    /// Run the first automated action bound to `trigger` against `target`.
    /// Returns `None` when no automated binding matches.
    pub async fn heal(
        &self,
        trigger: HealingTrigger,
        target: &str,
        executor: &dyn HealingExecutor,
    ) -> Option<HealingRecord> {
        let action = self
            .bindings
            .read()
            .iter()
            .find(|b| b.trigger == trigger && b.automated)
            .map(|b| b.action)?;

        let outcome = executor.execute(action, target).await;
        let record = HealingRecord {
            trigger,
            action,
            target: target.to_string(),
            success: outcome.is_ok(),
            detail: match outcome {
                Ok(detail) => detail,
                Err(e) => e.to_string(),
            },
            timestamp: current_timestamp_ms(),
        };
        if record.success {
            tracing::info!(trigger = trigger.as_str(), action = action.as_str(), resource = target, "Healing action succeeded");
        } else {
            tracing::warn!(trigger = trigger.as_str(), action = action.as_str(), resource = target, error = %record.detail, "Healing action failed");
        }

        {
            let mut counters = self.counters.lock();
            let entry = counters.entry((trigger, action)).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += u64::from(record.success);
        }
        let mut history = self.history.lock();
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(record.clone());
        Some(record)
    }

    pub fn history(&self) -> Vec<HealingRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Success rate over the retained history, `None` before the first attempt.
    pub fn success_rate(&self) -> Option<f64> {
        let history = self.history.lock();
        if history.is_empty() {
            return None;
        }
        let successes = history.iter().filter(|r| r.success).count();
        Some(successes as f64 / history.len() as f64)
    }

    pub fn binding_statistics(&self) -> Vec<BindingStatistics> {
        self.counters
            .lock()
            .iter()
            .map(|(&(trigger, action), &(attempts, successes))| BindingStatistics {
                trigger,
                action,
                attempts,
                successes,
                success_rate: successes as f64 / attempts.max(1) as f64,
            })
            .collect()
    }
}
