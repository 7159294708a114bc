//! Auto-scaling engine.
//!
//! A policy fires once its trigger has held for the sustained duration, then
//! enters cooldown. While cooling down it stays silent even if the condition
//! is still true on every evaluation.

use super::TriggerCondition;
use crate::error::{MeshError, MeshResult};
use qmesh_core::elapsed_ms;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingDirection {
    /// Add links (more redundancy)
    ScaleOut,
    /// Retire a link
    ScaleIn,
    /// Raise a node's channel capacity
    ScaleUp,
    /// Lower a node's channel capacity
    ScaleDown,
}

impl ScalingDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingDirection::ScaleOut => "scale-out",
            ScalingDirection::ScaleIn => "scale-in",
            ScalingDirection::ScaleUp => "scale-up",
            ScalingDirection::ScaleDown => "scale-down",
        }
    }
}

fn one() -> u32 {
    1
}

/// What a policy does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingAction {
    pub direction: ScalingDirection,
    /// Node ID, or any other name to let the orchestrator choose a node
    pub resource: String,
    #[serde(default = "one")]
    pub amount: u32,
    /// New links must only go to secure-channel-ready nodes
    #[serde(default)]
    pub requires_secure_channel: bool,
}

impl ScalingAction {
    pub fn new(direction: ScalingDirection, resource: impl Into<String>) -> Self {
        Self {
            direction,
            resource: resource.into(),
            amount: 1,
            requires_secure_channel: false,
        }
    }

    pub fn amount(mut self, amount: u32) -> Self {
        self.amount = amount;
        self
    }

    pub fn secure(mut self) -> Self {
        self.requires_secure_channel = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub name: String,
    #[serde(default = "super::enabled")]
    pub enabled: bool,
    pub trigger: TriggerCondition,
    pub action: ScalingAction,
    #[serde(default)]
    pub cooldown_ms: u64,
}

/// An action proposed by one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedScaling {
    pub policy: String,
    pub action: ScalingAction,
    /// Metric value that satisfied the trigger
    pub observed: f64,
    pub proposed_at: u64,
}

/// Outcome of an executed scaling action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRecord {
    pub policy: String,
    pub action: ScalingAction,
    pub success: bool,
    pub detail: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingStatistics {
    pub policies: usize,
    pub enabled_policies: usize,
    pub evaluations: u64,
    pub proposed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct AutoScaler {
    policies: Vec<ScalingPolicy>,
    /// When each policy's condition started holding
    condition_since: HashMap<String, u64>,
    /// When each policy last fired
    last_scaled: HashMap<String, u64>,
    history: VecDeque<ScalingRecord>,
    history_capacity: usize,
    stats: ScalingStatistics,
}

impl AutoScaler {
    pub fn new(policies: Vec<ScalingPolicy>, history_capacity: usize) -> Self {
        Self {
            policies,
            condition_since: HashMap::new(),
            last_scaled: HashMap::new(),
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            stats: ScalingStatistics::default(),
        }
    }

    /// Add a policy, replacing any policy with the same name.
    pub fn add_policy(&mut self, policy: ScalingPolicy) {
        self.condition_since.remove(&policy.name);
        self.policies.retain(|p| p.name != policy.name);
        self.policies.push(policy);
    }

    pub fn set_policy_enabled(&mut self, name: &str, enabled: bool) -> MeshResult<()> {
        let policy = self
            .policies
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| MeshError::PolicyNotFound(name.to_string()))?;
        policy.enabled = enabled;
        if !enabled {
            self.condition_since.remove(name);
        }
        Ok(())
    }

    pub fn policies(&self) -> &[ScalingPolicy] {
        &self.policies
    }

    /// Evaluate every enabled policy against `metrics` at `now`.
    pub fn evaluate_at(&mut self, metrics: &HashMap<String, f64>, now: u64) -> Vec<ProposedScaling> {
        self.stats.evaluations += 1;
        let mut proposed = Vec::new();

        for policy in &self.policies {
            if !policy.enabled {
                continue;
            }
            let Some(observed) = policy.trigger.observe(metrics) else {
                self.condition_since.remove(&policy.name);
                continue;
            };
            let since = *self.condition_since.entry(policy.name.clone()).or_insert(now);
            if elapsed_ms(since, now) < policy.trigger.sustained_ms {
                continue;
            }
            if let Some(last) = self.last_scaled.get(&policy.name) {
                let remaining_ms = last.saturating_add(policy.cooldown_ms).saturating_sub(now);
                if remaining_ms > 0 {
                    tracing::debug!(policy = %policy.name, remaining_ms, "Scaling policy cooling down");
                    continue;
                }
            }

            self.last_scaled.insert(policy.name.clone(), now);
            tracing::info!(
                policy = %policy.name,
                direction = policy.action.direction.as_str(),
                resource = %policy.action.resource,
                metric = %policy.trigger.metric,
                observed,
                "Scaling policy fired"
            );
            proposed.push(ProposedScaling {
                policy: policy.name.clone(),
                action: policy.action.clone(),
                observed,
                proposed_at: now,
            });
        }

        self.stats.proposed += proposed.len() as u64;
        proposed
    }

    /// Record the outcome of an executed proposal.
    pub fn record(
        &mut self,
        proposal: &ProposedScaling,
        outcome: &MeshResult<String>,
        now: u64,
    ) -> ScalingRecord {
        let (success, detail) = match outcome {
            Ok(detail) => (true, detail.clone()),
            Err(e) => (false, e.to_string()),
        };
        if success {
            self.stats.succeeded += 1;
        } else {
            self.stats.failed += 1;
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        let record = ScalingRecord {
            policy: proposal.policy.clone(),
            action: proposal.action.clone(),
            success,
            detail,
            timestamp: now,
        };
        self.history.push_back(record.clone());
        record
    }

    /// Most recent records, newest last.
    pub fn history(&self) -> Vec<ScalingRecord> {
        self.history.iter().cloned().collect()
    }

    pub fn last_scaled(&self, policy: &str) -> Option<u64> {
        self.last_scaled.get(policy).copied()
    }

    pub fn statistics(&self) -> ScalingStatistics {
        ScalingStatistics {
            policies: self.policies.len(),
            enabled_policies: self.policies.iter().filter(|p| p.enabled).count(),
            ..self.stats.clone()
        }
    }
}
