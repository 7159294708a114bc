//! Failover engine.
//!
//! Each policy binds a primary resource to an ordered list of backups. A
//! backup that is serving one failover is never handed out to a second one
//! until a failback (automatic or explicit) releases it.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub name: String,
    pub primary: String,
    /// Tried in order
    pub backups: Vec<String>,
    #[serde(default)]
    pub auto_failback: bool,
    #[serde(default = "super::enabled")]
    pub enabled: bool,
}

impl FailoverPolicy {
    pub fn new(name: impl Into<String>, primary: impl Into<String>, backups: Vec<String>) -> Self {
        Self {
            name: name.into(),
            primary: primary.into(),
            backups,
            auto_failback: false,
            enabled: true,
        }
    }

    pub fn with_auto_failback(mut self) -> Self {
        self.auto_failback = true;
        self
    }
}

/// A primary currently served by a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveFailover {
    pub policy: String,
    pub primary: String,
    pub backup: String,
    pub since: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailoverDecisions {
    pub failovers: Vec<ActiveFailover>,
    /// Released automatically because the primary is healthy again
    pub failbacks: Vec<ActiveFailover>,
}

impl FailoverDecisions {
    pub fn is_empty(&self) -> bool {
        self.failovers.is_empty() && self.failbacks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailoverEventKind {
    Failover,
    Failback,
    /// Binding dropped because the failover could not be carried out
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverRecord {
    pub kind: FailoverEventKind,
    pub policy: String,
    pub primary: String,
    pub backup: String,
    pub timestamp: u64,
}

pub struct FailoverManager {
    policies: Vec<FailoverPolicy>,
    /// Keyed by primary
    active: BTreeMap<String, ActiveFailover>,
    history: VecDeque<FailoverRecord>,
    history_capacity: usize,
}

impl FailoverManager {
    pub fn new(policies: Vec<FailoverPolicy>, history_capacity: usize) -> Self {
        Self {
            policies,
            active: BTreeMap::new(),
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn add_policy(&mut self, policy: FailoverPolicy) {
        self.policies.retain(|p| p.name != policy.name);
        self.policies.push(policy);
    }

    pub fn set_policy_enabled(&mut self, name: &str, enabled: bool) -> MeshResult<()> {
        self.policies
            .iter_mut()
            .find(|p| p.name == name)
            .map(|p| p.enabled = enabled)
            .ok_or_else(|| MeshError::PolicyNotFound(name.to_string()))
    }

    pub fn policies(&self) -> &[FailoverPolicy] {
        &self.policies
    }

    /// Decide failovers and automatic failbacks from per-resource health.
    /// Resources missing from `health` count as unhealthy.
    pub fn evaluate_at(&mut self, health: &HashMap<String, bool>, now: u64) -> FailoverDecisions {
        let healthy = |id: &str| health.get(id).copied().unwrap_or(false);
        let mut decisions = FailoverDecisions::default();

        for policy in self.policies.iter().filter(|p| p.enabled) {
            if let Some(binding) = self.active.get(&policy.primary) {
                if policy.auto_failback && binding.policy == policy.name && healthy(&policy.primary) {
                    if let Some(released) = self.active.remove(&policy.primary) {
                        tracing::info!(primary = %released.primary, backup = %released.backup, "Automatic failback");
                        decisions.failbacks.push(released);
                    }
                }
                continue;
            }
            if healthy(&policy.primary) {
                continue;
            }

            let in_use: HashSet<&str> = self.active.values().map(|a| a.backup.as_str()).collect();
            let chosen = policy.backups.iter().find(|backup| {
                backup.as_str() != policy.primary
                    && !in_use.contains(backup.as_str())
                    && !self.active.contains_key(backup.as_str())
                    && healthy(backup)
            });
            match chosen {
                Some(backup) => {
                    let binding = ActiveFailover {
                        policy: policy.name.clone(),
                        primary: policy.primary.clone(),
                        backup: backup.clone(),
                        since: now,
                    };
                    tracing::warn!(primary = %binding.primary, backup = %binding.backup, policy = %binding.policy, "Failing over");
                    self.active.insert(policy.primary.clone(), binding.clone());
                    decisions.failovers.push(binding);
                }
                None => {
                    tracing::warn!(primary = %policy.primary, policy = %policy.name, "Primary unhealthy and no eligible backup")
                }
            }
        }

        for binding in &decisions.failovers {
            self.push_history(FailoverEventKind::Failover, binding, now);
        }
        for binding in &decisions.failbacks {
            self.push_history(FailoverEventKind::Failback, binding, now);
        }
        decisions
    }

    /// Release the backup serving `primary`.
    pub fn failback(&mut self, primary: &str, now: u64) -> MeshResult<ActiveFailover> {
        let released = self.active.remove(primary).ok_or_else(|| {
            MeshError::InvalidRequest(format!("{primary} is not in active failover"))
        })?;
        tracing::info!(primary, backup = %released.backup, "Manual failback");
        self.push_history(FailoverEventKind::Failback, &released, now);
        Ok(released)
    }

    /// Drop a binding whose failover could not be executed.
    pub fn abort(&mut self, primary: &str, now: u64) -> Option<ActiveFailover> {
        let aborted = self.active.remove(primary)?;
        self.push_history(FailoverEventKind::Aborted, &aborted, now);
        Some(aborted)
    }

    /// Whether `resource` is currently a failover target.
    pub fn is_in_active_failover(&self, resource: &str) -> bool {
        self.active.values().any(|a| a.backup == resource)
    }

    pub fn active_bindings(&self) -> Vec<ActiveFailover> {
        self.active.values().cloned().collect()
    }

    pub fn history(&self) -> Vec<FailoverRecord> {
        self.history.iter().cloned().collect()
    }

    fn push_history(&mut self, kind: FailoverEventKind, binding: &ActiveFailover, now: u64) {
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(FailoverRecord {
            kind,
            policy: binding.policy.clone(),
            primary: binding.primary.clone(),
            backup: binding.backup.clone(),
            timestamp: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(entries: &[(&str, bool)]) -> HashMap<String, bool> {
        entries.iter().map(|(id, h)| (id.to_string(), *h)).collect()
    }

    #[test]
    fn test_fails_over_to_first_healthy_backup() {
        let mut manager = FailoverManager::new(
            vec![FailoverPolicy::new("gw", "p", vec!["b1".into(), "b2".into()])],
            10,
        );
        let decisions = manager.evaluate_at(&health(&[("p", false), ("b1", false), ("b2", true)]), 5);
        assert_eq!(decisions.failovers.len(), 1);
        assert_eq!(decisions.failovers[0].backup, "b2");
        assert!(manager.is_in_active_failover("b2"));

        // already failed over: no second decision
        assert!(manager
            .evaluate_at(&health(&[("p", false), ("b1", true), ("b2", true)]), 6)
            .is_empty());
    }

    #[test]
    fn test_backup_is_exclusive() {
        let mut manager = FailoverManager::new(
            vec![
                FailoverPolicy::new("one", "p1", vec!["shared".into()]),
                FailoverPolicy::new("two", "p2", vec!["shared".into(), "spare".into()]),
            ],
            10,
        );
        let decisions = manager.evaluate_at(
            &health(&[("p1", false), ("p2", false), ("shared", true), ("spare", true)]),
            1,
        );
        let backups: Vec<_> = decisions.failovers.iter().map(|f| f.backup.as_str()).collect();
        assert_eq!(backups, vec!["shared", "spare"]);
    }

    #[test]
    fn test_no_backup_available_while_shared_in_use() {
        let mut manager = FailoverManager::new(
            vec![
                FailoverPolicy::new("one", "p1", vec!["shared".into()]),
                FailoverPolicy::new("two", "p2", vec!["shared".into()]),
            ],
            10,
        );
        let all_down = health(&[("p1", false), ("p2", false), ("shared", true)]);
        assert_eq!(manager.evaluate_at(&all_down, 1).failovers.len(), 1);
        assert!(manager.evaluate_at(&all_down, 2).failovers.is_empty());

        manager.failback("p1", 3).unwrap();
        let decisions = manager.evaluate_at(&all_down, 4);
        assert_eq!(decisions.failovers.len(), 1);
        assert_eq!(decisions.failovers[0].primary, "p1");
    }

    #[test]
    fn test_auto_failback() {
        let mut manager = FailoverManager::new(
            vec![FailoverPolicy::new("gw", "p", vec!["b".into()]).with_auto_failback()],
            10,
        );
        manager.evaluate_at(&health(&[("p", false), ("b", true)]), 1);
        let decisions = manager.evaluate_at(&health(&[("p", true), ("b", true)]), 2);
        assert_eq!(decisions.failbacks.len(), 1);
        assert!(!manager.is_in_active_failover("b"));

        let kinds: Vec<_> = manager.history().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![FailoverEventKind::Failover, FailoverEventKind::Failback]);
    }

    #[test]
    fn test_manual_failback_required_without_flag() {
        let mut manager =
            FailoverManager::new(vec![FailoverPolicy::new("gw", "p", vec!["b".into()])], 10);
        manager.evaluate_at(&health(&[("p", false), ("b", true)]), 1);
        assert!(manager.evaluate_at(&health(&[("p", true), ("b", true)]), 2).is_empty());
        assert!(manager.is_in_active_failover("b"));

        assert!(manager.failback("p", 3).is_ok());
        assert!(manager.failback("p", 4).is_err());
    }

    #[test]
    fn test_abort_releases_binding() {
        let mut manager =
            FailoverManager::new(vec![FailoverPolicy::new("gw", "p", vec!["b".into()])], 10);
        manager.evaluate_at(&health(&[("p", false), ("b", true)]), 1);
        assert!(manager.abort("p", 2).is_some());
        assert!(manager.active_bindings().is_empty());
        assert_eq!(manager.history().last().unwrap().kind, FailoverEventKind::Aborted);
    }
}
