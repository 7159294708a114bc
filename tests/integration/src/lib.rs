//! Integration tests for the qmesh orchestration core
//!
//! This test suite validates:
//! - Topology consistency across node removal and link establishment
//! - Route computation over links negotiated through a secure-channel provider
//! - Discovery of signed beacons and eviction of stale nodes
//! - Alert dispatch into the scaling, failover and self-healing loops

pub mod test_utils;

#[cfg(test)]
mod topology_scenarios;

#[cfg(test)]
mod discovery_scenarios;

#[cfg(test)]
mod resilience_scenarios;
