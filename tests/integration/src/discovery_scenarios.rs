//! Discovery of signed beacons, liveness and stale-node eviction.

use crate::test_utils::{unit_cost_metrics, MeshHarness, TestPeer, T0};
use qmesh_core::EventKind;
use qmesh_mesh::node::HANDSHAKE_TRUST_LEVEL;

#[tokio::test]
async fn test_signed_beacons_join_the_mesh() {
    let mesh = MeshHarness::new("local");
    let alpha = TestPeer::new("alpha", 47801);
    let beta = TestPeer::new("beta", 47802);
    mesh.transport.upsert(alpha.beacon(T0));
    mesh.transport.upsert(beta.beacon(T0));
    mesh.transport.upsert(mesh.local.beacon(T0));

    let report = mesh.discovery.run_cycle_at(T0).await.unwrap();

    assert_eq!(report.candidates, 3);
    assert_eq!(report.joined, vec!["alpha", "beta"]);
    assert!(report.rejected.is_empty());
    assert_eq!(mesh.store.node_count(), 3);

    let alpha_node = mesh.store.node("alpha").unwrap();
    assert!(alpha_node.status.secure_channel_ready);
    assert!(alpha_node.trust.attestation_valid);
    assert_eq!(alpha_node.trust.trust_level, HANDSHAKE_TRUST_LEVEL);
    assert_eq!(alpha_node.address, alpha.address);

    let mut added = mesh.registry.added.lock().clone();
    added.sort();
    assert_eq!(added, vec!["alpha", "beta"]);
    assert_eq!(mesh.store.events_of_kind(EventKind::NodeJoined).len(), 2);
    // handshake sessions are closed once verified
    assert_eq!(mesh.channel.open_sessions(), 0);

    // second cycle only refreshes
    let report = mesh.discovery.run_cycle_at(T0 + 30_000).await.unwrap();
    assert!(report.joined.is_empty());
    assert_eq!(report.refreshed.len(), 2);
    assert_eq!(mesh.store.node("beta").unwrap().status.last_seen, T0 + 30_000);
}

#[tokio::test]
async fn test_forged_beacon_and_failed_handshake_are_rejected() {
    let mesh = MeshHarness::new("local");
    let honest = TestPeer::new("honest", 47801);
    let forger = TestPeer::new("forged", 47802);
    let shy = TestPeer::new("shy", 47803);

    let mut forged = forger.beacon(T0);
    forged.address = "203.0.113.66:47800".to_string();
    mesh.transport.upsert(honest.beacon(T0));
    mesh.transport.upsert(forged);
    mesh.transport.upsert(shy.beacon(T0));
    mesh.channel.fail("shy");

    let report = mesh.discovery.run_cycle_at(T0).await.unwrap();

    assert_eq!(report.joined, vec!["honest"]);
    assert_eq!(report.rejected, vec!["forged"]);
    assert_eq!(report.handshake_failed, vec!["shy"]);
    assert!(mesh.store.node("forged").is_none());
    assert!(mesh.store.node("shy").is_none());
    assert_eq!(mesh.store.events_of_kind(EventKind::ChannelError).len(), 2);

    // a later cycle admits the peer once its channel works
    mesh.channel.heal("shy");
    let report = mesh.discovery.run_cycle_at(T0 + 1_000).await.unwrap();
    assert_eq!(report.joined, vec!["shy"]);
}

#[tokio::test]
async fn test_silent_node_goes_offline_then_is_evicted() {
    let mesh = MeshHarness::new("local");
    let quiet = TestPeer::new("quiet", 47801);
    let chatty = TestPeer::new("chatty", 47802);
    mesh.transport.upsert(quiet.beacon(T0));
    mesh.transport.upsert(chatty.beacon(T0));
    mesh.discovery.run_cycle_at(T0).await.unwrap();
    let link = mesh.link("local", "quiet", unit_cost_metrics(), T0).await;
    mesh.link("local", "chatty", unit_cost_metrics(), T0).await;
    assert_eq!(mesh.channel.open_sessions(), 2);

    // quiet stops answering, chatty keeps refreshing
    mesh.transport.remove("quiet");
    mesh.discovery.run_cycle_at(T0 + 30_000).await.unwrap();
    mesh.discovery.run_cycle_at(T0 + 60_000).await.unwrap();

    // exactly 60 s unseen is still online
    let report = mesh.health.run_cycle_at(T0 + 60_000);
    assert!(report.offline.is_empty());

    let report = mesh.health.run_cycle_at(T0 + 60_001);
    assert_eq!(report.offline, vec!["quiet"]);
    let quiet_node = mesh.store.node("quiet").unwrap();
    assert!(!quiet_node.status.online);
    assert!(mesh.store.node("chatty").unwrap().status.online);
    assert!(!mesh.store.connection(&link.id).unwrap().status.is_live());

    // exactly 90 s unseen is not yet stale
    assert!(mesh.discovery.sweep_stale_at(T0 + 90_000).await.is_empty());

    let report = mesh.discovery.run_cycle_at(T0 + 90_001).await.unwrap();
    assert_eq!(report.evicted, vec!["quiet"]);
    assert!(mesh.store.node("quiet").is_none());
    assert!(mesh.store.connection(&link.id).is_none());
    assert_eq!(mesh.registry.removed.lock().clone(), vec!["quiet"]);
    // eviction closed the session of the removed link
    assert_eq!(mesh.channel.open_sessions(), 1);

    // the local node is never swept
    let evicted = mesh.discovery.sweep_stale_at(T0 + 10_000_000).await;
    assert_eq!(evicted, vec!["chatty"]);
    assert!(mesh.store.node("local").is_some());
    assert_eq!(mesh.channel.open_sessions(), 0);
}
