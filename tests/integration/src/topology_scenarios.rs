//! Topology, connection and routing scenarios over a shared store.

use crate::test_utils::{metrics, unit_cost_metrics, MeshHarness, T0};
use qmesh_core::EventKind;
use qmesh_mesh::{ConnectionType, RouteStatus, RouteType};

#[tokio::test]
async fn test_two_hop_route_sums_edge_costs() {
    let mesh = MeshHarness::new("a");
    mesh.add_peers(&["b", "c"], T0);
    mesh.link("a", "b", unit_cost_metrics(), T0).await;
    mesh.link("b", "c", unit_cost_metrics(), T0).await;

    mesh.routing.run_cycle_at(T0);

    let route = mesh.store.find_route("a", "c").unwrap();
    assert_eq!(route.path, vec!["a", "b", "c"]);
    assert_eq!(route.connections.len(), 2);
    assert_eq!(route.route_type, RouteType::MultiHop);
    assert!((route.metrics.cost - 2.0).abs() < 1e-9, "cost {}", route.metrics.cost);
    assert!((route.metrics.distance_km - 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_three_node_mesh_routes_every_pair() {
    let mesh = MeshHarness::new("a");
    mesh.add_peers(&["b", "c"], T0);
    mesh.link("a", "b", metrics(0.02, 1000.0), T0).await;
    mesh.link("a", "c", metrics(0.02, 1000.0), T0).await;
    mesh.link("b", "c", metrics(0.02, 1000.0), T0).await;

    let report = mesh.routing.run_cycle_at(T0);
    assert_eq!(report.sources, 3);
    assert_eq!(report.active_routes, 6);

    for source in ["a", "b", "c"] {
        for target in ["a", "b", "c"].into_iter().filter(|t| *t != source) {
            let route = mesh.store.find_route(source, target).unwrap();
            assert_eq!(route.route_type, RouteType::Direct, "{source} -> {target}");
            assert_eq!(route.status, RouteStatus::Active);
            assert_eq!(route.metrics.min_key_rate, 1000.0);
            assert!((route.metrics.average_error_rate - 0.02).abs() < 1e-12);
            assert!((route.metrics.reliability - 0.98).abs() < 1e-12);
        }
    }

    let stats = mesh.store.recompute_metrics_at(T0);
    assert_eq!(stats.node_count, 3);
    assert_eq!(stats.active_connection_count, 3);
    assert_eq!(stats.route_count, 6);
    assert!((stats.average_error_rate - 0.02).abs() < 1e-12);
    assert_eq!(stats.total_key_rate, 3000.0);
}

#[tokio::test]
async fn test_removing_relay_cascades() {
    let mesh = MeshHarness::new("a");
    mesh.add_peers(&["b", "c"], T0);
    let ab = mesh.link("a", "b", unit_cost_metrics(), T0).await;
    let bc = mesh.link("b", "c", unit_cost_metrics(), T0).await;
    mesh.routing.run_cycle_at(T0);

    let removal = mesh.store.remove_node("b").unwrap();

    let mut removed = removal.removed_connections.clone();
    removed.sort();
    let mut expected = vec![ab.id.clone(), bc.id.clone()];
    expected.sort();
    assert_eq!(removed, expected);
    assert_eq!(mesh.store.connection_count(), 0);
    assert!(mesh.store.node("a").unwrap().connections.is_empty());
    assert!(mesh.store.node("c").unwrap().connections.is_empty());

    // a -> c crossed b and is failed, a -> b is gone
    let routes = mesh.store.routes_from("a");
    assert!(routes.iter().all(|r| r.target != "b"));
    let via_b = routes.iter().find(|r| r.target == "c").unwrap();
    assert_eq!(via_b.status, RouteStatus::Failed);
    assert!(mesh.store.find_route("a", "c").is_err());

    // next cycle drops the stale route entirely
    mesh.routing.run_cycle_at(T0 + 1);
    assert!(mesh.store.routes_from("a").is_empty());
}

#[tokio::test]
async fn test_establish_is_idempotent() {
    let mesh = MeshHarness::new("a");
    mesh.add_peers(&["b"], T0);

    let first = mesh.link("a", "b", unit_cost_metrics(), T0).await;
    let second = mesh
        .establisher
        .establish_at("b", "a", ConnectionType::Direct, T0 + 10)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(mesh.store.connection_count(), 1);
    assert_eq!(mesh.channel.sessions_started(), 1);
    assert_eq!(mesh.registry.connections.lock().len(), 1);
    assert_eq!(mesh.store.events_of_kind(EventKind::ConnectionEstablished).len(), 1);
}

#[tokio::test]
async fn test_failed_handshake_leaves_topology_untouched() {
    let mesh = MeshHarness::new("a");
    mesh.add_peers(&["b"], T0);
    mesh.channel.fail("b");
    let revision = mesh.store.revision();

    let result = mesh
        .establisher
        .establish_at("a", "b", ConnectionType::Direct, T0)
        .await;

    assert!(result.is_err());
    assert_eq!(mesh.store.connection_count(), 0);
    assert_eq!(mesh.store.revision(), revision);
    assert_eq!(mesh.store.events_of_kind(EventKind::ConnectionFailed).len(), 1);

    mesh.channel.heal("b");
    mesh.link("a", "b", unit_cost_metrics(), T0 + 1).await;
    assert_eq!(mesh.store.connection_count(), 1);
}

#[tokio::test]
async fn test_degraded_link_leaves_active_routing() {
    let mesh = MeshHarness::new("a");
    mesh.add_peers(&["b", "c"], T0);
    let direct = mesh.link("a", "c", unit_cost_metrics(), T0).await;
    mesh.link("a", "b", unit_cost_metrics(), T0).await;
    mesh.link("b", "c", unit_cost_metrics(), T0).await;

    mesh.routing.run_cycle_at(T0);
    assert_eq!(mesh.store.find_route("a", "c").unwrap().route_type, RouteType::Direct);

    // error rate above the 11% threshold degrades the link
    mesh.store
        .record_measurement(&direct.id, 0.2, 0.0, T0 + 1_000)
        .unwrap();
    let health = mesh.health.run_cycle_at(T0 + 1_000);
    assert_eq!(health.degraded_connections, vec![direct.id.clone()]);

    mesh.routing.run_cycle_at(T0 + 1_000);
    let route = mesh.store.find_route("a", "c").unwrap();
    assert_eq!(route.path, vec!["a", "b", "c"]);
}
