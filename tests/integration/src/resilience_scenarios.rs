//! Alert dispatch into the scaling, failover and self-healing loops.

use crate::test_utils::{test_config, RecordingRegistry, ScriptedChannel, TestPeer, T0};
use qmesh_core::{Config, EventKind};
use qmesh_mesh::{
    Alert, AlertCategory, AlertSeverity, Comparator, FailoverPolicy, HealingActionKind,
    Orchestrator, PolicySet, ScalingAction, ScalingDirection, ScalingPolicy, StaticBeaconTransport,
    TriggerCondition,
};
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(config: Config, policies: PolicySet) -> (Arc<Orchestrator>, Arc<ScriptedChannel>) {
    let channel = ScriptedChannel::new();
    let orch = Orchestrator::builder(config)
        .policies(policies)
        .channel_provider(channel.clone())
        .build()
        .unwrap();
    (orch, channel)
}

fn add_peers(orch: &Orchestrator, ids: &[&str], now: u64) {
    for (i, id) in ids.iter().enumerate() {
        let peer = TestPeer::new(id, 47801 + i as u16);
        orch.store().add_node(peer.node(now)).unwrap();
    }
}

fn hub_scale_out(cooldown_ms: u64) -> PolicySet {
    PolicySet {
        auto_scaling: vec![ScalingPolicy {
            name: "hub-scale-out".into(),
            enabled: true,
            trigger: TriggerCondition::new("average_load", Comparator::GreaterThan, 0.7),
            action: ScalingAction::new(ScalingDirection::ScaleOut, "hub").secure(),
            cooldown_ms,
        }],
        ..Default::default()
    }
}

fn overload_alert(now: u64) -> Alert {
    Alert::new(AlertCategory::Performance, AlertSeverity::High, vec![])
        .with_message("mesh saturated")
        .with_metric("average_load", 0.95)
        .at(now)
}

#[tokio::test]
async fn test_scale_out_respects_cooldown() {
    let (orch, channel) = orchestrator(test_config("hub"), hub_scale_out(60_000));
    orch.disable_self_healing();
    orch.bootstrap_local_node_at(T0).await.unwrap();
    add_peers(&orch, &["p1", "p2", "p3"], T0);
    orch.store().update_node_status("p1", |s| s.load = 0.6).unwrap();

    let first = orch.handle_alert_at(overload_alert(T0), T0).await;
    assert_eq!(first.scaling.len(), 1);
    assert!(first.scaling[0].success, "{}", first.scaling[0].detail);
    // least loaded candidate wins, ties broken by id
    assert!(orch.store().connection_between("hub", "p2").is_some());

    let cooling = orch.handle_alert_at(overload_alert(T0 + 30_000), T0 + 30_000).await;
    assert!(cooling.scaling.is_empty());

    let second = orch.handle_alert_at(overload_alert(T0 + 60_000), T0 + 60_000).await;
    assert_eq!(second.scaling.len(), 1);
    assert!(orch.store().connection_between("hub", "p3").is_some());
    assert!(orch.store().connection_between("hub", "p1").is_none());

    assert_eq!(channel.sessions_started(), 2);
    let status = orch.status();
    assert_eq!(status.alerts_processed, 3);
    assert_eq!(status.actions_executed, 2);
    assert_eq!(status.scaling.succeeded, 2);
    assert_eq!(orch.get_event_log(100).iter().filter(|e| e.kind == EventKind::ScalingAction).count(), 2);
}

#[tokio::test]
async fn test_backups_serve_one_primary_at_a_time() {
    let policies = PolicySet {
        auto_scaling: vec![],
        failover: vec![
            FailoverPolicy::new("east", "east-primary", vec!["spare-1".into(), "spare-2".into()]),
            FailoverPolicy::new("west", "west-primary", vec!["spare-1".into(), "spare-2".into()]),
            FailoverPolicy::new("north", "north-primary", vec!["spare-1".into(), "spare-2".into()]),
        ],
        healing: PolicySet::default_healing_catalog(),
    };
    let (orch, _channel) = orchestrator(test_config("hub"), policies);
    orch.disable_self_healing();
    orch.bootstrap_local_node_at(T0).await.unwrap();
    add_peers(
        &orch,
        &["east-primary", "west-primary", "north-primary", "spare-1", "spare-2"],
        T0,
    );
    for primary in ["east-primary", "west-primary", "north-primary"] {
        orch.store().mark_node_offline(primary, T0).unwrap();
    }

    let alert = Alert::new(AlertCategory::Availability, AlertSeverity::Critical, vec![]).at(T0);
    let dispatch = orch.handle_alert_at(alert, T0).await;

    assert_eq!(dispatch.failover.failovers.len(), 2);
    let mut backups: Vec<String> = orch.active_failovers().into_iter().map(|a| a.backup).collect();
    backups.sort();
    assert_eq!(backups, vec!["spare-1", "spare-2"]);
    assert!(orch
        .active_failovers()
        .iter()
        .all(|a| a.primary != "north-primary"));

    // a repeated alert changes nothing while both spares are bound
    let again = Alert::new(AlertCategory::Availability, AlertSeverity::Critical, vec![]).at(T0 + 1);
    let dispatch = orch.handle_alert_at(again, T0 + 1).await;
    assert!(dispatch.failover.is_empty());

    // releasing east and retiring its policy frees the spare for north
    let released = orch.failback("east-primary").unwrap();
    orch.set_failover_policy_enabled("east", false).unwrap();
    let retry = Alert::new(AlertCategory::Availability, AlertSeverity::Critical, vec![]).at(T0 + 2);
    let dispatch = orch.handle_alert_at(retry, T0 + 2).await;
    assert_eq!(dispatch.failover.failovers.len(), 1);
    assert_eq!(dispatch.failover.failovers[0].primary, "north-primary");
    assert_eq!(dispatch.failover.failovers[0].backup, released.backup);
    assert!(orch.get_event_log(100).iter().any(|e| e.kind == EventKind::Failback));
}

#[tokio::test]
async fn test_security_alert_quarantines_affected_node() {
    let (orch, _channel) = orchestrator(test_config("hub"), PolicySet::default());
    orch.bootstrap_local_node_at(T0).await.unwrap();
    add_peers(&orch, &["suspect", "bystander"], T0);

    let alert = Alert::new(
        AlertCategory::Security,
        AlertSeverity::High,
        vec!["suspect".to_string()],
    )
    .with_message("replayed beacon")
    .at(T0);
    let dispatch = orch.handle_alert_at(alert, T0).await;

    assert!(dispatch.scaling.is_empty());
    assert!(dispatch.failover.is_empty());
    assert_eq!(dispatch.healing.len(), 1);
    assert_eq!(dispatch.healing[0].action, HealingActionKind::QuarantineNode);
    assert!(dispatch.healing[0].success);

    let suspect = orch.store().node("suspect").unwrap();
    assert_eq!(suspect.trust.trust_level, 0.0);
    assert!(!suspect.status.secure_channel_ready);
    assert_eq!(orch.store().node("bystander").unwrap().trust.trust_level, 0.9);
    assert_eq!(orch.healing_history().len(), 1);
}

#[tokio::test]
async fn test_running_node_discovers_peers_and_handles_published_alerts() {
    let alpha = TestPeer::new("alpha", 47801);
    let beta = TestPeer::new("beta", 47802);
    let transport = Arc::new(StaticBeaconTransport::new(vec![
        alpha.beacon(qmesh_core::current_timestamp_ms()),
        beta.beacon(qmesh_core::current_timestamp_ms()),
    ]));
    let registry = Arc::new(RecordingRegistry::default());
    let channel = ScriptedChannel::new();

    let orch = Orchestrator::builder(test_config("hub"))
        .channel_provider(channel.clone())
        .beacon_transport(transport)
        .registry(registry.clone())
        .build()
        .unwrap();
    orch.start().await.unwrap();

    // the first discovery tick fires immediately
    tokio::time::timeout(Duration::from_secs(5), async {
        while orch.store().node_count() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers discovered");

    let mut added = registry.added.lock().clone();
    added.sort();
    assert_eq!(added, vec!["alpha", "beta", "hub"]);

    let alert = Alert::new(
        AlertCategory::ChannelQuality,
        AlertSeverity::Medium,
        vec!["alpha".to_string()],
    );
    assert!(orch.publish_alert(alert) >= 1);

    tokio::time::timeout(Duration::from_secs(5), async {
        while orch.status().alerts_processed == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("alert handled");

    let status = orch.status();
    assert_eq!(status.node_id, "hub");
    assert_eq!(status.statistics.node_count, 3);

    orch.shutdown().await;
    let stopped = orch.status().alerts_processed;
    orch.publish_alert(Alert::new(AlertCategory::Capacity, AlertSeverity::Low, vec![]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orch.status().alerts_processed, stopped);
}
