//! Plugin lifecycle scenarios against in-memory members
//!
//! Unload gives up after `max_unload_attempts` (5) failed attempts. Attempts
//! are spaced by the plugin backoff of 10s doubling per attempt, however
//! often the cluster is reconciled in between, so a deletion stuck on a dead
//! member is released after roughly two and a half minutes: long enough to
//! ride out a member restart, short enough that deleting a plugin never
//! hangs on a member that is gone for good.
//!
//! Tests that step through retries run on a paused tokio clock.

mod common;

use common::{broker, node, plugin, Harness, NS};
use emqx_operator::crd::ClusterSpec;
use emqx_operator::cluster::ClusterRef;
use emqx_operator::controller::{reconcile, route_plugin};
use emqx_operator::crd::{EmqxPlugin, PluginPhase};
use emqx_operator::plugin::PLUGIN_FINALIZER;
use emqx_operator::queue::WorkQueue;
use kube::ResourceExt;
use std::time::Duration;

/// A running three-member cluster
async fn running_cluster(h: &Harness) -> ClusterRef {
    let key = h.platform.add_broker(broker("emqx", 3));
    reconcile(&h.ctx, &key).await;
    h.platform.start_pods("emqx");
    reconcile(&h.ctx, &key).await;
    key
}

fn loads_on(h: &Harness, node: &str) -> usize {
    h.admin.load_calls().iter().filter(|(n, _)| n == node).count()
}

fn stored(h: &Harness, name: &str) -> EmqxPlugin {
    h.platform.plugin(name).unwrap()
}

#[tokio::test]
async fn test_plugin_loads_on_every_selected_member() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));

    let requeue = reconcile(&h.ctx, &key).await;

    let p = stored(&h, "lwm2m");
    assert!(p.finalizers().iter().any(|f| f == PLUGIN_FINALIZER));
    let status = p.status.unwrap();
    assert_eq!(status.phase, PluginPhase::Loaded);
    assert_eq!(
        status.loaded_members,
        vec![node("emqx", 0), node("emqx", 1), node("emqx", 2)]
    );
    assert!(status.failed_members.is_empty());
    for i in 0..3 {
        assert!(h.admin.loaded_on(&node("emqx", i)).contains_key("emqx_lwm2m"));
    }
    assert!(h.platform.cluster_status(&key).unwrap().is_running());
    assert_eq!(requeue, Some(Duration::from_secs(300)));
    assert!(h.events.reasons().contains(&"PluginLoaded".to_string()));
}

#[tokio::test]
async fn test_loaded_plugin_is_not_pushed_again() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;
    let calls = h.admin.load_calls().len();

    reconcile(&h.ctx, &key).await;
    reconcile(&h.ctx, &key).await;

    assert_eq!(h.admin.load_calls().len(), calls);
}

#[tokio::test]
async fn test_config_change_pushes_everywhere() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;
    let old_hash = h.platform.plugin_status("lwm2m").config_hash;

    let mut p = stored(&h, "lwm2m");
    p.spec
        .config
        .insert("lwm2m.lifetime_min".to_string(), "1s".to_string());
    h.platform.add_plugin(p);
    reconcile(&h.ctx, &key).await;

    assert_eq!(h.admin.load_calls().len(), 6);
    let status = h.platform.plugin_status("lwm2m");
    assert_eq!(status.phase, PluginPhase::Loaded);
    assert_ne!(status.config_hash, old_hash);
    assert_eq!(
        h.admin.loaded_on(&node("emqx", 1))["emqx_lwm2m"]["lwm2m.lifetime_min"],
        "1s"
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_member_is_retried_alone() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    let children = h.platform.created().len();
    h.admin.set_unreachable(&node("emqx", 2), true);
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));

    let requeue = reconcile(&h.ctx, &key).await;

    assert!(!h.platform.cluster_status(&key).unwrap().is_running());
    let status = h.platform.plugin_status("lwm2m");
    assert_eq!(status.phase, PluginPhase::LoadFailed);
    assert_eq!(status.loaded_members, vec![node("emqx", 0), node("emqx", 1)]);
    assert_eq!(status.failed_members.len(), 1);
    assert_eq!(status.failed_members[0].member, node("emqx", 2));
    assert!(status.failed_members[0].retryable);
    assert_eq!(requeue, Some(Duration::from_secs(10)));
    assert!(h.events.warnings().contains(&"PluginLoadFailed".to_string()));

    // not due yet
    let requeue = reconcile(&h.ctx, &key).await;
    assert_eq!(loads_on(&h, &node("emqx", 2)), 1);
    assert_eq!(requeue, Some(Duration::from_secs(10)));

    tokio::time::advance(Duration::from_secs(10)).await;
    reconcile(&h.ctx, &key).await;
    assert_eq!(loads_on(&h, &node("emqx", 0)), 1);
    assert_eq!(loads_on(&h, &node("emqx", 2)), 2);
    assert_eq!(h.platform.plugin_status("lwm2m").load_attempts, 2);

    h.admin.set_unreachable(&node("emqx", 2), false);
    tokio::time::advance(Duration::from_secs(20)).await;
    reconcile(&h.ctx, &key).await;
    let status = h.platform.plugin_status("lwm2m");
    assert_eq!(status.phase, PluginPhase::Loaded);
    assert_eq!(status.loaded_members.len(), 3);
    assert_eq!(status.load_attempts, 0);
    assert_eq!(loads_on(&h, &node("emqx", 0)), 1);

    // no child was ever deleted or recreated
    assert_eq!(h.platform.created().len(), children);
}

#[tokio::test]
async fn test_rejecting_member_waits_for_config_change() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.admin.set_rejecting(&node("emqx", 1), true);
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));

    reconcile(&h.ctx, &key).await;
    let status = h.platform.plugin_status("lwm2m");
    assert_eq!(status.phase, PluginPhase::LoadFailed);
    assert!(!status.failed_members[0].retryable);

    reconcile(&h.ctx, &key).await;
    assert_eq!(loads_on(&h, &node("emqx", 1)), 1);

    let mut p = stored(&h, "lwm2m");
    p.spec
        .config
        .insert("lwm2m.lifetime_max".to_string(), "3600s".to_string());
    h.platform.add_plugin(p);
    reconcile(&h.ctx, &key).await;
    assert_eq!(loads_on(&h, &node("emqx", 1)), 2);
}

#[tokio::test]
async fn test_members_not_ready_keep_plugin_loading() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.set_pod_ready("emqx-2", false);
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));

    reconcile(&h.ctx, &key).await;
    let status = h.platform.plugin_status("lwm2m");
    assert_eq!(status.phase, PluginPhase::Loading);
    assert_eq!(status.loaded_members.len(), 2);
    assert_eq!(loads_on(&h, &node("emqx", 2)), 0);

    h.platform.set_pod_ready("emqx-2", true);
    reconcile(&h.ctx, &key).await;
    assert_eq!(h.platform.plugin_status("lwm2m").phase, PluginPhase::Loaded);
}

#[tokio::test]
async fn test_narrowed_selector_does_not_unload() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;

    h.platform.set_pod_label("emqx-2", "cluster", None);
    reconcile(&h.ctx, &key).await;

    assert!(h.admin.unload_calls().is_empty());
    assert!(h.admin.loaded_on(&node("emqx", 2)).contains_key("emqx_lwm2m"));
    let status = h.platform.plugin_status("lwm2m");
    assert_eq!(status.phase, PluginPhase::Loaded);
    assert!(status.loaded_members.contains(&node("emqx", 2)));
}

#[tokio::test]
async fn test_vanished_member_is_pruned() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;

    h.platform.remove_pod("emqx-2");
    reconcile(&h.ctx, &key).await;

    let status = h.platform.plugin_status("lwm2m");
    assert_eq!(status.loaded_members, vec![node("emqx", 0), node("emqx", 1)]);
}

#[tokio::test]
async fn test_deleted_plugin_is_unloaded_then_released() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;

    h.platform.delete_plugin("lwm2m");
    // the finalizer holds the object until a pass attempted the unload
    assert!(h.platform.plugin("lwm2m").is_some());

    reconcile(&h.ctx, &key).await;

    assert!(h.platform.plugin("lwm2m").is_none());
    assert_eq!(h.admin.unload_calls().len(), 3);
    for i in 0..3 {
        assert!(h.admin.loaded_on(&node("emqx", i)).is_empty());
    }
    assert!(h.events.reasons().contains(&"PluginUnloaded".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_unload_with_dead_member_is_bounded() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;

    h.admin.set_unreachable(&node("emqx", 2), true);
    h.platform.delete_plugin("lwm2m");

    let mut wait = Duration::ZERO;
    for attempt in 1..5u32 {
        tokio::time::advance(wait).await;
        let requeue = reconcile(&h.ctx, &key).await;
        let p = stored(&h, "lwm2m");
        assert!(p.finalizers().iter().any(|f| f == PLUGIN_FINALIZER));
        let status = p.status.unwrap();
        assert_eq!(status.phase, PluginPhase::Unloading);
        assert_eq!(status.unload_attempts, attempt);
        assert_eq!(status.failed_members[0].member, node("emqx", 2));
        // the degraded cluster itself comes back every 10s
        assert_eq!(requeue, Some(Duration::from_secs(10)));
        wait = Duration::from_secs(10 << (attempt - 1));
    }
    assert!(h.events.warnings().iter().all(|r| r != "UnloadAbandoned"));

    tokio::time::advance(wait).await;
    reconcile(&h.ctx, &key).await;

    assert!(h.platform.plugin("lwm2m").is_none());
    assert!(h.events.warnings().contains(&"UnloadAbandoned".to_string()));
    assert!(h.admin.loaded_on(&node("emqx", 2)).contains_key("emqx_lwm2m"));
}

#[tokio::test(start_paused = true)]
async fn test_rapid_passes_do_not_spend_unload_attempts() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;

    h.admin.set_unreachable(&node("emqx", 2), true);
    h.platform.delete_plugin("lwm2m");

    // pod and StatefulSet events can trigger passes back to back
    for _ in 0..5 {
        reconcile(&h.ctx, &key).await;
    }

    let p = stored(&h, "lwm2m");
    assert!(p.finalizers().iter().any(|f| f == PLUGIN_FINALIZER));
    assert_eq!(p.status.unwrap().unload_attempts, 1);
    assert_eq!(
        h.admin
            .unload_calls()
            .iter()
            .filter(|(n, _)| n == &node("emqx", 2))
            .count(),
        1
    );
    assert!(h.events.warnings().iter().all(|r| r != "UnloadAbandoned"));

    tokio::time::advance(Duration::from_secs(10)).await;
    reconcile(&h.ctx, &key).await;
    assert_eq!(h.platform.plugin_status("lwm2m").unload_attempts, 2);
}

#[tokio::test]
async fn test_plugin_deletion_survives_invalid_cluster_spec() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;

    let mut spec = ClusterSpec {
        replicas: 3,
        ..Default::default()
    };
    spec.image = Some("../evil:latest".to_string());
    h.platform.update_spec(&key, spec);
    h.platform.delete_plugin("lwm2m");

    let requeue = reconcile(&h.ctx, &key).await;

    assert!(h.events.warnings().contains(&"ValidationFailed".to_string()));
    assert!(h.platform.plugin("lwm2m").is_none());
    assert_eq!(h.admin.unload_calls().len(), 3);
    assert!(h.events.reasons().contains(&"PluginUnloaded".to_string()));
    assert!(requeue.is_none());
}

#[tokio::test]
async fn test_deleting_cluster_releases_stuck_plugin() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;

    h.admin.set_unreachable(&node("emqx", 2), true);
    h.platform.delete_plugin("lwm2m");
    reconcile(&h.ctx, &key).await;
    assert_eq!(h.platform.plugin_status("lwm2m").phase, PluginPhase::Unloading);

    h.platform.mark_cluster_deleting(&key);
    let requeue = reconcile(&h.ctx, &key).await;

    assert!(requeue.is_none());
    assert!(h.platform.plugin("lwm2m").is_none());
    assert!(h.events.reasons().contains(&"PluginUnloaded".to_string()));
}

#[tokio::test]
async fn test_vanished_cluster_releases_deleted_plugin() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("lwm2m", "emqx_lwm2m", "emqx"));
    reconcile(&h.ctx, &key).await;

    h.platform.remove_cluster(&key);
    h.platform.delete_plugin("lwm2m");
    reconcile(&h.ctx, &key).await;

    assert!(h.platform.plugin("lwm2m").is_none());
}

#[tokio::test]
async fn test_deleting_cluster_binds_no_plugins() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.mark_cluster_deleting(&key);

    let mut p = plugin("lwm2m", "emqx_lwm2m", "emqx");
    p.metadata.finalizers = Some(vec![PLUGIN_FINALIZER.to_string()]);
    h.platform.add_plugin(p);
    h.platform.delete_plugin("lwm2m");

    let queue = WorkQueue::new();
    route_plugin(&h.ctx, &queue, &stored(&h, "lwm2m")).await;

    assert!(queue.is_empty());
    assert!(h.platform.plugin("lwm2m").is_none());
}

#[tokio::test]
async fn test_invalid_plugin_name_is_never_pushed() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform
        .add_plugin(plugin("escape", "../../nodes/x/plugins/emqx_auth", "emqx"));

    let requeue = reconcile(&h.ctx, &key).await;

    assert!(h.admin.load_calls().is_empty());
    let p = stored(&h, "escape");
    assert!(p.finalizers().is_empty());
    let status = p.status.unwrap();
    assert_eq!(status.phase, PluginPhase::LoadFailed);
    assert!(status.message.unwrap().starts_with("invalid spec"));
    assert_eq!(status.load_attempts, 0);
    assert!(h.events.warnings().contains(&"PluginLoadFailed".to_string()));
    // only the cluster's own resync
    assert_eq!(requeue, Some(Duration::from_secs(300)));

    let before = h.platform.plugin_status("escape");
    reconcile(&h.ctx, &key).await;
    assert!(h.admin.load_calls().is_empty());
    assert_eq!(h.platform.plugin_status("escape"), before);
}

#[tokio::test]
async fn test_plugin_for_other_cluster_is_left_alone() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    h.platform.add_plugin(plugin("coap", "emqx_coap", "elsewhere"));

    reconcile(&h.ctx, &key).await;

    let p = stored(&h, "coap");
    assert!(p.finalizers().is_empty());
    assert!(p.status.is_none());
    assert!(h.admin.load_calls().is_empty());
}

#[tokio::test]
async fn test_plugin_binds_to_first_matching_cluster() {
    let h = Harness::new();
    let mut a = broker("a", 1);
    let mut b = broker("b", 1);
    for cluster in [&mut a, &mut b] {
        cluster
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("tier".to_string(), "edge".to_string());
    }
    let key_a = h.platform.add_broker(a);
    let key_b = h.platform.add_broker(b);
    let mut p = plugin("lwm2m", "emqx_lwm2m", "unused");
    p.spec.selector = [("tier".to_string(), "edge".to_string())].into();
    h.platform.add_plugin(p);

    reconcile(&h.ctx, &key_b).await;
    assert!(stored(&h, "lwm2m").finalizers().is_empty());

    reconcile(&h.ctx, &key_a).await;
    assert!(stored(&h, "lwm2m")
        .finalizers()
        .iter()
        .any(|f| f == PLUGIN_FINALIZER));
}

#[tokio::test]
async fn test_plugin_events_route_to_bound_cluster() {
    let h = Harness::new();
    let key = running_cluster(&h).await;
    let queue = WorkQueue::new();

    route_plugin(&h.ctx, &queue, &plugin("lwm2m", "emqx_lwm2m", "emqx")).await;
    assert_eq!(queue.len(), 1);
    let next = queue
        .next(&h.ctx.cancel)
        .await
        .unwrap();
    assert_eq!(next, key);
}

#[tokio::test]
async fn test_deleted_orphan_plugin_is_released() {
    let h = Harness::new();
    let mut p = plugin("lwm2m", "emqx_lwm2m", "gone");
    p.metadata.finalizers = Some(vec![PLUGIN_FINALIZER.to_string()]);
    h.platform.add_plugin(p);
    h.platform.delete_plugin("lwm2m");
    let marked = stored(&h, "lwm2m");
    assert_eq!(marked.namespace().as_deref(), Some(NS));

    let queue = WorkQueue::new();
    route_plugin(&h.ctx, &queue, &marked).await;

    assert!(queue.is_empty());
    assert!(h.platform.plugin("lwm2m").is_none());
}
