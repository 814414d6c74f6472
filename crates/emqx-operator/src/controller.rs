//! Reconcile Driver
//!
//! One pass per cluster: build the desired children, sync them, aggregate
//! member health, drive bound plugins, then persist the status. Watch
//! streams on clusters, their StatefulSets and Pods, and plugins only
//! enqueue cluster keys; the [`WorkQueue`] guarantees at most one pass per
//! cluster is in flight.

use crate::admin::{AdminClientConfig, HttpMemberAdmin};
use crate::cluster::{ClusterKind, ClusterRef, EmqxCluster};
use crate::config::OperatorConfig;
use crate::context::Context;
use crate::crd::{
    EmqxBroker, EmqxClusterStatus, EmqxEnterprise, EmqxPlugin, CONDITION_RECONCILED,
};
use crate::error::{OperatorError, Result};
use crate::events::{actions, reasons, KubeEventPublisher};
use crate::platform::KubePlatform;
use crate::plugin;
use crate::queue::{run_workers, WorkQueue};
use crate::resources::{ResourceBuilder, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, MANAGER};
use crate::status;
use crate::sync;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::events::EventType;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Reporting component on events and field manager name
pub const CONTROLLER_NAME: &str = "emqx-operator";

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("emqx_operator_reconciliations_total"),
            errors: metrics::counter!("emqx_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("emqx_operator_reconciliation_duration_seconds"),
        }
    }

    /// Count one plugin load or unload against one member
    pub fn plugin_operation(&self, operation: &'static str, outcome: &'static str) {
        metrics::counter!(
            "emqx_operator_plugin_operations_total",
            "operation" => operation,
            "outcome" => outcome
        )
        .increment(1);
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start every watcher and the worker pool; returns once `cancel` fires
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let platform = Arc::new(KubePlatform::new(client.clone(), config.api_timeout));
    let admin = Arc::new(HttpMemberAdmin::new(AdminClientConfig {
        request_timeout: config.admin_timeout,
        username: config.admin_username.clone(),
        password: config.admin_password.clone(),
        ..Default::default()
    })?);
    let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
    let namespace = config.namespace.clone();

    let ctx = Arc::new(
        Context::new(platform, admin, events, config)
            .with_metrics(ControllerMetrics::new())
            .with_cancellation(cancel.clone()),
    );
    let queue = Arc::new(WorkQueue::new());

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        workers = ctx.config.workers,
        "Starting EMQX controller"
    );

    let ns = namespace.as_deref();
    let children = watcher::Config::default().labels(&format!("{}={}", LABEL_MANAGED_BY, MANAGER));

    let mut watchers = tokio::task::JoinSet::new();
    {
        let queue = Arc::clone(&queue);
        watchers.spawn(watch(
            scoped_api::<EmqxBroker>(&client, ns),
            watcher::Config::default(),
            cancel.clone(),
            move |c: EmqxBroker| {
                queue.enqueue(c.cluster_ref());
                async {}
            },
        ));
    }
    {
        let queue = Arc::clone(&queue);
        watchers.spawn(watch(
            scoped_api::<EmqxEnterprise>(&client, ns),
            watcher::Config::default(),
            cancel.clone(),
            move |c: EmqxEnterprise| {
                queue.enqueue(c.cluster_ref());
                async {}
            },
        ));
    }
    {
        let queue = Arc::clone(&queue);
        watchers.spawn(watch(
            scoped_api::<StatefulSet>(&client, ns),
            children.clone(),
            cancel.clone(),
            move |sts: StatefulSet| {
                if let Some(key) = owning_cluster(sts.labels(), sts.namespace()) {
                    queue.enqueue(key);
                }
                async {}
            },
        ));
    }
    {
        let queue = Arc::clone(&queue);
        watchers.spawn(watch(
            scoped_api::<Pod>(&client, ns),
            children,
            cancel.clone(),
            move |pod: Pod| {
                if let Some(key) = owning_cluster(pod.labels(), pod.namespace()) {
                    queue.enqueue(key);
                }
                async {}
            },
        ));
    }
    {
        let queue = Arc::clone(&queue);
        let ctx = Arc::clone(&ctx);
        watchers.spawn(watch(
            scoped_api::<EmqxPlugin>(&client, ns),
            watcher::Config::default(),
            cancel.clone(),
            move |p: EmqxPlugin| {
                let queue = Arc::clone(&queue);
                let ctx = Arc::clone(&ctx);
                async move { route_plugin(&ctx, &queue, &p).await }
            },
        ));
    }

    run_engine(ctx, queue).await;
    while watchers.join_next().await.is_some() {}
    info!("EMQX controller stopped");
    Ok(())
}

/// Drain `queue` with the configured number of workers until cancellation
pub async fn run_engine(ctx: Arc<Context>, queue: Arc<WorkQueue>) {
    let workers = ctx.config.workers;
    let cancel = ctx.cancel.clone();
    run_workers(queue, workers, cancel, move |key| {
        let ctx = Arc::clone(&ctx);
        async move { reconcile(&ctx, &key).await }
    })
    .await;
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Feed every touched object of a watch stream to `on_object`
async fn watch<K, F, Fut>(
    api: Api<K>,
    config: watcher::Config,
    cancel: CancellationToken,
    mut on_object: F,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
    F: FnMut(K) -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let stream = watcher(api, config).default_backoff().touched_objects();
    let mut stream = std::pin::pin!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(object)) => on_object(object).await,
                Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error"),
                None => break,
            }
        }
    }
    debug!(kind = %kind, "Watch stopped");
}

/// Cluster a labelled StatefulSet or Pod belongs to
pub fn owning_cluster(
    labels: &BTreeMap<String, String>,
    namespace: Option<String>,
) -> Option<ClusterRef> {
    let kind = ClusterKind::from_kind(labels.get(LABEL_COMPONENT)?)?;
    let name = labels.get(LABEL_INSTANCE)?;
    Some(ClusterRef::new(kind, namespace?, name.clone()))
}

/// Enqueue the cluster a plugin binds to, or release it when it is being
/// deleted and no cluster selects it
pub async fn route_plugin(ctx: &Context, queue: &WorkQueue, plugin: &EmqxPlugin) {
    let namespace = plugin.namespace().unwrap_or_else(|| "default".to_string());
    let clusters = match ctx.guard(ctx.platform.list_clusters(&namespace)).await {
        Ok(clusters) => clusters,
        Err(e) => {
            warn!(plugin = %plugin.name_any(), error = %e, "Failed to list clusters for plugin");
            return;
        }
    };
    match plugin::bound_cluster(&plugin.spec, &clusters) {
        Some(key) => queue.enqueue(key.clone()),
        None => {
            if let Err(e) = plugin::release_orphan(ctx, plugin).await {
                warn!(plugin = %plugin.name_any(), error = %e, "Failed to release plugin");
            }
        }
    }
}

/// Run one pass for `key`, returning when it should run again
#[instrument(skip(ctx, key), fields(cluster = %key))]
pub async fn reconcile(ctx: &Context, key: &ClusterRef) -> Option<Duration> {
    let start = Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let mut deletions: Option<Duration> = None;
    let result = match ctx.guard(ctx.platform.get_cluster(key)).await {
        Ok(Some(cluster)) if cluster.is_deleting() => {
            debug!("Cluster is being deleted");
            release_plugins(ctx, key).await;
            Ok(None)
        }
        Ok(Some(cluster)) => match reconcile_cluster(ctx, cluster.as_ref()).await {
            Ok(delay) => Ok(Some(delay)),
            Err(e) => {
                if !matches!(e, OperatorError::Cancelled) {
                    record_failure(ctx, cluster.as_ref(), &e).await;
                    deletions = match plugin::finish_deletions(ctx, cluster.as_ref()).await {
                        Ok(delay) => delay,
                        Err(err) => {
                            warn!(error = %err, "Failed to process plugin deletions");
                            None
                        }
                    };
                }
                Err(e)
            }
        },
        Ok(None) => {
            debug!("Cluster is gone");
            release_plugins(ctx, key).await;
            Ok(None)
        }
        Err(e) => Err(e),
    };

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(delay) => {
            ctx.error_counts.remove(key);
            delay
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            match (error_policy(ctx, key, &e), deletions) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        }
    }
}

/// Release deleted plugins left without a cluster once `key` stops binding
async fn release_plugins(ctx: &Context, key: &ClusterRef) {
    if let Err(e) = plugin::release_orphans(ctx, &key.namespace).await {
        warn!(error = %e, "Failed to release plugins of a departed cluster");
    }
}

/// Sequence the stages of one pass
#[instrument(skip(ctx, cluster), fields(name = %cluster.name(), namespace = %cluster.namespace()))]
async fn reconcile_cluster(ctx: &Context, cluster: &dyn EmqxCluster) -> Result<Duration> {
    debug!(kind = %cluster.kind(), "Reconciling cluster");

    let children = ResourceBuilder::new(cluster)?.build()?;
    let summary = sync::apply_all(ctx, &children).await?;
    if summary.changed() {
        let (reason, note) = if summary.created.is_empty() {
            (reasons::RESOURCE_PATCHED, format!("patched {}", summary.patched.join(", ")))
        } else {
            (reasons::RESOURCE_CREATED, format!("created {}", summary.created.join(", ")))
        };
        ctx.events
            .publish(
                &cluster.object_reference(),
                EventType::Normal,
                reason,
                actions::APPLY,
                Some(note),
            )
            .await;
    }

    let observations = status::observe_members(ctx, cluster).await?;
    let now = Utc::now().to_rfc3339();
    let mut next = status::aggregate(cluster, &observations, cluster.status(), &now);

    let plugin_requeue = plugin::reconcile_plugins(ctx, cluster, &observations).await?;

    status::set_condition(
        &mut next.conditions,
        CONDITION_RECONCILED,
        true,
        "ReconcileSucceeded",
        "desired state applied",
        &now,
    );
    let was_running = cluster.status().is_some_and(|s| s.is_running());
    persist_status(ctx, cluster, &next).await?;

    if next.is_running() != was_running {
        let (type_, reason) = if next.is_running() {
            info!(ready = next.ready_replicas, "Cluster is running");
            (EventType::Normal, reasons::CLUSTER_RUNNING)
        } else {
            warn!(ready = next.ready_replicas, replicas = next.replicas, "Cluster is degraded");
            (EventType::Warning, reasons::CLUSTER_DEGRADED)
        };
        let note = format!("{}/{} members ready", next.ready_replicas, next.replicas);
        ctx.events
            .publish(&cluster.object_reference(), type_, reason, actions::RECONCILE, Some(note))
            .await;
    }

    let converged = next.is_running() || next.replicas == 0;
    let mut delay = if converged {
        ctx.config.resync_interval
    } else {
        ctx.config.converge_interval
    };
    if let Some(plugin_delay) = plugin_requeue {
        delay = delay.min(plugin_delay);
    }
    Ok(delay)
}

/// Write `next` unless the cluster already carries it
async fn persist_status(
    ctx: &Context,
    cluster: &dyn EmqxCluster,
    next: &EmqxClusterStatus,
) -> Result<()> {
    if cluster.status() == Some(next) {
        return Ok(());
    }
    ctx.guard(
        ctx.platform
            .patch_cluster_status(&cluster.cluster_ref(), next),
    )
    .await
}

/// Record a failed pass in the `Reconciled` condition
async fn record_failure(ctx: &Context, cluster: &dyn EmqxCluster, err: &OperatorError) {
    let now = Utc::now().to_rfc3339();
    let mut next = cluster.status().cloned().unwrap_or_else(|| EmqxClusterStatus {
        replicas: cluster.spec().replicas,
        ..Default::default()
    });
    next.observed_generation = cluster.generation();
    status::set_condition(
        &mut next.conditions,
        CONDITION_RECONCILED,
        false,
        err.reason(),
        err.to_string(),
        &now,
    );
    if cluster.status() == Some(&next) {
        return;
    }

    let reason = match err {
        OperatorError::ValidationError(_) => reasons::VALIDATION_FAILED,
        _ => reasons::RECONCILE_FAILED,
    };
    ctx.events
        .publish(
            &cluster.object_reference(),
            EventType::Warning,
            reason,
            actions::RECONCILE,
            Some(err.to_string()),
        )
        .await;
    if let Err(e) = persist_status(ctx, cluster, &next).await {
        warn!(error = %e, "Failed to record reconcile failure");
    }
}

/// Requeue decision for a failed pass
pub fn error_policy(ctx: &Context, key: &ClusterRef, err: &OperatorError) -> Option<Duration> {
    if matches!(err, OperatorError::Cancelled) {
        debug!("Pass cancelled");
        return None;
    }
    if !err.is_retryable() {
        error!(error = %err, reason = err.reason(), "Pass failed, waiting for a spec change");
        return None;
    }

    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = match err {
        OperatorError::ResourceError(_) => ctx.config.resource_backoff(retries),
        _ => err
            .requeue_delay()
            .unwrap_or_else(|| ctx.config.resource_backoff(retries)),
    };
    warn!(
        error = %err,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Pass failed, will retry"
    );
    Some(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::MockMemberAdmin;
    use crate::events::NoopEventPublisher;
    use crate::platform::MockPlatform;

    fn context(platform: MockPlatform) -> Context {
        Context::new(
            Arc::new(platform),
            Arc::new(MockMemberAdmin::new()),
            Arc::new(NoopEventPublisher),
            OperatorConfig::default(),
        )
    }

    fn key() -> ClusterRef {
        ClusterRef::new(ClusterKind::Broker, "mqtt", "emqx")
    }

    #[test]
    fn test_owning_cluster_from_labels() {
        let labels = BTreeMap::from([
            (LABEL_INSTANCE.to_string(), "emqx".to_string()),
            (LABEL_COMPONENT.to_string(), "EmqxBroker".to_string()),
        ]);
        assert_eq!(owning_cluster(&labels, Some("mqtt".to_string())), Some(key()));
        assert_eq!(owning_cluster(&labels, None), None);

        let foreign = BTreeMap::from([
            (LABEL_INSTANCE.to_string(), "emqx".to_string()),
            (LABEL_COMPONENT.to_string(), "kafka".to_string()),
        ]);
        assert_eq!(owning_cluster(&foreign, Some("mqtt".to_string())), None);
    }

    #[test]
    fn test_error_policy_delays() {
        let ctx = context(MockPlatform::new());
        let conflict = OperatorError::ConflictError {
            kind: "StatefulSet".into(),
            name: "emqx".into(),
            message: "stale".into(),
        };
        assert_eq!(error_policy(&ctx, &key(), &conflict), Some(Duration::from_secs(1)));

        let unreachable = OperatorError::ConnectivityError {
            member: "emqx@x".into(),
            message: "refused".into(),
        };
        assert_eq!(error_policy(&ctx, &key(), &unreachable), Some(Duration::from_secs(10)));

        assert_eq!(
            error_policy(&ctx, &key(), &OperatorError::ValidationError("bad".into())),
            None
        );
        assert_eq!(error_policy(&ctx, &key(), &OperatorError::Cancelled), None);
    }

    #[test]
    fn test_resource_errors_back_off() {
        let ctx = context(MockPlatform::new());
        let quota = || OperatorError::ResourceError("exceeded quota".into());
        let delays: Vec<_> = (0..4)
            .map(|_| error_policy(&ctx, &key(), &quota()).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
    }

    #[tokio::test]
    async fn test_missing_cluster_is_not_requeued() {
        let mut platform = MockPlatform::new();
        platform.expect_get_cluster().returning(|_| Ok(None));
        platform
            .expect_list_clusters()
            .withf(|namespace| namespace == "mqtt")
            .times(1)
            .returning(|_| Ok(vec![]));
        platform.expect_list_plugins().returning(|_| Ok(vec![]));
        let ctx = context(platform);
        ctx.error_counts.insert(key(), 3);
        assert_eq!(reconcile(&ctx, &key()).await, None);
        assert!(ctx.error_counts.get(&key()).is_none());
    }

    #[tokio::test]
    async fn test_platform_error_on_load_is_retried() {
        let mut platform = MockPlatform::new();
        platform
            .expect_get_cluster()
            .returning(|_| Err(OperatorError::ResourceError("apiserver unavailable".into())));
        let ctx = context(platform);
        assert_eq!(reconcile(&ctx, &key()).await, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_cancelled_pass_is_not_requeued() {
        let ctx = context(MockPlatform::new());
        ctx.cancel.cancel();
        assert_eq!(reconcile(&ctx, &key()).await, None);
    }
}
