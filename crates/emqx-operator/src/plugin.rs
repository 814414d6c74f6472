//! Plugin Lifecycle Manager
//!
//! Drives each `EmqxPlugin` bound to the cluster being reconciled through
//! `Pending -> Loading -> Loaded | LoadFailed`, and through `Unloading` once
//! it is marked for deletion. The finalizer is the deletion gate: it is
//! attached before anything is pushed to a member and released only after
//! unload was attempted, either successfully or `max_unload_attempts` times.
//!
//! A plugin binds to the first cluster (by kind, namespace, name) in its
//! namespace whose labels it selects, so exactly one cluster pass ever
//! writes a given plugin's status. Clusters being deleted bind nothing.
//!
//! Failed loads and unloads are retried no sooner than the plugin backoff
//! after `lastAttemptTime`, however often the cluster is reconciled.

use crate::admin::Member;
use crate::cluster::{ClusterRef, EmqxCluster};
use crate::context::Context;
use crate::crd::{EmqxPlugin, EmqxPluginSpec, EmqxPluginStatus, MemberFailure, PluginPhase};
use crate::error::{OperatorError, Result};
use crate::events::{actions, reasons};
use crate::platform::ClusterSummary;
use crate::status::{self, MemberObservation};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Finalizer guarding plugin deletion until unload was attempted
pub const PLUGIN_FINALIZER: &str = "apps.emqx.io/finalizer";

/// Hash identifying a plugin name and configuration
pub fn config_hash(spec: &EmqxPluginSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.plugin_name.as_bytes());
    hasher.update([0u8]);
    for (k, v) in &spec.config {
        hasher.update(k.as_bytes());
        hasher.update([0u8]);
        hasher.update(v.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// The cluster a plugin binds to, if any
pub fn bound_cluster<'a>(
    spec: &EmqxPluginSpec,
    clusters: &'a [ClusterSummary],
) -> Option<&'a ClusterRef> {
    clusters
        .iter()
        .filter(|c| !c.deleting && spec.selects(&c.labels))
        .map(|c| &c.key)
        .min()
}

/// Time left until a failed attempt may be retried, `None` once it is due
pub fn retry_wait(
    ctx: &Context,
    attempts: u32,
    last_attempt: Option<&str>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if attempts == 0 {
        return None;
    }
    let last = DateTime::parse_from_rfc3339(last_attempt?).ok()?.with_timezone(&Utc);
    let backoff = chrono::Duration::from_std(ctx.config.plugin_backoff(attempts)).ok()?;
    (last + backoff - now)
        .to_std()
        .ok()
        .filter(|wait| !wait.is_zero())
}

/// Members a load pass has to deal with
#[derive(Debug, Default)]
pub struct LoadPlan<'a> {
    /// Selected ready members still missing the current configuration
    pub push: Vec<&'a MemberObservation>,
    /// Members holding the current configuration
    pub loaded: BTreeSet<String>,
    /// Rejections for the current configuration that are not retried
    pub rejected: Vec<MemberFailure>,
    /// Selected members whose pods are not ready yet
    pub waiting: usize,
}

/// Decide which members to push to
///
/// A config change invalidates every loaded member. Loaded members whose
/// pods vanished are dropped; members that merely stopped matching the
/// selector stay loaded.
pub fn plan_load<'a>(
    spec: &EmqxPluginSpec,
    status: &EmqxPluginStatus,
    hash: &str,
    observations: &'a [MemberObservation],
) -> LoadPlan<'a> {
    let same_config = status.config_hash.as_deref() == Some(hash);
    let live: BTreeSet<&str> = observations.iter().map(|o| o.member.node.as_str()).collect();

    let mut plan = LoadPlan::default();
    if same_config {
        plan.loaded = status
            .loaded_members
            .iter()
            .filter(|m| live.contains(m.as_str()))
            .cloned()
            .collect();
    }
    let rejected: BTreeMap<&str, &MemberFailure> = if same_config {
        status
            .failed_members
            .iter()
            .filter(|f| !f.retryable)
            .map(|f| (f.member.as_str(), f))
            .collect()
    } else {
        BTreeMap::new()
    };

    for observation in observations {
        if !spec.selects(&observation.pod.labels) {
            continue;
        }
        let node = observation.member.node.as_str();
        if plan.loaded.contains(node) {
            continue;
        }
        if let Some(failure) = rejected.get(node) {
            plan.rejected.push((*failure).clone());
        } else if observation.pod.ready {
            plan.push.push(observation);
        } else {
            plan.waiting += 1;
        }
    }
    plan
}

/// Next status and requeue delay after a load pass
pub fn load_result(
    ctx: &Context,
    previous: &EmqxPluginStatus,
    hash: &str,
    loaded: BTreeSet<String>,
    failures: Vec<MemberFailure>,
    waiting: usize,
    now: &str,
) -> (EmqxPluginStatus, Option<Duration>) {
    let same_config = previous.config_hash.as_deref() == Some(hash);
    let retryable = failures.iter().any(|f| f.retryable);
    let load_attempts = if retryable {
        let prior = if same_config { previous.load_attempts } else { 0 };
        prior.saturating_add(1)
    } else {
        0
    };

    let (phase, message, requeue) = if !failures.is_empty() {
        let names: Vec<&str> = failures.iter().map(|f| f.member.as_str()).collect();
        (
            PluginPhase::LoadFailed,
            format!("failed on {} member(s): {}", failures.len(), names.join(", ")),
            retryable.then(|| ctx.config.plugin_backoff(load_attempts)),
        )
    } else if waiting > 0 {
        (
            PluginPhase::Loading,
            format!("waiting for {} member(s) to become ready", waiting),
            Some(ctx.config.converge_interval),
        )
    } else {
        (
            PluginPhase::Loaded,
            format!("loaded on {} member(s)", loaded.len()),
            None,
        )
    };

    let status = EmqxPluginStatus {
        phase,
        loaded_members: loaded.into_iter().collect(),
        failed_members: failures,
        config_hash: Some(hash.to_string()),
        load_attempts,
        unload_attempts: 0,
        message: Some(message),
        observed_generation: previous.observed_generation,
        last_transition_time: previous.last_transition_time.clone(),
        last_attempt_time: retryable.then(|| now.to_string()),
    };
    (status, requeue)
}

fn record_operation(ctx: &Context, operation: &'static str, result: &Result<()>) {
    if let Some(metrics) = &ctx.metrics {
        let outcome = match result {
            Ok(()) => "success",
            Err(e) => e.reason(),
        };
        metrics.plugin_operation(operation, outcome);
    }
}

fn failure(err: &OperatorError, member: &Member) -> MemberFailure {
    MemberFailure {
        member: member.node.clone(),
        reason: err.to_string(),
        retryable: err.is_retryable(),
    }
}

/// Run every bound plugin for this cluster
///
/// Failures are scoped to the plugin they happened on; the returned delay
/// is the earliest any plugin asked to be revisited.
#[instrument(skip(ctx, cluster, observations), fields(cluster = %cluster.name(), namespace = %cluster.namespace()))]
pub async fn reconcile_plugins(
    ctx: &Context,
    cluster: &dyn EmqxCluster,
    observations: &[MemberObservation],
) -> Result<Option<Duration>> {
    drive_bound(ctx, cluster, observations, |_| true).await
}

/// Process only the deletions among the cluster's bound plugins
///
/// Runs when a pass failed before reaching the plugin stage, so a broken
/// cluster spec never holds a deleted plugin's finalizer.
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name(), namespace = %cluster.namespace()))]
pub async fn finish_deletions(
    ctx: &Context,
    cluster: &dyn EmqxCluster,
) -> Result<Option<Duration>> {
    let observations = status::observe_members(ctx, cluster).await?;
    drive_bound(ctx, cluster, &observations, |p| {
        p.meta().deletion_timestamp.is_some()
    })
    .await
}

async fn drive_bound(
    ctx: &Context,
    cluster: &dyn EmqxCluster,
    observations: &[MemberObservation],
    include: impl Fn(&EmqxPlugin) -> bool,
) -> Result<Option<Duration>> {
    let namespace = cluster.namespace();
    let key = cluster.cluster_ref();
    let clusters = ctx.guard(ctx.platform.list_clusters(&namespace)).await?;
    let plugins = ctx.guard(ctx.platform.list_plugins(&namespace)).await?;

    let mut requeue: Option<Duration> = None;
    let mut earliest = |delay: Duration| {
        requeue = Some(requeue.map_or(delay, |r: Duration| r.min(delay)));
    };

    for plugin in plugins
        .iter()
        .filter(|p| include(p) && bound_cluster(&p.spec, &clusters) == Some(&key))
    {
        match reconcile_plugin(ctx, cluster, plugin, observations).await {
            Ok(Some(delay)) => earliest(delay),
            Ok(None) => {}
            Err(OperatorError::Cancelled) => return Err(OperatorError::Cancelled),
            Err(e) => {
                warn!(plugin = %plugin.name_any(), error = %e, "Plugin reconcile failed");
                if e.is_retryable() {
                    earliest(
                        e.requeue_delay()
                            .unwrap_or(ctx.config.plugin_retry_base),
                    );
                }
            }
        }
    }
    Ok(requeue)
}

/// Drive one plugin a step forward
#[instrument(skip(ctx, cluster, plugin, observations), fields(plugin = %plugin.name_any()))]
pub async fn reconcile_plugin(
    ctx: &Context,
    cluster: &dyn EmqxCluster,
    plugin: &EmqxPlugin,
    observations: &[MemberObservation],
) -> Result<Option<Duration>> {
    let has_finalizer = plugin.finalizers().iter().any(|f| f == PLUGIN_FINALIZER);
    let previous = plugin.status.clone().unwrap_or_default();

    if let Err(e) = plugin.spec.validate() {
        return reject_invalid(ctx, plugin, &previous, has_finalizer, e.to_string()).await;
    }

    if plugin.meta().deletion_timestamp.is_some() {
        if !has_finalizer {
            return Ok(None);
        }
        return unload(ctx, plugin, &previous, observations).await;
    }

    let mut previous = previous;
    if !has_finalizer {
        ctx.guard(
            ctx.platform
                .add_plugin_finalizer(plugin, PLUGIN_FINALIZER),
        )
        .await?;
        let loading = EmqxPluginStatus {
            phase: PluginPhase::Loading,
            observed_generation: plugin.meta().generation.unwrap_or(0),
            message: Some("finalizer attached".to_string()),
            ..previous.clone()
        };
        write_status(ctx, plugin, &previous, loading.clone()).await?;
        previous = loading;
    }

    load(ctx, cluster, plugin, &previous, observations).await
}

async fn load(
    ctx: &Context,
    cluster: &dyn EmqxCluster,
    plugin: &EmqxPlugin,
    previous: &EmqxPluginStatus,
    observations: &[MemberObservation],
) -> Result<Option<Duration>> {
    let now = ctx.now();
    let hash = config_hash(&plugin.spec);
    if previous.phase == PluginPhase::LoadFailed && previous.config_hash.as_deref() == Some(hash.as_str()) {
        if let Some(wait) = retry_wait(ctx, previous.load_attempts, previous.last_attempt_time.as_deref(), now) {
            debug!(wait_secs = wait.as_secs(), "Load retry not due yet");
            return Ok(Some(wait));
        }
    }
    let plan = plan_load(&plugin.spec, previous, &hash, observations);
    let mut loaded = plan.loaded;
    let mut failures = plan.rejected;

    let results: Vec<(Member, Result<()>)> = stream::iter(plan.push)
        .map(|o| async move {
            let result = ctx
                .guard(ctx.admin.load_plugin(
                    &o.member,
                    &plugin.spec.plugin_name,
                    &plugin.spec.config,
                ))
                .await;
            (o.member.clone(), result)
        })
        .buffered(ctx.config.member_concurrency.max(1))
        .boxed()
        .collect()
        .await;

    for (member, result) in results {
        record_operation(ctx, actions::LOAD, &result);
        match result {
            Ok(()) => {
                debug!(member = %member.node, "Plugin loaded on member");
                loaded.insert(member.node);
            }
            Err(OperatorError::Cancelled) => return Err(OperatorError::Cancelled),
            Err(e) => {
                warn!(member = %member.node, error = %e, "Plugin load failed on member");
                failures.push(failure(&e, &member));
            }
        }
    }
    failures.sort_by(|a, b| a.member.cmp(&b.member));

    let (mut next, requeue) = load_result(
        ctx,
        previous,
        &hash,
        loaded,
        failures,
        plan.waiting,
        &now.to_rfc3339(),
    );
    next.observed_generation = plugin.meta().generation.unwrap_or(0);

    if next.phase != previous.phase {
        match next.phase {
            PluginPhase::Loaded => {
                info!(cluster = %cluster.name(), "Plugin loaded on every selected member");
                publish(ctx, plugin, EventType::Normal, reasons::PLUGIN_LOADED, actions::LOAD, next.message.clone()).await;
            }
            PluginPhase::LoadFailed => {
                publish(ctx, plugin, EventType::Warning, reasons::PLUGIN_LOAD_FAILED, actions::LOAD, next.message.clone()).await;
            }
            _ => {}
        }
    }

    write_status(ctx, plugin, previous, next).await?;
    Ok(requeue)
}

async fn unload(
    ctx: &Context,
    plugin: &EmqxPlugin,
    previous: &EmqxPluginStatus,
    observations: &[MemberObservation],
) -> Result<Option<Duration>> {
    let now = ctx.now();
    if let Some(wait) = retry_wait(ctx, previous.unload_attempts, previous.last_attempt_time.as_deref(), now) {
        debug!(wait_secs = wait.as_secs(), "Unload retry not due yet");
        return Ok(Some(wait));
    }

    let loaded: BTreeSet<&str> = previous.loaded_members.iter().map(String::as_str).collect();
    let targets: Vec<&MemberObservation> = observations
        .iter()
        .filter(|o| plugin.spec.selects(&o.pod.labels) || loaded.contains(o.member.node.as_str()))
        .collect();
    let attempt = previous.unload_attempts.saturating_add(1);

    let results: Vec<(Member, Result<()>)> = stream::iter(targets)
        .map(|o| async move {
            let result = if o.pod.ready {
                ctx.guard(
                    ctx.admin
                        .unload_plugin(&o.member, &plugin.spec.plugin_name),
                )
                .await
            } else {
                Err(OperatorError::ConnectivityError {
                    member: o.member.node.clone(),
                    message: "member is not ready".to_string(),
                })
            };
            (o.member.clone(), result)
        })
        .buffered(ctx.config.member_concurrency.max(1))
        .boxed()
        .collect()
        .await;

    let mut failures = vec![];
    for (member, result) in results {
        record_operation(ctx, actions::UNLOAD, &result);
        match result {
            Ok(()) => debug!(member = %member.node, "Plugin unloaded from member"),
            Err(OperatorError::Cancelled) => return Err(OperatorError::Cancelled),
            Err(e) => {
                warn!(member = %member.node, error = %e, attempt, "Plugin unload failed on member");
                failures.push(failure(&e, &member));
            }
        }
    }

    if failures.is_empty() {
        ctx.guard(
            ctx.platform
                .remove_plugin_finalizer(plugin, PLUGIN_FINALIZER),
        )
        .await?;
        info!("Plugin unloaded, finalizer released");
        publish(
            ctx,
            plugin,
            EventType::Normal,
            reasons::PLUGIN_UNLOADED,
            actions::UNLOAD,
            Some(format!("unloaded after {} attempt(s)", attempt)),
        )
        .await;
        return Ok(None);
    }

    let names: Vec<&str> = failures.iter().map(|f| f.member.as_str()).collect();
    if attempt >= ctx.config.max_unload_attempts {
        ctx.guard(
            ctx.platform
                .remove_plugin_finalizer(plugin, PLUGIN_FINALIZER),
        )
        .await?;
        warn!(attempt, members = ?names, "Unload attempts exhausted, finalizer released");
        publish(
            ctx,
            plugin,
            EventType::Warning,
            reasons::UNLOAD_ABANDONED,
            actions::UNLOAD,
            Some(format!(
                "gave up after {} attempt(s); plugin may still run on: {}",
                attempt,
                names.join(", ")
            )),
        )
        .await;
        return Ok(None);
    }

    let next = EmqxPluginStatus {
        phase: PluginPhase::Unloading,
        unload_attempts: attempt,
        message: Some(format!(
            "unload attempt {}/{} failed on: {}",
            attempt,
            ctx.config.max_unload_attempts,
            names.join(", ")
        )),
        failed_members: failures,
        last_attempt_time: Some(now.to_rfc3339()),
        ..previous.clone()
    };
    write_status(ctx, plugin, previous, next).await?;
    Ok(Some(ctx.config.plugin_backoff(attempt)))
}

/// Persist `next` unless it equals `previous`, stamping phase transitions
async fn write_status(
    ctx: &Context,
    plugin: &EmqxPlugin,
    previous: &EmqxPluginStatus,
    mut next: EmqxPluginStatus,
) -> Result<()> {
    if next.phase != previous.phase || next.last_transition_time.is_none() {
        next.last_transition_time = Some(ctx.now().to_rfc3339());
    }
    if &next == previous {
        return Ok(());
    }
    ctx.guard(ctx.platform.patch_plugin_status(plugin, &next))
        .await
}

async fn publish(
    ctx: &Context,
    plugin: &EmqxPlugin,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&plugin.object_ref(&()), type_, reason, action, note)
        .await;
}

/// Park a plugin whose spec fails validation
///
/// Nothing is pushed and nothing is retried until the spec changes. A
/// deleted invalid plugin is released at once: its name cannot be put on
/// the wire to unload it.
async fn reject_invalid(
    ctx: &Context,
    plugin: &EmqxPlugin,
    previous: &EmqxPluginStatus,
    has_finalizer: bool,
    reason: String,
) -> Result<Option<Duration>> {
    if plugin.meta().deletion_timestamp.is_some() {
        if has_finalizer {
            ctx.guard(
                ctx.platform
                    .remove_plugin_finalizer(plugin, PLUGIN_FINALIZER),
            )
            .await?;
            publish(
                ctx,
                plugin,
                EventType::Warning,
                reasons::UNLOAD_ABANDONED,
                actions::UNLOAD,
                Some(format!("invalid spec, nothing unloaded: {}", reason)),
            )
            .await;
        }
        return Ok(None);
    }

    warn!(error = %reason, "Plugin spec is invalid");
    let next = EmqxPluginStatus {
        phase: PluginPhase::LoadFailed,
        failed_members: vec![],
        load_attempts: 0,
        last_attempt_time: None,
        message: Some(format!("invalid spec: {}", reason)),
        observed_generation: plugin.meta().generation.unwrap_or(0),
        ..previous.clone()
    };
    if next.phase != previous.phase {
        publish(
            ctx,
            plugin,
            EventType::Warning,
            reasons::PLUGIN_LOAD_FAILED,
            actions::LOAD,
            next.message.clone(),
        )
        .await;
    }
    write_status(ctx, plugin, previous, next).await?;
    Ok(None)
}

/// Release every deleted plugin in `namespace` that no live cluster binds
///
/// Runs when a cluster is deleted or gone, since that cluster's passes no
/// longer drive the plugins it used to bind.
pub async fn release_orphans(ctx: &Context, namespace: &str) -> Result<()> {
    let clusters = ctx.guard(ctx.platform.list_clusters(namespace)).await?;
    let plugins = ctx.guard(ctx.platform.list_plugins(namespace)).await?;
    for plugin in plugins
        .iter()
        .filter(|p| bound_cluster(&p.spec, &clusters).is_none())
    {
        release_orphan(ctx, plugin).await?;
    }
    Ok(())
}

/// Release a deleted plugin no cluster selects anymore
///
/// With no bound cluster there are no members to unload from.
pub async fn release_orphan(ctx: &Context, plugin: &EmqxPlugin) -> Result<()> {
    if plugin.meta().deletion_timestamp.is_none()
        || !plugin.finalizers().iter().any(|f| f == PLUGIN_FINALIZER)
    {
        return Ok(());
    }
    ctx.guard(
        ctx.platform
            .remove_plugin_finalizer(plugin, PLUGIN_FINALIZER),
    )
    .await?;
    info!(plugin = %plugin.name_any(), "Released plugin without a bound cluster");
    publish(
        ctx,
        plugin,
        EventType::Normal,
        reasons::PLUGIN_UNLOADED,
        actions::UNLOAD,
        Some("no cluster selects this plugin".to_string()),
    )
    .await;
    Ok(())
}
