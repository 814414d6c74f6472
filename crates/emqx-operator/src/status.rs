//! Status Aggregator
//!
//! Recomputes a cluster's status from scratch every pass. A member counts as
//! ready only when its pod is Ready and the broker itself reports `Running`;
//! node statuses are a snapshot of the members observed in this pass.

use crate::admin::{Member, NodeHealth};
use crate::cluster::EmqxCluster;
use crate::context::Context;
use crate::crd::{
    ClusterCondition, EmqxClusterStatus, NodeStatus, CONDITION_RECONCILED, CONDITION_RUNNING,
};
use crate::error::{OperatorError, Result};
use crate::platform::MemberPod;
use crate::resources::selector_labels;
use futures::stream::{self, StreamExt};
use tracing::{debug, instrument};

/// What one pass learned about one member
#[derive(Debug, Clone)]
pub struct MemberObservation {
    pub pod: MemberPod,
    pub member: Member,
    /// Broker health; `None` when the pod was not ready and was not asked
    pub health: Option<std::result::Result<NodeHealth, String>>,
}

impl MemberObservation {
    /// Ready on both the platform and the broker side
    pub fn is_ready(&self) -> bool {
        self.pod.ready && matches!(&self.health, Some(Ok(h)) if h.is_running())
    }

    fn node_status(&self) -> NodeStatus {
        let (node_status, health) = match &self.health {
            Some(Ok(h)) => (h.node_status.clone(), Some(h)),
            Some(Err(_)) => ("Unreachable".to_string(), None),
            None if self.pod.crashing => ("Crashing".to_string(), None),
            None => ("NotReady".to_string(), None),
        };
        NodeStatus {
            node: self.member.node.clone(),
            pod_name: self.pod.name.clone(),
            node_status,
            version: health.and_then(|h| h.version.clone()),
            otp_release: health.and_then(|h| h.otp_release.clone()),
            ready: self.is_ready(),
        }
    }
}

/// List the cluster's pods and ask every ready one for its health
///
/// Member failures are recorded on the observation, not returned; only
/// platform errors and cancellation fail the call.
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name(), namespace = %cluster.namespace()))]
pub async fn observe_members(
    ctx: &Context,
    cluster: &dyn EmqxCluster,
) -> Result<Vec<MemberObservation>> {
    let name = cluster.name();
    let namespace = cluster.namespace();
    let pods = ctx
        .guard(
            ctx.platform
                .list_member_pods(&namespace, &selector_labels(cluster)),
        )
        .await?;

    let observations: Vec<Result<MemberObservation>> = stream::iter(pods)
        .map(|pod| {
            let member = Member::for_pod(&name, &namespace, &pod.name);
            async move {
                let health = if pod.ready {
                    match ctx.guard(ctx.admin.node_health(&member)).await {
                        Ok(h) => {
                            debug!(member = %member.node, status = %h.node_status, uptime = ?h.uptime, "Member health");
                            Some(Ok(h))
                        }
                        Err(OperatorError::Cancelled) => return Err(OperatorError::Cancelled),
                        Err(e) => {
                            debug!(member = %member.node, error = %e, "Member health check failed");
                            Some(Err(e.to_string()))
                        }
                    }
                } else {
                    None
                };
                Ok(MemberObservation {
                    pod,
                    member,
                    health,
                })
            }
        })
        .buffered(ctx.config.member_concurrency.max(1))
        .collect()
        .await;

    let mut observations = observations.into_iter().collect::<Result<Vec<_>>>()?;
    observations.sort_by(|a, b| {
        (a.pod.name.len(), &a.pod.name).cmp(&(b.pod.name.len(), &b.pod.name))
    });
    Ok(observations)
}

/// Insert or replace a condition
///
/// An identical condition is left untouched, so an unchanged pass produces
/// an unchanged status. The transition time only moves when the status does.
pub fn set_condition(
    conditions: &mut Vec<ClusterCondition>,
    condition_type: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    now: &str,
) {
    let status = if status { "True" } else { "False" };
    let message = message.into();
    let previous = conditions
        .iter()
        .find(|c| c.condition_type == condition_type);
    if previous.is_some_and(|p| {
        p.status == status
            && p.reason.as_deref() == Some(reason)
            && p.message.as_deref() == Some(message.as_str())
    }) {
        return;
    }
    let last_transition_time = match previous {
        Some(prev) if prev.status == status => prev
            .last_transition_time
            .clone()
            .or_else(|| Some(now.to_string())),
        _ => Some(now.to_string()),
    };
    let condition = ClusterCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message),
        last_transition_time,
        last_update_time: Some(now.to_string()),
    };
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Compute the cluster status for this pass
///
/// Only the `Reconciled` condition is carried over from `previous`; the
/// controller overwrites it once the pass outcome is known.
pub fn aggregate(
    cluster: &dyn EmqxCluster,
    observations: &[MemberObservation],
    previous: Option<&EmqxClusterStatus>,
    now: &str,
) -> EmqxClusterStatus {
    let replicas = cluster.spec().replicas;
    let ready = observations.iter().filter(|o| o.is_ready()).count() as i32;
    let crashing: Vec<&str> = observations
        .iter()
        .filter(|o| o.pod.crashing)
        .map(|o| o.pod.name.as_str())
        .collect();
    let all_observed_ready = observations.iter().all(|o| o.is_ready());

    let mut conditions: Vec<ClusterCondition> = previous
        .map(|p| {
            p.conditions
                .iter()
                .filter(|c| {
                    c.condition_type == CONDITION_RUNNING
                        || c.condition_type == CONDITION_RECONCILED
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let (running, reason, message) = if replicas == 0 {
        (false, "ScaledToZero", "cluster has no members".to_string())
    } else if !crashing.is_empty() {
        (
            false,
            "MemberCrashing",
            format!("members crashing: {}", crashing.join(", ")),
        )
    } else if ready == replicas && all_observed_ready {
        (
            true,
            "AllMembersReady",
            format!("{}/{} members ready", ready, replicas),
        )
    } else {
        (
            false,
            "MembersNotReady",
            format!("{}/{} members ready", ready.min(replicas), replicas),
        )
    };
    set_condition(&mut conditions, CONDITION_RUNNING, running, reason, message, now);

    EmqxClusterStatus {
        replicas,
        ready_replicas: ready.min(replicas),
        node_statuses: observations.iter().map(|o| o.node_status()).collect(),
        conditions,
        observed_generation: cluster.generation(),
    }
}
