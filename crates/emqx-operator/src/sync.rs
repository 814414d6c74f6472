//! Resource Synchronizer
//!
//! Applies desired children in the order the builder produced them:
//! create when absent, merge-patch when the mutable projection drifted,
//! leave alone when it already matches. Nothing is ever deleted.

use crate::context::Context;
use crate::error::{OperatorError, Result};
use crate::platform::ObservedObject;
use crate::resources::{ChildResource, LABEL_MANAGED_BY, MANAGER};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

/// Result of applying one child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Patched,
    Unchanged,
}

/// Per-pass tally of apply outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: Vec<String>,
    pub patched: Vec<String>,
    pub unchanged: usize,
}

impl SyncSummary {
    /// Whether the pass mutated the platform
    pub fn changed(&self) -> bool {
        !self.created.is_empty() || !self.patched.is_empty()
    }
}

/// Whether every field present in `desired` has the same value in `observed`
///
/// Nulls and empty containers in `desired` match missing fields, since the
/// API server drops them on write. Arrays must match element-wise. Resource
/// quantities compare by value, since the API server rewrites `0.5` as
/// `500m` and `1024Mi` as `1Gi`.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    subset(desired, observed, false)
}

fn subset(desired: &Value, observed: &Value, quantities: bool) -> bool {
    match (desired, observed) {
        (Value::Null, _) => true,
        (Value::Object(d), Value::Object(o)) => d.iter().all(|(k, v)| match o.get(k) {
            Some(ov) => subset(v, ov, quantities || holds_quantities(k)),
            None => is_empty(v),
        }),
        (Value::Object(d), Value::Null) => d.values().all(is_empty),
        (Value::Array(d), Value::Array(o)) => {
            d.len() == o.len() && d.iter().zip(o).all(|(dv, ov)| subset(dv, ov, quantities))
        }
        (Value::Array(d), Value::Null) => d.is_empty(),
        (Value::String(d), Value::String(o)) if quantities => {
            d == o
                || matches!(
                    (parse_quantity(d), parse_quantity(o)),
                    (Some(a), Some(b)) if (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0)
                )
        }
        (d, o) => d == o,
    }
}

/// Keys whose values are resource quantities
fn holds_quantities(key: &str) -> bool {
    matches!(key, "limits" | "requests" | "sizeLimit")
}

/// Numeric value of a Kubernetes quantity such as `500m`, `1Gi` or `1e3`
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "n" => return Some(number / 1e9),
        "u" => return Some(number / 1e6),
        "m" => return Some(number / 1e3),
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => 10f64.powi(exp[1..].parse().ok()?),
        _ => return None,
    };
    Some(number * multiplier)
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.values().all(is_empty),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Drop null fields so a merge patch never clears fields it does not own
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

fn object_at<'a>(value: &'a Value, path: &str) -> Option<&'a Map<String, Value>> {
    path.split('.')
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_object)
}

/// Merge patch that brings `observed` to the desired state, or `None` when
/// nothing differs
pub fn build_patch(child: &ChildResource, observed: &ObservedObject) -> Result<Option<Value>> {
    let desired = child.patchable()?;
    let mut differs = !is_subset(&desired, &observed.body);
    let mut patch = strip_nulls(desired);

    // merge patches merge maps; keys gone from an exact map must be nulled
    for path in child.exact_maps() {
        let removed: Vec<String> = match object_at(&observed.body, path) {
            Some(have) => {
                let want = object_at(&patch, path);
                have.keys()
                    .filter(|k| !want.is_some_and(|w| w.contains_key(*k)))
                    .cloned()
                    .collect()
            }
            None => vec![],
        };
        if removed.is_empty() {
            continue;
        }
        differs = true;
        let mut target = &mut patch;
        for key in path.split('.') {
            target = &mut target[key];
        }
        for key in removed {
            target[key.as_str()] = Value::Null;
        }
    }

    Ok(differs.then_some(patch))
}

/// Refuse to touch a resource another manager owns
fn verify_ownership(child: &ChildResource, observed: &ObservedObject) -> Result<()> {
    match observed.labels.get(LABEL_MANAGED_BY) {
        Some(manager) if manager != MANAGER => Err(OperatorError::ValidationError(format!(
            "{} '{}' is managed by '{}', not {}; refusing to take it over",
            child.kind(),
            child.name(),
            manager,
            MANAGER
        ))),
        _ => Ok(()),
    }
}

/// Make one child exist and match
#[instrument(skip(ctx, child), fields(kind = %child.kind(), name = child.name()))]
pub async fn apply_child(ctx: &Context, child: &ChildResource) -> Result<ApplyOutcome> {
    let observed = ctx
        .guard(
            ctx.platform
                .get_child(child.kind(), child.namespace(), child.name()),
        )
        .await?;

    let Some(observed) = observed else {
        ctx.guard(ctx.platform.create_child(child)).await?;
        info!("Created child resource");
        return Ok(ApplyOutcome::Created);
    };

    verify_ownership(child, &observed)?;

    match build_patch(child, &observed)? {
        None => {
            debug!("Child resource up to date");
            Ok(ApplyOutcome::Unchanged)
        }
        Some(patch) => {
            ctx.guard(ctx.platform.patch_child(
                child.kind(),
                child.namespace(),
                child.name(),
                observed.resource_version.clone(),
                &patch,
            ))
            .await?;
            info!("Patched child resource");
            Ok(ApplyOutcome::Patched)
        }
    }
}

/// Apply every child in order, stopping at the first error
pub async fn apply_all(ctx: &Context, children: &[ChildResource]) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();
    for child in children {
        let label = format!("{}/{}", child.kind(), child.name());
        match apply_child(ctx, child).await? {
            ApplyOutcome::Created => summary.created.push(label),
            ApplyOutcome::Patched => summary.patched.push(label),
            ApplyOutcome::Unchanged => summary.unchanged += 1,
        }
    }
    Ok(summary)
}
