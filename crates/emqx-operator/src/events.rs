//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failed publish is logged and never fails a
//! reconcile pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes human-readable pass outcomes on a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the event's reporting component
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// A child resource was created
    pub const RESOURCE_CREATED: &str = "ResourceCreated";
    /// A child resource was patched back to the desired state
    pub const RESOURCE_PATCHED: &str = "ResourcePatched";
    /// Every member reports healthy
    pub const CLUSTER_RUNNING: &str = "ClusterRunning";
    /// A previously running cluster lost a member
    pub const CLUSTER_DEGRADED: &str = "ClusterDegraded";
    /// The spec contradicts itself
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A pass failed with a retryable error
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// The plugin is loaded on every selected member
    pub const PLUGIN_LOADED: &str = "PluginLoaded";
    /// At least one member failed to load the plugin
    pub const PLUGIN_LOAD_FAILED: &str = "PluginLoadFailed";
    /// The plugin was unloaded and the finalizer released
    pub const PLUGIN_UNLOADED: &str = "PluginUnloaded";
    /// Unload retries ran out; the finalizer was released anyway
    pub const UNLOAD_ABANDONED: &str = "UnloadAbandoned";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const APPLY: &str = "Apply";
    pub const LOAD: &str = "Load";
    pub const UNLOAD: &str = "Unload";
}
