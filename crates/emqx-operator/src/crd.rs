//! Custom Resource Definitions for the EMQX Kubernetes Operator
//!
//! Defines the `EmqxBroker` and `EmqxEnterprise` cluster resources, which
//! share a [`ClusterSpec`], and the `EmqxPlugin` resource that loads a broker
//! plugin onto selected cluster members.

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, PodSecurityContext, ResourceRequirements, SecurityContext, Toleration,
};
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group shared by every resource in this crate
pub const API_GROUP: &str = "apps.emqx.io";

/// API version served by this operator
pub const API_VERSION: &str = "v1beta4";

/// Broker release used when neither `image` nor `version` is set
pub const DEFAULT_EMQX_VERSION: &str = "4.4.19";

/// Condition reporting whether every desired member is up and healthy
pub const CONDITION_RUNNING: &str = "Running";

/// Condition reporting the outcome of the last reconcile pass
pub const CONDITION_RECONCILED: &str = "Reconciled";

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$")
        .unwrap_or_else(|e| panic!("invalid quantity regex: {e}"))
});

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
        .unwrap_or_else(|e| panic!("invalid name regex: {e}"))
});

/// Regex for broker plugin names (e.g. "emqx_lwm2m")
static PLUGIN_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*$").unwrap_or_else(|e| panic!("invalid plugin regex: {e}"))
});

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate a Kubernetes name (RFC 1123 label)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("imagePullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

/// Validate environment variables
fn validate_env_vars(vars: &[EnvVar]) -> Result<(), ValidationError> {
    const MAX_ENV_VARS: usize = 100;
    if vars.len() > MAX_ENV_VARS {
        return Err(ValidationError::new("too_many_env_vars").with_message(
            format!("maximum {} environment variables allowed", MAX_ENV_VARS).into(),
        ));
    }
    let forbidden = ["LD_PRELOAD", "LD_LIBRARY_PATH", "EMQX_NAME", "EMQX_HOST"];
    for var in vars {
        if var.name.is_empty() || var.name.len() > 256 {
            return Err(ValidationError::new("invalid_env_name")
                .with_message("environment variable name must be 1-256 characters".into()));
        }
        // Node identity is derived from the pod; overriding it splits the cluster
        if forbidden.contains(&var.name.as_str()) {
            return Err(ValidationError::new("forbidden_env_var").with_message(
                format!("environment variable '{}' is managed by the operator", var.name).into(),
            ));
        }
    }
    Ok(())
}

/// Validate annotations map
fn validate_annotations(annotations: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if annotations.len() > 50 {
        return Err(ValidationError::new("too_many_annotations")
            .with_message("maximum 50 annotations allowed".into()));
    }
    for (key, value) in annotations {
        if key.len() > 253 {
            return Err(ValidationError::new("annotation_key_too_long")
                .with_message(format!("annotation key '{}' exceeds 253 characters", key).into()));
        }
        if value.len() > 262144 {
            return Err(ValidationError::new("annotation_value_too_long")
                .with_message(format!("annotation '{}' value exceeds 256KB", key).into()));
        }
    }
    Ok(())
}

/// Validate labels map
fn validate_labels(labels: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if labels.len() > 20 {
        return Err(ValidationError::new("too_many_labels")
            .with_message("maximum 20 labels allowed".into()));
    }
    for (key, value) in labels {
        if key.len() > 253 || value.len() > 63 {
            return Err(ValidationError::new("label_too_long")
                .with_message("label key max 253 chars, value max 63 chars".into()));
        }
        if key.starts_with("app.kubernetes.io/") {
            return Err(ValidationError::new("reserved_label").with_message(
                format!("label '{}' uses reserved prefix app.kubernetes.io/", key).into(),
            ));
        }
    }
    Ok(())
}

/// Validate PVC access modes
fn validate_access_modes(modes: &[String]) -> Result<(), ValidationError> {
    let valid_modes = [
        "ReadWriteOnce",
        "ReadOnlyMany",
        "ReadWriteMany",
        "ReadWriteOncePod",
    ];
    for mode in modes {
        if !valid_modes.contains(&mode.as_str()) {
            return Err(ValidationError::new("invalid_access_mode")
                .with_message(format!("'{}' is not a valid access mode", mode).into()));
        }
    }
    Ok(())
}

/// Validate broker configuration overrides
fn validate_broker_config(config: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if config.len() > 200 {
        return Err(ValidationError::new("too_many_config_entries")
            .with_message("maximum 200 broker configuration entries allowed".into()));
    }
    for (key, value) in config {
        if key.is_empty() || key.len() > 128 || value.len() > 4096 {
            return Err(ValidationError::new("config_entry_too_long")
                .with_message("config key must be 1-128 chars, value max 4096 chars".into()));
        }
        if key.contains('\n') || value.contains('\n') {
            return Err(ValidationError::new("config_newline").with_message(
                format!("config entry '{}' must not contain newlines", key).into(),
            ));
        }
        // Identity keys are derived per pod
        if key == "node.name" || key == "cluster.discovery" {
            return Err(ValidationError::new("forbidden_config").with_message(
                format!("config key '{}' is managed by the operator", key).into(),
            ));
        }
    }
    Ok(())
}

/// Validate service type
fn validate_service_type(service_type: &str) -> Result<(), ValidationError> {
    match service_type {
        "ClusterIP" | "NodePort" | "LoadBalancer" => Ok(()),
        _ => Err(ValidationError::new("invalid_service_type")
            .with_message("service type must be ClusterIP, NodePort, or LoadBalancer".into())),
    }
}

/// Validate node port assignments
fn validate_node_ports(ports: &BTreeMap<String, i32>) -> Result<(), ValidationError> {
    for (name, port) in ports {
        if !LISTENER_PORTS.iter().any(|(listener, _)| listener == name) {
            return Err(ValidationError::new("unknown_listener")
                .with_message(format!("'{}' is not a known listener", name).into()));
        }
        if !(30000..=32767).contains(port) {
            return Err(ValidationError::new("invalid_node_port")
                .with_message(format!("node port {} is outside 30000-32767", port).into()));
        }
    }
    Ok(())
}

/// Listener ports exposed by every broker member
pub const LISTENER_PORTS: [(&str, i32); 6] = [
    ("mqtt", 1883),
    ("mqtts", 8883),
    ("ws", 8083),
    ("wss", 8084),
    ("dashboard", 18083),
    ("management", 8081),
];

/// Port of the management API on every member
pub const MANAGEMENT_PORT: i32 = 8081;

/// Shared specification of an EMQX cluster
///
/// Both cluster kinds embed this struct; the operator core only ever sees
/// it through the [`crate::cluster::EmqxCluster`] trait.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of broker members (0-64); zero scales the cluster down
    #[serde(default = "default_replicas")]
    #[validate(range(min = 0, max = 64, message = "replicas must be between 0 and 64"))]
    pub replicas: i32,

    /// Broker version, used to derive the default image
    #[serde(default = "default_version")]
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    pub version: String,

    /// Container image (overrides the version-based default)
    #[serde(default)]
    #[validate(custom(function = "validate_image"))]
    pub image: Option<String>,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default = "default_image_pull_policy")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: String,

    /// Image pull secrets (max 10 secrets)
    #[serde(default)]
    #[validate(length(max = 10, message = "maximum 10 image pull secrets allowed"))]
    pub image_pull_secrets: Vec<String>,

    /// Persistent storage; absent means ephemeral storage
    #[serde(default)]
    #[validate(nested)]
    pub storage: Option<StorageSpec>,

    /// Pod and broker template
    #[serde(default)]
    #[validate(nested)]
    pub template: EmqxTemplate,

    /// Client-facing service template
    #[serde(default)]
    #[validate(nested)]
    pub service_template: ServiceTemplate,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            version: default_version(),
            image: None,
            image_pull_policy: default_image_pull_policy(),
            image_pull_secrets: vec![],
            storage: None,
            template: EmqxTemplate::default(),
            service_template: ServiceTemplate::default(),
        }
    }
}

/// Storage specification for broker data
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_storage_spec"))]
pub struct StorageSpec {
    /// Storage size (e.g., "1Gi")
    #[serde(default = "default_storage_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub size: String,

    /// Storage class name (empty uses the platform default)
    #[serde(default)]
    #[validate(custom(function = "validate_k8s_name"))]
    pub storage_class_name: Option<String>,

    /// Access modes for the claims
    #[serde(default = "default_access_modes")]
    #[validate(length(min = 1, max = 3, message = "access modes must have 1-3 entries"))]
    #[validate(custom(function = "validate_access_modes"))]
    pub access_modes: Vec<String>,

    /// Keep data on an emptyDir instead of a claim
    #[serde(default)]
    pub ephemeral: bool,
}

/// An ephemeral volume has no storage class; asking for both is contradictory
fn validate_storage_spec(storage: &StorageSpec) -> Result<(), ValidationError> {
    if storage.ephemeral && storage.storage_class_name.is_some() {
        return Err(ValidationError::new("conflicting_storage").with_message(
            "storage.ephemeral and storage.storageClassName are mutually exclusive".into(),
        ));
    }
    Ok(())
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
            access_modes: default_access_modes(),
            ephemeral: false,
        }
    }
}

impl StorageSpec {
    /// Whether this spec asks for persistent claims
    pub fn is_persistent(&self) -> bool {
        !self.ephemeral
    }
}

/// Pod template and broker settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxTemplate {
    /// Additional pod labels (cannot use app.kubernetes.io/*)
    #[serde(default)]
    #[validate(custom(function = "validate_labels"))]
    pub labels: BTreeMap<String, String>,

    /// Additional pod annotations
    #[serde(default)]
    #[validate(custom(function = "validate_annotations"))]
    pub annotations: BTreeMap<String, String>,

    /// Resource requirements (CPU, memory)
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Extra environment variables
    #[serde(default)]
    #[validate(custom(function = "validate_env_vars"))]
    pub env: Vec<EnvVar>,

    /// Broker configuration rendered into emqx.conf
    #[serde(default)]
    #[validate(custom(function = "validate_broker_config"))]
    pub config: BTreeMap<String, String>,

    /// ACL rules rendered into acl.conf, in order
    #[serde(default)]
    #[validate(length(max = 500, message = "maximum 500 ACL rules allowed"))]
    pub acl: Vec<String>,

    /// Node selector for pod scheduling
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for pod scheduling
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Pod affinity/anti-affinity rules
    #[serde(default)]
    pub affinity: Option<Affinity>,

    /// Security context for pods
    #[serde(default)]
    pub security_context: Option<PodSecurityContext>,

    /// Container security context
    #[serde(default)]
    pub container_security_context: Option<SecurityContext>,
}

/// Client-facing service template
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    /// Service type
    #[serde(default = "default_service_type", rename = "type")]
    #[validate(custom(function = "validate_service_type"))]
    pub type_: String,

    /// Service annotations
    #[serde(default)]
    #[validate(custom(function = "validate_annotations"))]
    pub annotations: BTreeMap<String, String>,

    /// Service labels
    #[serde(default)]
    #[validate(custom(function = "validate_labels"))]
    pub labels: BTreeMap<String, String>,

    /// Node ports by listener name (NodePort/LoadBalancer only)
    #[serde(default)]
    #[validate(custom(function = "validate_node_ports"))]
    pub node_ports: BTreeMap<String, i32>,
}

impl Default for ServiceTemplate {
    fn default() -> Self {
        Self {
            type_: default_service_type(),
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            node_ports: BTreeMap::new(),
        }
    }
}

/// EmqxBroker custom resource definition
///
/// An open-source EMQX cluster.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "apps.emqx.io",
    version = "v1beta4",
    kind = "EmqxBroker",
    plural = "emqxbrokers",
    shortname = "emqx",
    namespaced,
    status = "EmqxClusterStatus",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Running", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Running\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EmqxBrokerSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub cluster: ClusterSpec,
}

/// EmqxEnterprise custom resource definition
///
/// An EMQX Enterprise cluster; identical to a broker apart from the license.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "apps.emqx.io",
    version = "v1beta4",
    kind = "EmqxEnterprise",
    plural = "emqxenterprises",
    shortname = "emqx-ee",
    namespaced,
    status = "EmqxClusterStatus",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Running", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Running\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EmqxEnterpriseSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub cluster: ClusterSpec,

    /// License secret mounted into every member
    #[serde(default)]
    #[validate(nested)]
    pub license: Option<LicenseSpec>,
}

/// Enterprise license reference
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LicenseSpec {
    /// Secret holding `emqx.lic`
    #[validate(length(min = 1, max = 63, message = "secret name must be 1-63 characters"))]
    #[validate(custom(function = "validate_k8s_name"))]
    pub secret_name: String,
}

/// Observed state of an EMQX cluster
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxClusterStatus {
    /// Desired member count (mirrors the spec)
    pub replicas: i32,

    /// Members passing both the platform and the broker health check
    pub ready_replicas: i32,

    /// One entry per observed member
    #[serde(default)]
    pub node_statuses: Vec<NodeStatus>,

    /// Conditions describing cluster state
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Generation this status was computed for
    #[serde(default)]
    pub observed_generation: i64,
}

impl EmqxClusterStatus {
    /// Look up a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&ClusterCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Whether the Running condition is True
    pub fn is_running(&self) -> bool {
        self.condition(CONDITION_RUNNING)
            .is_some_and(|c| c.status == "True")
    }
}

/// Health snapshot of one broker member
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Erlang node name (emqx@host)
    pub node: String,

    /// Pod backing this member
    pub pod_name: String,

    /// Status reported by the broker, or why it could not be asked
    pub node_status: String,

    /// Broker version
    pub version: Option<String>,

    /// Erlang/OTP release
    pub otp_release: Option<String>,

    /// Ready on both the platform and the broker side
    pub ready: bool,
}

/// Condition describing an aspect of cluster state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Machine-readable reason
    pub reason: Option<String>,

    /// Human-readable message
    pub message: Option<String>,

    /// Last time the status changed
    pub last_transition_time: Option<String>,

    /// Last time the condition was computed
    pub last_update_time: Option<String>,
}

/// EmqxPlugin custom resource definition
///
/// Loads `pluginName` with `config` onto every member of every cluster
/// whose labels match `selector`.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "apps.emqx.io",
    version = "v1beta4",
    kind = "EmqxPlugin",
    plural = "emqxplugins",
    shortname = "emqxplugin",
    namespaced,
    status = "EmqxPluginStatus",
    printcolumn = r#"{"name":"Plugin", "type":"string", "jsonPath":".spec.pluginName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EmqxPluginSpec {
    /// Broker plugin name (e.g. emqx_lwm2m)
    #[validate(length(min = 1, max = 128, message = "plugin name must be 1-128 characters"))]
    #[validate(custom(function = "validate_plugin_name"))]
    pub plugin_name: String,

    /// Labels a cluster and its members must carry to receive this plugin
    #[serde(default)]
    #[validate(custom(function = "validate_selector"))]
    pub selector: BTreeMap<String, String>,

    /// Plugin configuration pushed with the load request
    #[serde(default)]
    #[validate(custom(function = "validate_plugin_config"))]
    pub config: BTreeMap<String, String>,
}

/// Validate a broker plugin name
fn validate_plugin_name(name: &str) -> Result<(), ValidationError> {
    if PLUGIN_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_plugin_name")
            .with_message(format!("'{}' is not a valid plugin name", name).into()))
    }
}

/// Validate a plugin selector; an empty selector would match every cluster
fn validate_selector(selector: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if selector.is_empty() {
        return Err(ValidationError::new("empty_selector")
            .with_message("selector must contain at least one label".into()));
    }
    if selector.len() > 20 {
        return Err(ValidationError::new("too_many_selector_labels")
            .with_message("maximum 20 selector labels allowed".into()));
    }
    Ok(())
}

/// Validate plugin configuration entries
fn validate_plugin_config(config: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if config.len() > 100 {
        return Err(ValidationError::new("too_many_plugin_config_entries")
            .with_message("maximum 100 plugin configuration entries allowed".into()));
    }
    for (key, value) in config {
        if key.is_empty() || key.len() > 128 || value.len() > 4096 {
            return Err(ValidationError::new("plugin_config_too_long")
                .with_message("config key must be 1-128 chars, value max 4096 chars".into()));
        }
    }
    Ok(())
}

impl EmqxPluginSpec {
    /// Whether `labels` carry every selector entry
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Lifecycle phase of a plugin
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PluginPhase {
    /// Seen, finalizer not attached yet
    #[default]
    Pending,
    /// Finalizer attached, waiting for every selected member
    Loading,
    /// Loaded on every selected member
    Loaded,
    /// At least one member rejected the plugin or could not be reached
    LoadFailed,
    /// Marked for deletion, unloading from members
    Unloading,
}

impl std::fmt::Display for PluginPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginPhase::Pending => "Pending",
            PluginPhase::Loading => "Loading",
            PluginPhase::Loaded => "Loaded",
            PluginPhase::LoadFailed => "LoadFailed",
            PluginPhase::Unloading => "Unloading",
        };
        f.write_str(s)
    }
}

/// Observed state of an EmqxPlugin
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxPluginStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: PluginPhase,

    /// Members that accepted the current configuration
    #[serde(default)]
    pub loaded_members: Vec<String>,

    /// Members that failed during the last attempt
    #[serde(default)]
    pub failed_members: Vec<MemberFailure>,

    /// Hash of the configuration `loadedMembers` refers to
    #[serde(default)]
    pub config_hash: Option<String>,

    /// Consecutive load attempts with at least one failure
    #[serde(default)]
    pub load_attempts: u32,

    /// Unload attempts since deletion was requested
    #[serde(default)]
    pub unload_attempts: u32,

    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,

    /// Generation this status was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// Last time the phase changed
    #[serde(default)]
    pub last_transition_time: Option<String>,

    /// When the last failed load or unload attempt ran; the next one waits
    /// out the retry backoff from here
    #[serde(default)]
    pub last_attempt_time: Option<String>,
}

/// A member that failed a plugin operation
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberFailure {
    /// Member node name
    pub member: String,

    /// Error reported for the member
    pub reason: String,

    /// Whether the next pass retries this member
    pub retryable: bool,
}

// Default value functions
fn default_replicas() -> i32 {
    3
}

fn default_version() -> String {
    DEFAULT_EMQX_VERSION.to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

/// Every CRD this operator serves, as a multi-document YAML stream
pub fn crds_yaml() -> crate::error::Result<String> {
    use kube::CustomResourceExt;

    let docs = [
        serde_yaml::to_string(&EmqxBroker::crd())?,
        serde_yaml::to_string(&EmqxEnterprise::crd())?,
        serde_yaml::to_string(&EmqxPlugin::crd())?,
    ];
    Ok(docs.join("---\n"))
}
