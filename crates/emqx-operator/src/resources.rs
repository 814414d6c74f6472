//! Kubernetes Resource Builders
//!
//! Maps a cluster specification onto the ordered list of child resources the
//! synchronizer applies: storage claims, the StatefulSet, the headless and
//! client Services, then the configuration ConfigMaps. Building is pure and
//! deterministic; the same spec always serializes to the same JSON, which
//! the synchronizer relies on when diffing.

use crate::cluster::EmqxCluster;
use crate::crd::{ClusterSpec, LISTENER_PORTS, MANAGEMENT_PORT};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapEnvSource, ConfigMapVolumeSource, Container, ContainerPort,
    EmptyDirVolumeSource, EnvFromSource, EnvVar, EnvVarSource, HTTPGetAction, LocalObjectReference,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSecurityContext,
    PodSpec, PodTemplateSpec, Probe, SecretVolumeSource, SecurityContext, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_VERSION: &str = "app.kubernetes.io/version";

/// Value of the managed-by label on everything this operator owns
pub const MANAGER: &str = "emqx-operator";

/// Pod template annotation carrying the rendered configuration digest
pub const CONFIG_DIGEST_ANNOTATION: &str = "apps.emqx.io/config-digest";

const DATA_DIR: &str = "/opt/emqx/data";
const ACL_PATH: &str = "/opt/emqx/etc/acl.conf";
const LICENSE_DIR: &str = "/mounted/license";
const EKKA_PORT: i32 = 4370;

/// Kind of a child resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    PersistentVolumeClaim,
    StatefulSet,
    Service,
    ConfigMap,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ChildKind::StatefulSet => "StatefulSet",
            ChildKind::Service => "Service",
            ChildKind::ConfigMap => "ConfigMap",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One desired child resource
#[derive(Debug, Clone, PartialEq)]
pub enum ChildResource {
    Claim(PersistentVolumeClaim),
    Workload(StatefulSet),
    Endpoint(Service),
    Config(ConfigMap),
}

impl ChildResource {
    pub fn kind(&self) -> ChildKind {
        match self {
            ChildResource::Claim(_) => ChildKind::PersistentVolumeClaim,
            ChildResource::Workload(_) => ChildKind::StatefulSet,
            ChildResource::Endpoint(_) => ChildKind::Service,
            ChildResource::Config(_) => ChildKind::ConfigMap,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            ChildResource::Claim(r) => &r.metadata,
            ChildResource::Workload(r) => &r.metadata,
            ChildResource::Endpoint(r) => &r.metadata,
            ChildResource::Config(r) => &r.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or("default")
    }

    /// Full object as sent on create
    pub fn to_value(&self) -> Result<Value> {
        let mut value = match self {
            ChildResource::Claim(r) => serde_json::to_value(r)?,
            ChildResource::Workload(r) => serde_json::to_value(r)?,
            ChildResource::Endpoint(r) => serde_json::to_value(r)?,
            ChildResource::Config(r) => serde_json::to_value(r)?,
        };
        // typed k8s-openapi objects omit apiVersion/kind when serialized bare
        if let Value::Object(map) = &mut value {
            let api_version = match self.kind() {
                ChildKind::StatefulSet => "apps/v1",
                _ => "v1",
            };
            map.insert("apiVersion".to_string(), json!(api_version));
            map.insert("kind".to_string(), json!(self.kind().as_str()));
        }
        Ok(value)
    }

    /// Mutable part of the object, compared against and merged onto the
    /// observed one. Immutable fields never appear here.
    pub fn patchable(&self) -> Result<Value> {
        let meta = self.metadata();
        let labels = serde_json::to_value(&meta.labels)?;
        let value = match self {
            ChildResource::Claim(_) => json!({ "metadata": { "labels": labels } }),
            ChildResource::Workload(sts) => {
                let spec = sts.spec.as_ref();
                json!({
                    "metadata": { "labels": labels },
                    "spec": {
                        "replicas": spec.and_then(|s| s.replicas),
                        "template": serde_json::to_value(spec.map(|s| &s.template))?,
                        "updateStrategy": serde_json::to_value(spec.and_then(|s| s.update_strategy.as_ref()))?,
                    }
                })
            }
            ChildResource::Endpoint(svc) => {
                let spec = svc.spec.as_ref();
                json!({
                    "metadata": {
                        "labels": labels,
                        "annotations": serde_json::to_value(&meta.annotations)?,
                    },
                    "spec": {
                        "type": spec.and_then(|s| s.type_.clone()),
                        "ports": serde_json::to_value(spec.and_then(|s| s.ports.as_ref()))?,
                        "selector": serde_json::to_value(spec.and_then(|s| s.selector.as_ref()))?,
                        "publishNotReadyAddresses": spec.and_then(|s| s.publish_not_ready_addresses),
                    }
                })
            }
            ChildResource::Config(cm) => json!({
                "metadata": { "labels": labels },
                "data": serde_json::to_value(&cm.data)?,
            }),
        };
        Ok(value)
    }

    /// Object paths whose map must equal the observed map exactly
    pub fn exact_maps(&self) -> &'static [&'static str] {
        match self {
            ChildResource::Config(_) => &["data"],
            _ => &[],
        }
    }
}

/// Name of the StatefulSet and client Service
pub fn statefulset_name(cluster_name: &str) -> String {
    cluster_name.to_string()
}

/// Name of the headless Service used for member discovery
pub fn headless_service_name(cluster_name: &str) -> String {
    format!("{}-headless", cluster_name)
}

/// Name of the claim template; claims are `<template>-<sts>-<ordinal>`
pub fn claim_template_name(cluster_name: &str) -> String {
    format!("{}-data", cluster_name)
}

/// Name of the claim the StatefulSet binds for `ordinal`
pub fn claim_name(cluster_name: &str, ordinal: i32) -> String {
    format!(
        "{}-{}-{}",
        claim_template_name(cluster_name),
        statefulset_name(cluster_name),
        ordinal
    )
}

pub fn configs_name(cluster_name: &str) -> String {
    format!("{}-configs", cluster_name)
}

pub fn acl_name(cluster_name: &str) -> String {
    format!("{}-acl", cluster_name)
}

/// Fully qualified DNS name of a member pod
pub fn member_host(cluster_name: &str, namespace: &str, pod_name: &str) -> String {
    format!(
        "{}.{}.{}.svc.cluster.local",
        pod_name,
        headless_service_name(cluster_name),
        namespace
    )
}

/// Erlang node name of a member pod
pub fn node_name(cluster_name: &str, namespace: &str, pod_name: &str) -> String {
    format!("emqx@{}", member_host(cluster_name, namespace, pod_name))
}

/// Labels selecting a cluster's pods
pub fn selector_labels(cluster: &dyn EmqxCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), "emqx".to_string()),
        (LABEL_INSTANCE.to_string(), cluster.name()),
        (
            LABEL_COMPONENT.to_string(),
            cluster.kind().as_str().to_string(),
        ),
    ])
}

/// Labels placed on every child resource
pub fn common_labels(cluster: &dyn EmqxCluster) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cluster);
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER.to_string());
    labels.insert(LABEL_VERSION.to_string(), cluster.spec().version.clone());
    labels
}

/// Broker environment variable for a configuration key
///
/// `listener.tcp.external` becomes `EMQX_LISTENER__TCP__EXTERNAL`.
pub fn config_env_name(key: &str) -> String {
    format!("EMQX_{}", key.replace('.', "__").to_uppercase())
}

/// Hex SHA-256 over sorted key/value pairs
pub fn digest(entries: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in entries {
        hasher.update(k.as_bytes());
        hasher.update([0u8]);
        hasher.update(v.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn non_empty<T: Clone>(items: &[T]) -> Option<Vec<T>> {
    (!items.is_empty()).then(|| items.to_vec())
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Builder for the desired children of one cluster
pub struct ResourceBuilder<'a> {
    cluster: &'a dyn EmqxCluster,
    name: String,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Validate the spec and bind the builder to a cluster
    pub fn new(cluster: &'a dyn EmqxCluster) -> Result<Self> {
        let name = cluster
            .meta()
            .name
            .clone()
            .ok_or_else(|| OperatorError::ValidationError("cluster name is required".into()))?;
        cluster
            .spec()
            .validate()
            .map_err(|e| OperatorError::ValidationError(e.to_string()))?;

        Ok(Self {
            cluster,
            name,
            namespace: cluster.namespace(),
        })
    }

    fn spec(&self) -> &ClusterSpec {
        self.cluster.spec()
    }

    fn owner_reference(&self) -> OwnerReference {
        self.cluster.owner_reference()
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(common_labels(self.cluster)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    fn persistent(&self) -> bool {
        self.spec()
            .storage
            .as_ref()
            .is_some_and(|s| s.is_persistent())
    }

    /// Every child in apply order: claims, workload, services, configuration
    pub fn build(&self) -> Result<Vec<ChildResource>> {
        let mut children: Vec<ChildResource> = self
            .build_claims()
            .into_iter()
            .map(ChildResource::Claim)
            .collect();
        children.push(ChildResource::Workload(self.build_statefulset()));
        children.push(ChildResource::Endpoint(self.build_headless_service()));
        children.push(ChildResource::Endpoint(self.build_client_service()));
        children.push(ChildResource::Config(self.build_configs()));
        if let Some(acl) = self.build_acl() {
            children.push(ChildResource::Config(acl));
        }
        Ok(children)
    }

    /// Claims matching the StatefulSet's claim template, one per replica
    pub fn build_claims(&self) -> Vec<PersistentVolumeClaim> {
        if !self.persistent() {
            return vec![];
        }
        (0..self.spec().replicas)
            .map(|ordinal| {
                let mut claim = self.claim_template();
                claim.metadata = self.metadata(claim_name(&self.name, ordinal));
                claim
            })
            .collect()
    }

    fn claim_template(&self) -> PersistentVolumeClaim {
        let storage = self.spec().storage.clone().unwrap_or_default();
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(claim_template_name(&self.name)),
                labels: Some(selector_labels(self.cluster)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(storage.access_modes.clone()),
                storage_class_name: storage.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage.size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Pod labels: cluster labels, then template labels, then managed keys
    fn pod_labels(&self) -> BTreeMap<String, String> {
        let mut labels: BTreeMap<String, String> = self
            .cluster
            .labels()
            .into_iter()
            .filter(|(k, _)| !k.starts_with("app.kubernetes.io/"))
            .collect();
        labels.extend(self.cluster.template().labels.clone());
        labels.extend(common_labels(self.cluster));
        labels
    }

    /// Build the StatefulSet running the broker members
    pub fn build_statefulset(&self) -> StatefulSet {
        let spec = self.spec();
        let template = self.cluster.template();

        let mut pod_annotations = template.annotations.clone();
        pod_annotations.insert(
            CONFIG_DIGEST_ANNOTATION.to_string(),
            digest(&self.rendered_config()),
        );

        let mut volumes = vec![];
        if !self.persistent() {
            volumes.push(Volume {
                name: claim_template_name(&self.name),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }
        if !template.acl.is_empty() {
            volumes.push(Volume {
                name: "acl".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: acl_name(&self.name),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        if let Some(secret) = self.cluster.license_secret() {
            volumes.push(Volume {
                name: "license".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        // EMQX images run as uid 1000; fs_group keeps the data volume writable
        let pod_security_context = template.security_context.clone().or_else(|| {
            Some(PodSecurityContext {
                run_as_user: Some(1000),
                run_as_group: Some(1000),
                fs_group: Some(1000),
                fs_group_change_policy: Some("Always".to_string()),
                ..Default::default()
            })
        });

        let pod_spec = PodSpec {
            containers: vec![self.build_container()],
            volumes: non_empty(&volumes),
            affinity: template.affinity.clone(),
            security_context: pod_security_context,
            node_selector: non_empty_map(&template.node_selector),
            tolerations: non_empty(&template.tolerations),
            image_pull_secrets: non_empty(
                &spec
                    .image_pull_secrets
                    .iter()
                    .map(|s| LocalObjectReference { name: s.clone() })
                    .collect::<Vec<_>>(),
            ),
            ..Default::default()
        };

        StatefulSet {
            metadata: self.metadata(statefulset_name(&self.name)),
            spec: Some(StatefulSetSpec {
                service_name: Some(headless_service_name(&self.name)),
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(self.cluster)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.pod_labels()),
                        annotations: Some(pod_annotations),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                volume_claim_templates: self.persistent().then(|| vec![self.claim_template()]),
                pod_management_policy: Some("Parallel".to_string()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateStatefulSetStrategy {
                        max_unavailable: Some(IntOrString::Int(1)),
                        partition: Some(0),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the broker container
    fn build_container(&self) -> Container {
        let spec = self.spec();
        let template = self.cluster.template();
        let headless = headless_service_name(&self.name);

        let mut env_vars = vec![
            EnvVar {
                name: "POD_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            env("EMQX_NAME", "emqx"),
            env(
                "EMQX_HOST",
                format!("$(POD_NAME).{}.{}.svc.cluster.local", headless, self.namespace),
            ),
            env("EMQX_CLUSTER__DISCOVERY", "dns"),
            env("EMQX_CLUSTER__DNS__TYPE", "srv"),
            env("EMQX_CLUSTER__DNS__APP", "emqx"),
            env(
                "EMQX_CLUSTER__DNS__NAME",
                format!("{}.{}.svc.cluster.local", headless, self.namespace),
            ),
            env(
                "EMQX_MANAGEMENT__LISTENER__HTTP",
                MANAGEMENT_PORT.to_string(),
            ),
        ];
        if self.cluster.license_secret().is_some() {
            env_vars.push(env(
                "EMQX_LICENSE__FILE",
                format!("{}/emqx.lic", LICENSE_DIR),
            ));
        }
        env_vars.extend(template.env.clone());

        let ports = LISTENER_PORTS
            .iter()
            .map(|(name, port)| ContainerPort {
                name: Some(name.to_string()),
                container_port: *port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        let mut volume_mounts = vec![VolumeMount {
            name: claim_template_name(&self.name),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        }];
        if !template.acl.is_empty() {
            volume_mounts.push(VolumeMount {
                name: "acl".to_string(),
                mount_path: ACL_PATH.to_string(),
                sub_path: Some("acl.conf".to_string()),
                ..Default::default()
            });
        }
        if self.cluster.license_secret().is_some() {
            volume_mounts.push(VolumeMount {
                name: "license".to_string(),
                mount_path: LICENSE_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let probe = |initial_delay: i32, failure_threshold: i32| Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/status".to_string()),
                port: IntOrString::Int(MANAGEMENT_PORT),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial_delay),
            period_seconds: Some(5),
            timeout_seconds: Some(3),
            failure_threshold: Some(failure_threshold),
            ..Default::default()
        };

        let container_security_context = template.container_security_context.clone().or_else(|| {
            Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                run_as_non_root: Some(true),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            })
        });

        Container {
            name: "emqx".to_string(),
            image: Some(self.cluster.image()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            env: Some(env_vars),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: configs_name(&self.name),
                    optional: Some(false),
                }),
                ..Default::default()
            }]),
            ports: Some(ports),
            resources: template.resources.clone(),
            readiness_probe: Some(probe(10, 12)),
            liveness_probe: Some(probe(60, 3)),
            volume_mounts: Some(volume_mounts),
            security_context: container_security_context,
            ..Default::default()
        }
    }

    /// Build the headless service members discover each other through
    pub fn build_headless_service(&self) -> Service {
        let port = |name: &str, port: i32| ServicePort {
            name: Some(name.to_string()),
            port,
            target_port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        };

        Service {
            metadata: self.metadata(headless_service_name(&self.name)),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(selector_labels(self.cluster)),
                ports: Some(vec![port("ekka", EKKA_PORT), port("management", MANAGEMENT_PORT)]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the client-facing service
    pub fn build_client_service(&self) -> Service {
        let service_template = &self.spec().service_template;
        let expose_node_ports = service_template.type_ != "ClusterIP";

        let ports = LISTENER_PORTS
            .iter()
            .map(|(name, port)| ServicePort {
                name: Some(name.to_string()),
                port: *port,
                target_port: Some(IntOrString::Int(*port)),
                protocol: Some("TCP".to_string()),
                node_port: service_template
                    .node_ports
                    .get(*name)
                    .copied()
                    .filter(|_| expose_node_ports),
                ..Default::default()
            })
            .collect();

        let mut metadata = self.metadata(statefulset_name(&self.name));
        let mut labels = service_template.labels.clone();
        labels.extend(common_labels(self.cluster));
        metadata.labels = Some(labels);
        metadata.annotations = non_empty_map(&service_template.annotations);

        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some(service_template.type_.clone()),
                selector: Some(selector_labels(self.cluster)),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Broker configuration as environment overrides, sorted by key
    pub fn rendered_config(&self) -> BTreeMap<String, String> {
        let template = self.cluster.template();
        let mut rendered: BTreeMap<String, String> = template
            .config
            .iter()
            .map(|(k, v)| (config_env_name(k), v.clone()))
            .collect();
        if !template.acl.is_empty() {
            rendered.insert("EMQX_ACL_FILE".to_string(), ACL_PATH.to_string());
        }
        rendered
    }

    /// Build the configuration ConfigMap
    pub fn build_configs(&self) -> ConfigMap {
        ConfigMap {
            metadata: self.metadata(configs_name(&self.name)),
            data: non_empty_map(&self.rendered_config()),
            ..Default::default()
        }
    }

    /// Build the ACL ConfigMap; absent when no rules are set
    pub fn build_acl(&self) -> Option<ConfigMap> {
        let acl = &self.cluster.template().acl;
        if acl.is_empty() {
            return None;
        }
        let mut rules = acl.join("\n");
        rules.push('\n');
        Some(ConfigMap {
            metadata: self.metadata(acl_name(&self.name)),
            data: Some(BTreeMap::from([("acl.conf".to_string(), rules)])),
            ..Default::default()
        })
    }
}
