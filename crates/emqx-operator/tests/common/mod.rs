//! In-memory platform and broker members for driving whole passes

#![allow(dead_code)]

use async_trait::async_trait;
use emqx_operator::admin::{Member, MemberAdmin, NodeHealth};
use emqx_operator::cluster::{ClusterRef, EmqxCluster};
use emqx_operator::config::OperatorConfig;
use emqx_operator::context::Context;
use emqx_operator::crd::{
    ClusterSpec, EmqxBroker, EmqxBrokerSpec, EmqxClusterStatus, EmqxEnterprise, EmqxPlugin,
    EmqxPluginSpec, EmqxPluginStatus,
};
use emqx_operator::error::{OperatorError, Result};
use emqx_operator::events::EventPublisher;
use emqx_operator::platform::{ClusterSummary, MemberPod, ObservedObject, Platform};
use emqx_operator::resources::{statefulset_name, ChildKind, ChildResource};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const NS: &str = "mqtt";

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = json!({});
            }
            if let Value::Object(map) = target {
                for (k, v) in entries {
                    if v.is_null() {
                        map.remove(k);
                    } else {
                        merge_patch(map.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[derive(Debug, Clone)]
enum StoredCluster {
    Broker(EmqxBroker),
    Enterprise(EmqxEnterprise),
}

impl StoredCluster {
    fn as_cluster(&self) -> &dyn EmqxCluster {
        match self {
            StoredCluster::Broker(c) => c,
            StoredCluster::Enterprise(c) => c,
        }
    }

    fn as_cluster_mut(&mut self) -> &mut dyn EmqxCluster {
        match self {
            StoredCluster::Broker(c) => c,
            StoredCluster::Enterprise(c) => c,
        }
    }

    fn to_arc(&self) -> Arc<dyn EmqxCluster> {
        match self {
            StoredCluster::Broker(c) => Arc::new(c.clone()),
            StoredCluster::Enterprise(c) => Arc::new(c.clone()),
        }
    }
}

#[derive(Default)]
struct PlatformState {
    clusters: BTreeMap<ClusterRef, StoredCluster>,
    children: BTreeMap<(ChildKind, String, String), Value>,
    pods: BTreeMap<(String, String), MemberPod>,
    plugins: BTreeMap<(String, String), EmqxPlugin>,
    next_revision: u64,
    mutations: usize,
    status_writes: usize,
    conflicts_pending: usize,
    created: Vec<String>,
    cluster_reads: usize,
}

impl PlatformState {
    fn revision(&mut self) -> String {
        self.next_revision += 1;
        self.next_revision.to_string()
    }
}

/// In-memory [`Platform`] with optimistic concurrency on children
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_broker(&self, broker: EmqxBroker) -> ClusterRef {
        let key = broker.cluster_ref();
        self.state
            .lock()
            .clusters
            .insert(key.clone(), StoredCluster::Broker(broker));
        key
    }

    pub fn add_enterprise(&self, cluster: EmqxEnterprise) -> ClusterRef {
        let key = cluster.cluster_ref();
        self.state
            .lock()
            .clusters
            .insert(key.clone(), StoredCluster::Enterprise(cluster));
        key
    }

    pub fn remove_cluster(&self, key: &ClusterRef) {
        self.state.lock().clusters.remove(key);
    }

    /// Replace the spec, bumping the generation the way the API server does
    pub fn update_spec(&self, key: &ClusterRef, spec: ClusterSpec) {
        let mut state = self.state.lock();
        if let Some(stored) = state.clusters.get_mut(key) {
            let cluster = stored.as_cluster_mut();
            cluster.set_spec(spec);
            if let StoredCluster::Broker(b) = stored {
                b.metadata.generation = Some(b.metadata.generation.unwrap_or(0) + 1);
            }
        }
    }

    /// Mark a cluster for deletion while its finalizers hold it
    pub fn mark_cluster_deleting(&self, key: &ClusterRef) {
        let mut state = self.state.lock();
        let deleted = serde_json::from_value(json!("2026-10-19T00:00:00Z")).ok();
        match state.clusters.get_mut(key) {
            Some(StoredCluster::Broker(c)) => c.metadata.deletion_timestamp = deleted,
            Some(StoredCluster::Enterprise(c)) => c.metadata.deletion_timestamp = deleted,
            None => {}
        }
    }

    pub fn cluster_status(&self, key: &ClusterRef) -> Option<EmqxClusterStatus> {
        self.state
            .lock()
            .clusters
            .get(key)
            .and_then(|c| c.as_cluster().status().cloned())
    }

    pub fn child(&self, kind: ChildKind, name: &str) -> Option<Value> {
        self.state
            .lock()
            .children
            .get(&(kind, NS.to_string(), name.to_string()))
            .cloned()
    }

    pub fn children_of_kind(&self, kind: ChildKind) -> Vec<String> {
        self.state
            .lock()
            .children
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Edit a stored child behind the engine's back
    pub fn tamper_child(&self, kind: ChildKind, name: &str, patch: &Value) {
        let mut state = self.state.lock();
        let revision = state.revision();
        if let Some(body) = state
            .children
            .get_mut(&(kind, NS.to_string(), name.to_string()))
        {
            merge_patch(body, patch);
            body["metadata"]["resourceVersion"] = json!(revision);
        }
    }

    /// Rewrite a stored child in place, the way the API server normalizes
    /// fields on write
    pub fn edit_child(&self, kind: ChildKind, name: &str, edit: impl FnOnce(&mut Value)) {
        let mut state = self.state.lock();
        if let Some(body) = state
            .children
            .get_mut(&(kind, NS.to_string(), name.to_string()))
        {
            edit(body);
        }
    }

    /// Creates and patches applied to children so far
    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().status_writes
    }

    /// `Kind/name` of every created child, in creation order
    pub fn created(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Times a pass loaded a cluster
    pub fn cluster_reads(&self) -> usize {
        self.state.lock().cluster_reads
    }

    /// Fail the next `n` child patches with a conflict
    pub fn conflict_next_patches(&self, n: usize) {
        self.state.lock().conflicts_pending = n;
    }

    /// Materialize the pods of a cluster's StatefulSet, all Ready
    pub fn start_pods(&self, cluster_name: &str) {
        let mut state = self.state.lock();
        let sts_name = statefulset_name(cluster_name);
        let Some(sts) = state
            .children
            .get(&(ChildKind::StatefulSet, NS.to_string(), sts_name.clone()))
            .cloned()
        else {
            return;
        };
        let replicas = sts["spec"]["replicas"].as_i64().unwrap_or(0);
        let labels: BTreeMap<String, String> =
            serde_json::from_value(sts["spec"]["template"]["metadata"]["labels"].clone())
                .unwrap_or_default();

        let prefix = format!("{}-", sts_name);
        state
            .pods
            .retain(|(ns, name), _| ns != NS || !name.starts_with(&prefix));
        for ordinal in 0..replicas {
            let name = format!("{}{}", prefix, ordinal);
            state.pods.insert(
                (NS.to_string(), name.clone()),
                MemberPod {
                    name,
                    labels: labels.clone(),
                    ready: true,
                    crashing: false,
                },
            );
        }
    }

    pub fn set_pod_ready(&self, pod: &str, ready: bool) {
        if let Some(p) = self.state.lock().pods.get_mut(&(NS.to_string(), pod.to_string())) {
            p.ready = ready;
        }
    }

    pub fn set_pod_crashing(&self, pod: &str) {
        if let Some(p) = self.state.lock().pods.get_mut(&(NS.to_string(), pod.to_string())) {
            p.ready = false;
            p.crashing = true;
        }
    }

    pub fn set_pod_label(&self, pod: &str, key: &str, value: Option<&str>) {
        if let Some(p) = self.state.lock().pods.get_mut(&(NS.to_string(), pod.to_string())) {
            match value {
                Some(v) => {
                    p.labels.insert(key.to_string(), v.to_string());
                }
                None => {
                    p.labels.remove(key);
                }
            }
        }
    }

    pub fn remove_pod(&self, pod: &str) {
        self.state.lock().pods.remove(&(NS.to_string(), pod.to_string()));
    }

    pub fn add_plugin(&self, plugin: EmqxPlugin) {
        let key = (NS.to_string(), plugin.metadata.name.clone().unwrap_or_default());
        self.state.lock().plugins.insert(key, plugin);
    }

    pub fn plugin(&self, name: &str) -> Option<EmqxPlugin> {
        self.state
            .lock()
            .plugins
            .get(&(NS.to_string(), name.to_string()))
            .cloned()
    }

    pub fn plugin_status(&self, name: &str) -> EmqxPluginStatus {
        self.plugin(name)
            .and_then(|p| p.status)
            .unwrap_or_default()
    }

    /// Delete a plugin; finalizers turn this into marking it for deletion
    pub fn delete_plugin(&self, name: &str) {
        let mut state = self.state.lock();
        let key = (NS.to_string(), name.to_string());
        let Some(plugin) = state.plugins.get_mut(&key) else {
            return;
        };
        if plugin.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            plugin.metadata.deletion_timestamp =
                serde_json::from_value(json!("2026-10-19T00:00:00Z")).ok();
        } else {
            state.plugins.remove(&key);
        }
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn get_cluster(&self, key: &ClusterRef) -> Result<Option<Arc<dyn EmqxCluster>>> {
        let mut state = self.state.lock();
        state.cluster_reads += 1;
        Ok(state.clusters.get(key).map(|c| c.to_arc()))
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<ClusterSummary>> {
        Ok(self
            .state
            .lock()
            .clusters
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(key, c)| ClusterSummary {
                key: key.clone(),
                labels: c.as_cluster().labels(),
                deleting: c.as_cluster().is_deleting(),
            })
            .collect())
    }

    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ObservedObject>> {
        Ok(self
            .state
            .lock()
            .children
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .map(ObservedObject::from_value))
    }

    async fn create_child(&self, child: &ChildResource) -> Result<()> {
        let mut body = child.to_value()?;
        let mut state = self.state.lock();
        let key = (child.kind(), child.namespace().to_string(), child.name().to_string());
        if state.children.contains_key(&key) {
            return Err(OperatorError::ConflictError {
                kind: child.kind().to_string(),
                name: child.name().to_string(),
                message: "already exists".to_string(),
            });
        }
        body["metadata"]["resourceVersion"] = json!(state.revision());
        state.children.insert(key, body);
        state.created.push(format!("{}/{}", child.kind(), child.name()));
        state.mutations += 1;
        Ok(())
    }

    async fn patch_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        patch: &Value,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let conflict = || OperatorError::ConflictError {
            kind: kind.to_string(),
            name: name.to_string(),
            message: "the object has been modified".to_string(),
        };
        if state.conflicts_pending > 0 {
            state.conflicts_pending -= 1;
            return Err(conflict());
        }
        let revision = state.revision();
        let key = (kind, namespace.to_string(), name.to_string());
        let Some(body) = state.children.get_mut(&key) else {
            return Err(OperatorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        };
        let stored = body["metadata"]["resourceVersion"].as_str().map(str::to_string);
        if resource_version.is_some() && resource_version != stored {
            return Err(conflict());
        }
        let mut patch = patch.clone();
        if let Some(meta) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("resourceVersion");
        }
        merge_patch(body, &patch);
        body["metadata"]["resourceVersion"] = json!(revision);
        state.mutations += 1;
        Ok(())
    }

    async fn list_member_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<MemberPod>> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace
                    && selector
                        .iter()
                        .all(|(k, v)| pod.labels.get(k) == Some(v))
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn patch_cluster_status(&self, key: &ClusterRef, status: &EmqxClusterStatus) -> Result<()> {
        let mut state = self.state.lock();
        let Some(stored) = state.clusters.get_mut(key) else {
            return Err(OperatorError::NotFound {
                kind: key.kind.to_string(),
                name: key.name.clone(),
                namespace: key.namespace.clone(),
            });
        };
        stored.as_cluster_mut().set_status(status.clone());
        state.status_writes += 1;
        Ok(())
    }

    async fn list_plugins(&self, namespace: &str) -> Result<Vec<EmqxPlugin>> {
        Ok(self
            .state
            .lock()
            .plugins
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn add_plugin_finalizer(&self, plugin: &EmqxPlugin, finalizer: &str) -> Result<()> {
        let mut state = self.state.lock();
        let key = (NS.to_string(), plugin.metadata.name.clone().unwrap_or_default());
        if let Some(stored) = state.plugins.get_mut(&key) {
            let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        }
        Ok(())
    }

    async fn remove_plugin_finalizer(&self, plugin: &EmqxPlugin, finalizer: &str) -> Result<()> {
        let mut state = self.state.lock();
        let key = (NS.to_string(), plugin.metadata.name.clone().unwrap_or_default());
        let release = match state.plugins.get_mut(&key) {
            Some(stored) => {
                let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
                finalizers.retain(|f| f != finalizer);
                finalizers.is_empty() && stored.metadata.deletion_timestamp.is_some()
            }
            None => false,
        };
        if release {
            state.plugins.remove(&key);
        }
        Ok(())
    }

    async fn patch_plugin_status(&self, plugin: &EmqxPlugin, status: &EmqxPluginStatus) -> Result<()> {
        let mut state = self.state.lock();
        let name = plugin.metadata.name.clone().unwrap_or_default();
        match state.plugins.get_mut(&(NS.to_string(), name.clone())) {
            Some(stored) => {
                stored.status = Some(status.clone());
                Ok(())
            }
            None => Err(OperatorError::NotFound {
                kind: "EmqxPlugin".to_string(),
                name,
                namespace: NS.to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct AdminState {
    unreachable: BTreeSet<String>,
    rejecting: BTreeSet<String>,
    loaded: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
    load_calls: Vec<(String, String)>,
    unload_calls: Vec<(String, String)>,
    health_calls: u64,
}

/// Broker members answering the management API from memory, keyed by node
#[derive(Default)]
pub struct FakeAdmin {
    state: Mutex<AdminState>,
}

impl FakeAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(node.to_string());
        } else {
            state.unreachable.remove(node);
        }
    }

    pub fn set_rejecting(&self, node: &str, rejecting: bool) {
        let mut state = self.state.lock();
        if rejecting {
            state.rejecting.insert(node.to_string());
        } else {
            state.rejecting.remove(node);
        }
    }

    /// Plugins running on `node` with their configuration
    pub fn loaded_on(&self, node: &str) -> BTreeMap<String, BTreeMap<String, String>> {
        self.state.lock().loaded.get(node).cloned().unwrap_or_default()
    }

    pub fn load_calls(&self) -> Vec<(String, String)> {
        self.state.lock().load_calls.clone()
    }

    pub fn unload_calls(&self) -> Vec<(String, String)> {
        self.state.lock().unload_calls.clone()
    }

    fn check_reachable(state: &AdminState, member: &Member) -> Result<()> {
        if state.unreachable.contains(&member.node) {
            return Err(OperatorError::ConnectivityError {
                member: member.node.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MemberAdmin for FakeAdmin {
    async fn node_health(&self, member: &Member) -> Result<NodeHealth> {
        let mut state = self.state.lock();
        Self::check_reachable(&state, member)?;
        // brokers report uptime to the second, so every answer differs
        state.health_calls += 1;
        Ok(NodeHealth {
            node_status: "Running".to_string(),
            version: Some("4.4.19".to_string()),
            otp_release: Some("24.3.4.2/12.3.2.2".to_string()),
            uptime: Some(format!("5 minutes, {} seconds", state.health_calls)),
        })
    }

    async fn load_plugin(
        &self,
        member: &Member,
        plugin: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state
            .load_calls
            .push((member.node.clone(), plugin.to_string()));
        Self::check_reachable(&state, member)?;
        if state.rejecting.contains(&member.node) {
            return Err(OperatorError::AdminApiError {
                member: member.node.clone(),
                message: "invalid plugin configuration".to_string(),
            });
        }
        state
            .loaded
            .entry(member.node.clone())
            .or_default()
            .insert(plugin.to_string(), config.clone());
        Ok(())
    }

    async fn unload_plugin(&self, member: &Member, plugin: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .unload_calls
            .push((member.node.clone(), plugin.to_string()));
        Self::check_reachable(&state, member)?;
        if let Some(plugins) = state.loaded.get_mut(&member.node) {
            plugins.remove(plugin);
        }
        Ok(())
    }
}

/// Events captured as (warning, reason)
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(bool, String)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(warning, _)| *warning)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .push((matches!(type_, EventType::Warning), reason.to_string()));
    }
}

/// Everything one scenario needs
pub struct Harness {
    pub platform: Arc<FakePlatform>,
    pub admin: Arc<FakeAdmin>,
    pub events: Arc<RecordingEvents>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OperatorConfig::default())
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        let platform = Arc::new(FakePlatform::new());
        let admin = Arc::new(FakeAdmin::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = Arc::new(Context::new(
            platform.clone(),
            admin.clone(),
            events.clone(),
            config,
        ));
        Self {
            platform,
            admin,
            events,
            ctx,
        }
    }
}

/// A broker cluster labelled `cluster=<name>`
pub fn broker(name: &str, replicas: i32) -> EmqxBroker {
    EmqxBroker {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            uid: Some(format!("uid-{}", name)),
            generation: Some(1),
            labels: Some(BTreeMap::from([("cluster".to_string(), name.to_string())])),
            ..Default::default()
        },
        spec: EmqxBrokerSpec {
            cluster: ClusterSpec {
                replicas,
                ..Default::default()
            },
        },
        status: None,
    }
}

/// A plugin selecting `cluster=<cluster>`
pub fn plugin(name: &str, plugin_name: &str, cluster: &str) -> EmqxPlugin {
    let mut plugin = EmqxPlugin::new(
        name,
        EmqxPluginSpec {
            plugin_name: plugin_name.to_string(),
            selector: BTreeMap::from([("cluster".to_string(), cluster.to_string())]),
            config: BTreeMap::from([("lwm2m.lifetime_max".to_string(), "86400s".to_string())]),
        },
    );
    plugin.metadata.namespace = Some(NS.to_string());
    plugin.metadata.generation = Some(1);
    plugin
}

/// Node name of pod `<cluster>-<ordinal>`
pub fn node(cluster: &str, ordinal: usize) -> String {
    Member::for_pod(cluster, NS, &format!("{}-{}", cluster, ordinal)).node
}
