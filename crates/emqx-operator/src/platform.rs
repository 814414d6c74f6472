//! Platform access behind a capability trait
//!
//! Every Kubernetes call the reconcile engine makes goes through
//! [`Platform`], so passes can run against an in-memory platform in tests.
//! [`KubePlatform`] is the production implementation; each call is bounded
//! by the configured API timeout.

use crate::cluster::{ClusterKind, ClusterRef, EmqxCluster};
use crate::crd::{EmqxBroker, EmqxClusterStatus, EmqxEnterprise, EmqxPlugin, EmqxPluginStatus};
use crate::error::{OperatorError, Result};
use crate::resources::{ChildKind, ChildResource};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// A child resource as last observed on the platform
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedObject {
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub body: Value,
}

impl ObservedObject {
    pub fn from_value(body: Value) -> Self {
        let metadata = &body["metadata"];
        let resource_version = metadata["resourceVersion"].as_str().map(str::to_string);
        let labels = metadata["labels"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            resource_version,
            labels,
            body,
        }
    }
}

/// A cluster's identity and labels, used to bind plugins to clusters
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSummary {
    pub key: ClusterRef,
    pub labels: BTreeMap<String, String>,
    /// Marked for deletion; such a cluster binds no plugins
    pub deleting: bool,
}

/// Platform-side view of one member pod
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberPod {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Pod Ready condition is True
    pub ready: bool,
    /// Crash looping or failed
    pub crashing: bool,
}

impl MemberPod {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            });
        let crash_looping = status
            .and_then(|s| s.container_statuses.as_ref())
            .is_some_and(|statuses| {
                statuses.iter().any(|cs| {
                    cs.state
                        .as_ref()
                        .and_then(|st| st.waiting.as_ref())
                        .and_then(|w| w.reason.as_deref())
                        == Some("CrashLoopBackOff")
                })
            });
        let failed = status.and_then(|s| s.phase.as_deref()) == Some("Failed");

        Self {
            name: pod.name_any(),
            labels: pod.labels().clone(),
            ready,
            crashing: crash_looping || failed,
        }
    }
}

/// Label selector string (`k=v,k2=v2`) for a label map
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Kubernetes operations the reconcile engine relies on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Load a cluster; `None` once it is gone
    async fn get_cluster(&self, key: &ClusterRef) -> Result<Option<Arc<dyn EmqxCluster>>>;

    /// Every cluster of either kind in `namespace`
    async fn list_clusters(&self, namespace: &str) -> Result<Vec<ClusterSummary>>;

    /// Read a child resource
    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ObservedObject>>;

    /// Create a child resource
    async fn create_child(&self, child: &ChildResource) -> Result<()>;

    /// JSON-merge-patch a child resource, failing with a conflict when the
    /// stored revision no longer equals `resource_version`
    async fn patch_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        patch: &Value,
    ) -> Result<()>;

    /// Pods carrying every label in `selector`
    async fn list_member_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<MemberPod>>;

    /// Persist a cluster status
    async fn patch_cluster_status(&self, key: &ClusterRef, status: &EmqxClusterStatus)
        -> Result<()>;

    /// Every plugin in `namespace`
    async fn list_plugins(&self, namespace: &str) -> Result<Vec<EmqxPlugin>>;

    /// Add a finalizer to a plugin
    async fn add_plugin_finalizer(&self, plugin: &EmqxPlugin, finalizer: &str) -> Result<()>;

    /// Remove a finalizer from a plugin
    async fn remove_plugin_finalizer(&self, plugin: &EmqxPlugin, finalizer: &str) -> Result<()>;

    /// Persist a plugin status
    async fn patch_plugin_status(&self, plugin: &EmqxPlugin, status: &EmqxPluginStatus)
        -> Result<()>;
}

/// [`Platform`] backed by the Kubernetes API
pub struct KubePlatform {
    client: Client,
    timeout: Duration,
}

impl KubePlatform {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn child_api(&self, kind: ChildKind, namespace: &str) -> Api<DynamicObject> {
        let resource = match kind {
            ChildKind::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
            ChildKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
            ChildKind::Service => ApiResource::erase::<Service>(&()),
            ChildKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
        };
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }

    /// Run one API call under the timeout, classifying its error
    async fn call<T, F>(&self, kind: &str, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| OperatorError::from_kube(e, kind, name)),
            Err(_) => Err(OperatorError::ResourceError(format!(
                "{}/{}: request timed out after {:?}",
                kind, name, self.timeout
            ))),
        }
    }

    async fn patch_finalizers(&self, plugin: &EmqxPlugin, finalizers: Vec<String>) -> Result<()> {
        let name = plugin.name_any();
        let api: Api<EmqxPlugin> =
            Api::namespaced(self.client.clone(), &plugin.namespace().unwrap_or_default());
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": plugin.resource_version(),
            }
        });
        self.call(
            "EmqxPlugin",
            &name,
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn get_cluster(&self, key: &ClusterRef) -> Result<Option<Arc<dyn EmqxCluster>>> {
        let kind = key.kind.as_str();
        let cluster: Option<Arc<dyn EmqxCluster>> = match key.kind {
            ClusterKind::Broker => {
                let api: Api<EmqxBroker> = Api::namespaced(self.client.clone(), &key.namespace);
                self.call(kind, &key.name, api.get_opt(&key.name))
                    .await?
                    .map(|c| Arc::new(c) as Arc<dyn EmqxCluster>)
            }
            ClusterKind::Enterprise => {
                let api: Api<EmqxEnterprise> =
                    Api::namespaced(self.client.clone(), &key.namespace);
                self.call(kind, &key.name, api.get_opt(&key.name))
                    .await?
                    .map(|c| Arc::new(c) as Arc<dyn EmqxCluster>)
            }
        };
        Ok(cluster)
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<ClusterSummary>> {
        let brokers: Api<EmqxBroker> = Api::namespaced(self.client.clone(), namespace);
        let enterprises: Api<EmqxEnterprise> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default();

        let mut summaries: Vec<ClusterSummary> = self
            .call("EmqxBroker", namespace, brokers.list(&lp))
            .await?
            .items
            .iter()
            .map(|c| ClusterSummary {
                key: c.cluster_ref(),
                labels: EmqxCluster::labels(c),
                deleting: EmqxCluster::is_deleting(c),
            })
            .collect();
        summaries.extend(
            self.call("EmqxEnterprise", namespace, enterprises.list(&lp))
                .await?
                .items
                .iter()
                .map(|c| ClusterSummary {
                    key: c.cluster_ref(),
                    labels: EmqxCluster::labels(c),
                    deleting: EmqxCluster::is_deleting(c),
                }),
        );
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(summaries)
    }

    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ObservedObject>> {
        let api = self.child_api(kind, namespace);
        let object = self.call(kind.as_str(), name, api.get_opt(name)).await?;
        object
            .map(|o| Ok(ObservedObject::from_value(serde_json::to_value(o)?)))
            .transpose()
    }

    async fn create_child(&self, child: &ChildResource) -> Result<()> {
        let api = self.child_api(child.kind(), child.namespace());
        let object: DynamicObject = serde_json::from_value(child.to_value()?)?;
        debug!(kind = %child.kind(), name = child.name(), "Creating child resource");
        self.call(
            child.kind().as_str(),
            child.name(),
            api.create(&PostParams::default(), &object),
        )
        .await?;
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
        let api = self.child_api(kind, namespace);
        let mut patch = patch.clone();
        if let Some(rv) = resource_version {
            patch["metadata"]["resourceVersion"] = json!(rv);
        }
        self.call(
            kind.as_str(),
            name,
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }

    async fn list_member_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<MemberPod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&selector_string(selector));
        let pods = self.call("Pod", namespace, api.list(&lp)).await?;
        let mut members: Vec<MemberPod> = pods
            .items
            .iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .map(MemberPod::from_pod)
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(members)
    }

    async fn patch_cluster_status(
        &self,
        key: &ClusterRef,
        status: &EmqxClusterStatus,
    ) -> Result<()> {
        let patch = json!({ "status": status });
        let pp = PatchParams::default();
        match key.kind {
            ClusterKind::Broker => {
                let api: Api<EmqxBroker> = Api::namespaced(self.client.clone(), &key.namespace);
                self.call(
                    key.kind.as_str(),
                    &key.name,
                    api.patch_status(&key.name, &pp, &Patch::Merge(&patch)),
                )
                .await?;
            }
            ClusterKind::Enterprise => {
                let api: Api<EmqxEnterprise> =
                    Api::namespaced(self.client.clone(), &key.namespace);
                self.call(
                    key.kind.as_str(),
                    &key.name,
                    api.patch_status(&key.name, &pp, &Patch::Merge(&patch)),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn list_plugins(&self, namespace: &str) -> Result<Vec<EmqxPlugin>> {
        let api: Api<EmqxPlugin> = Api::namespaced(self.client.clone(), namespace);
        let mut plugins = self
            .call("EmqxPlugin", namespace, api.list(&ListParams::default()))
            .await?
            .items;
        plugins.sort_by_key(|p| p.name_any());
        Ok(plugins)
    }

    async fn add_plugin_finalizer(&self, plugin: &EmqxPlugin, finalizer: &str) -> Result<()> {
        let mut finalizers = plugin.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(plugin, finalizers).await
    }

    async fn remove_plugin_finalizer(&self, plugin: &EmqxPlugin, finalizer: &str) -> Result<()> {
        let finalizers: Vec<String> = plugin
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        if finalizers.len() == plugin.finalizers().len() {
            return Ok(());
        }
        self.patch_finalizers(plugin, finalizers).await
    }

    async fn patch_plugin_status(
        &self,
        plugin: &EmqxPlugin,
        status: &EmqxPluginStatus,
    ) -> Result<()> {
        let name = plugin.name_any();
        let api: Api<EmqxPlugin> =
            Api::namespaced(self.client.clone(), &plugin.namespace().unwrap_or_default());
        let patch = json!({ "status": status });
        self.call(
            "EmqxPlugin",
            &name,
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}
