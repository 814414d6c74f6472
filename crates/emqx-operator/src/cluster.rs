//! Cluster variants behind one capability interface
//!
//! The reconcile engine handles `EmqxBroker` and `EmqxEnterprise` only
//! through [`EmqxCluster`]; nothing downstream matches on the concrete type.

use crate::crd::{
    ClusterSpec, EmqxBroker, EmqxClusterStatus, EmqxEnterprise, EmqxTemplate, API_GROUP,
    API_VERSION,
};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;
use std::fmt;

/// Which custom resource a cluster was declared with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterKind {
    Broker,
    Enterprise,
}

impl ClusterKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterKind::Broker => "EmqxBroker",
            ClusterKind::Enterprise => "EmqxEnterprise",
        }
    }

    /// Parse a Kubernetes kind name
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "EmqxBroker" => Some(ClusterKind::Broker),
            "EmqxEnterprise" => Some(ClusterKind::Enterprise),
            _ => None,
        }
    }

    /// Image repository used when the spec names no image
    pub fn default_repository(&self) -> &'static str {
        match self {
            ClusterKind::Broker => "emqx/emqx",
            ClusterKind::Enterprise => "emqx/emqx-ee",
        }
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one cluster; the work queue key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterRef {
    pub kind: ClusterKind,
    pub namespace: String,
    pub name: String,
}

impl ClusterRef {
    pub fn new(kind: ClusterKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Capability interface over every cluster variant
pub trait EmqxCluster: Send + Sync + fmt::Debug {
    fn kind(&self) -> ClusterKind;
    fn meta(&self) -> &ObjectMeta;
    fn spec(&self) -> &ClusterSpec;
    fn set_spec(&mut self, spec: ClusterSpec);
    fn status(&self) -> Option<&EmqxClusterStatus>;
    fn set_status(&mut self, status: EmqxClusterStatus);

    fn template(&self) -> &EmqxTemplate {
        &self.spec().template
    }

    /// Secret holding the enterprise license, if any
    fn license_secret(&self) -> Option<&str> {
        None
    }

    fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> String {
        self.meta()
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Labels set on the cluster object; plugins select clusters by these
    fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    fn cluster_ref(&self) -> ClusterRef {
        ClusterRef::new(self.kind(), self.namespace(), self.name())
    }

    /// Container image, derived from the version when not set explicitly
    fn image(&self) -> String {
        match self.spec().image.as_deref() {
            Some(image) if !image.is_empty() => image.to_string(),
            _ => format!(
                "{}:{}",
                self.kind().default_repository(),
                self.spec().version
            ),
        }
    }

    /// Controller owner reference placed on every child
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: format!("{}/{}", API_GROUP, API_VERSION),
            kind: self.kind().as_str().to_string(),
            name: self.name(),
            uid: self.meta().uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Reference used when recording events on the cluster
    fn object_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(format!("{}/{}", API_GROUP, API_VERSION)),
            kind: Some(self.kind().as_str().to_string()),
            name: self.meta().name.clone(),
            namespace: self.meta().namespace.clone(),
            uid: self.meta().uid.clone(),
            resource_version: self.meta().resource_version.clone(),
            ..Default::default()
        }
    }
}

impl EmqxCluster for EmqxBroker {
    fn kind(&self) -> ClusterKind {
        ClusterKind::Broker
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn spec(&self) -> &ClusterSpec {
        &self.spec.cluster
    }

    fn set_spec(&mut self, spec: ClusterSpec) {
        self.spec.cluster = spec;
    }

    fn status(&self) -> Option<&EmqxClusterStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: EmqxClusterStatus) {
        self.status = Some(status);
    }
}

impl EmqxCluster for EmqxEnterprise {
    fn kind(&self) -> ClusterKind {
        ClusterKind::Enterprise
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn spec(&self) -> &ClusterSpec {
        &self.spec.cluster
    }

    fn set_spec(&mut self, spec: ClusterSpec) {
        self.spec.cluster = spec;
    }

    fn status(&self) -> Option<&EmqxClusterStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: EmqxClusterStatus) {
        self.status = Some(status);
    }

    fn license_secret(&self) -> Option<&str> {
        self.spec.license.as_ref().map(|l| l.secret_name.as_str())
    }
}
