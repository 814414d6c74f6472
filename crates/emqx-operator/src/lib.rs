//! # EMQX Kubernetes Operator
//!
//! Reconciliation engine for EMQX broker clusters on Kubernetes. It keeps the
//! StatefulSet, Services, claims and configuration of every `EmqxBroker` and
//! `EmqxEnterprise` in line with their spec, reports member health back as
//! status, and loads `EmqxPlugin`s onto the members they select.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use emqx_operator::prelude::*;
//! use kube::Client;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, OperatorConfig::default(), CancellationToken::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Every pass handles one cluster and runs these stages in order:
//!
//! 1. **Build**: map the spec to child resources ([`resources`])
//! 2. **Sync**: create or merge-patch each child, never delete ([`sync`])
//! 3. **Observe**: combine pod readiness with each broker's own health
//!    report into the cluster status ([`status`])
//! 4. **Plugins**: drive the plugins bound to the cluster through their
//!    lifecycle ([`plugin`])
//! 5. **Persist**: write the status when it changed ([`controller`])
//!
//! Passes for one cluster never overlap; rapid triggers coalesce into a
//! single pending pass ([`queue`]). All platform and broker access goes
//! through the [`platform::Platform`] and [`admin::MemberAdmin`] traits on
//! an explicit [`context::Context`], so the engine runs unchanged against
//! in-memory implementations.
//!
//! ## Custom Resources
//!
//! ```yaml
//! apiVersion: apps.emqx.io/v1beta4
//! kind: EmqxBroker
//! metadata:
//!   name: emqx
//!   labels:
//!     cluster: emqx
//! spec:
//!   replicas: 3
//!   version: "4.4.19"
//!   storage:
//!     size: 1Gi
//!   template:
//!     config:
//!       log.level: warning
//! ---
//! apiVersion: apps.emqx.io/v1beta4
//! kind: EmqxPlugin
//! metadata:
//!   name: lwm2m
//! spec:
//!   pluginName: emqx_lwm2m
//!   selector:
//!     cluster: emqx
//!   config:
//!     lwm2m.lifetime_max: 86400s
//! ```
//!
//! ## Metrics
//!
//! - `emqx_operator_reconciliations_total` - Passes started
//! - `emqx_operator_reconciliation_errors_total` - Passes failed
//! - `emqx_operator_reconciliation_duration_seconds` - Pass latency
//! - `emqx_operator_plugin_operations_total` - Plugin loads and unloads per member

pub mod admin;
pub mod cluster;
pub mod config;
pub mod context;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod platform;
pub mod plugin;
pub mod queue;
pub mod resources;
pub mod status;
pub mod sync;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::admin::{AdminClientConfig, HttpMemberAdmin, Member, MemberAdmin, NodeHealth};
    pub use crate::cluster::{ClusterKind, ClusterRef, EmqxCluster};
    pub use crate::config::OperatorConfig;
    pub use crate::context::Context;
    pub use crate::controller::{reconcile, run_controller, run_engine, ControllerMetrics};
    pub use crate::crd::{
        ClusterCondition, ClusterSpec, EmqxBroker, EmqxBrokerSpec, EmqxClusterStatus,
        EmqxEnterprise, EmqxEnterpriseSpec, EmqxPlugin, EmqxPluginSpec, EmqxPluginStatus,
        EmqxTemplate, LicenseSpec, MemberFailure, NodeStatus, PluginPhase, ServiceTemplate,
        StorageSpec,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
    pub use crate::platform::{KubePlatform, Platform};
    pub use crate::plugin::PLUGIN_FINALIZER;
    pub use crate::queue::WorkQueue;
    pub use crate::resources::ResourceBuilder;
}
