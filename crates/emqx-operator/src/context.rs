//! Explicit per-operator context threaded through every stage of a pass

use crate::admin::MemberAdmin;
use crate::cluster::ClusterRef;
use crate::config::OperatorConfig;
use crate::controller::ControllerMetrics;
use crate::error::{OperatorError, Result};
use crate::events::EventPublisher;
use crate::platform::Platform;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Capabilities and shared state for reconcile passes
pub struct Context {
    /// Kubernetes access
    pub platform: Arc<dyn Platform>,
    /// Broker member management API
    pub admin: Arc<dyn MemberAdmin>,
    /// Event recorder
    pub events: Arc<dyn EventPublisher>,
    /// Runtime tunables
    pub config: OperatorConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Consecutive ResourceErrors per cluster, for backoff
    pub error_counts: DashMap<ClusterRef, u32>,
    /// Shutdown signal observed at every suspension point
    pub cancel: CancellationToken,
    /// Wall-clock time paired with the runtime instant it was read at
    origin: (DateTime<Utc>, Instant),
}

impl Context {
    pub fn new(
        platform: Arc<dyn Platform>,
        admin: Arc<dyn MemberAdmin>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            platform,
            admin,
            events,
            config,
            metrics: None,
            error_counts: DashMap::new(),
            cancel: CancellationToken::new(),
            origin: (Utc::now(), Instant::now()),
        }
    }

    /// Current time, advancing with the runtime clock
    ///
    /// Retry windows stored in plugin status are measured against this, so
    /// a paused runtime clock freezes them too.
    pub fn now(&self) -> DateTime<Utc> {
        let (wall, at) = self.origin;
        chrono::Duration::from_std(at.elapsed())
            .map(|elapsed| wall + elapsed)
            .unwrap_or(wall)
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Await a platform or member call unless shutdown wins the race
    ///
    /// Returns `Cancelled` without polling `fut` when shutdown was already
    /// requested.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(OperatorError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OperatorError::Cancelled),
            result = fut => result,
        }
    }
}
