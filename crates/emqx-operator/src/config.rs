//! Operator runtime configuration

use std::time::Duration;

/// Tunables shared by every reconcile pass
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch (None watches all namespaces)
    pub namespace: Option<String>,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Per-call bound on Kubernetes API requests
    pub api_timeout: Duration,
    /// Per-call bound on member management API requests
    pub admin_timeout: Duration,
    /// Maximum member requests in flight per pass
    pub member_concurrency: usize,
    /// Requeue delay after a converged pass
    pub resync_interval: Duration,
    /// Requeue delay while members are still coming up
    pub converge_interval: Duration,
    /// First delay after a ResourceError
    pub resource_backoff_base: Duration,
    /// Cap on the ResourceError backoff
    pub resource_backoff_max: Duration,
    /// First delay after a failed plugin load or unload
    pub plugin_retry_base: Duration,
    /// Cap on the plugin retry backoff
    pub plugin_retry_max: Duration,
    /// Unload attempts before the finalizer is released anyway
    pub max_unload_attempts: u32,
    /// Management API user
    pub admin_username: String,
    /// Management API password
    pub admin_password: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            api_timeout: Duration::from_secs(10),
            admin_timeout: Duration::from_secs(5),
            member_concurrency: 8,
            resync_interval: Duration::from_secs(300),
            converge_interval: Duration::from_secs(10),
            resource_backoff_base: Duration::from_secs(5),
            resource_backoff_max: Duration::from_secs(300),
            plugin_retry_base: Duration::from_secs(10),
            plugin_retry_max: Duration::from_secs(300),
            max_unload_attempts: 5,
            admin_username: "admin".to_string(),
            admin_password: "public".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Delay after the `attempt`-th ResourceError for one cluster
    pub fn resource_backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(
            self.resource_backoff_base,
            self.resource_backoff_max,
            attempt,
        )
    }

    /// Delay after the `attempt`-th failed plugin operation
    pub fn plugin_backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.plugin_retry_base, self.plugin_retry_max, attempt)
    }
}

/// `base * 2^(attempt-1)`, capped at `max`; attempt 0 is treated as 1
pub fn exponential_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}
