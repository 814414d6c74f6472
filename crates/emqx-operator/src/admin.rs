//! Broker Member Admin Client
//!
//! Talks to the management API every EMQX member serves on port 8081: node
//! health for the status aggregator, plugin load/unload for the plugin
//! manager. Unreachable members surface as `ConnectivityError`; members that
//! answer and refuse surface as `AdminApiError`.

use crate::crd::MANAGEMENT_PORT;
use crate::error::{OperatorError, Result};
use crate::resources::{member_host, node_name};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Default bound on one management API request
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on establishing the TCP connection
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// One broker member as addressed by the management API
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Member {
    /// Pod backing the member
    pub pod_name: String,
    /// Erlang node name
    pub node: String,
    /// DNS name of the pod
    pub host: String,
}

impl Member {
    /// Address the member running in `pod_name` of a cluster
    pub fn for_pod(cluster_name: &str, namespace: &str, pod_name: &str) -> Self {
        Self {
            pod_name: pod_name.to_string(),
            node: node_name(cluster_name, namespace, pod_name),
            host: member_host(cluster_name, namespace, pod_name),
        }
    }
}

/// Health as reported by a member
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NodeHealth {
    #[serde(default)]
    pub node_status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub otp_release: Option<String>,
    #[serde(default)]
    pub uptime: Option<String>,
}

impl NodeHealth {
    /// The broker reports itself as running
    pub fn is_running(&self) -> bool {
        self.node_status == "Running"
    }
}

/// Management API of the broker members
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberAdmin: Send + Sync {
    /// Ask a member for its own health
    async fn node_health(&self, member: &Member) -> Result<NodeHealth>;

    /// Load `plugin` with `config` on a member
    async fn load_plugin(
        &self,
        member: &Member,
        plugin: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Unload `plugin` from a member; unloading a plugin that is not running
    /// succeeds
    async fn unload_plugin(&self, member: &Member, plugin: &str) -> Result<()>;
}

/// Configuration for the HTTP admin client
#[derive(Debug, Clone)]
pub struct AdminClientConfig {
    /// Bound on one request, connection included
    pub request_timeout: Duration,
    /// Bound on establishing the connection
    pub connect_timeout: Duration,
    /// Management API port
    pub port: i32,
    /// Basic auth user
    pub username: String,
    /// Basic auth password
    pub password: String,
}

impl Default for AdminClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            port: MANAGEMENT_PORT,
            username: "admin".to_string(),
            password: "public".to_string(),
        }
    }
}

/// Envelope every v4 management response is wrapped in
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

/// [`MemberAdmin`] over the v4 HTTP management API
pub struct HttpMemberAdmin {
    http: reqwest::Client,
    config: AdminClientConfig,
}

impl HttpMemberAdmin {
    pub fn new(config: AdminClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| OperatorError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn url(&self, member: &Member, path: &str) -> String {
        format!(
            "http://{}:{}/api/v4/nodes/{}{}",
            member.host, self.config.port, member.node, path
        )
    }

    /// Send a request and return status and body, mapping transport failures
    async fn send(&self, member: &Member, request: reqwest::RequestBuilder) -> Result<(u16, String)> {
        let response = request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| {
                let message = if e.is_timeout() {
                    format!("request timed out after {:?}", self.config.request_timeout)
                } else {
                    e.to_string()
                };
                OperatorError::ConnectivityError {
                    member: member.node.clone(),
                    message,
                }
            })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| OperatorError::ConnectivityError {
                member: member.node.clone(),
                message: format!("failed to read response: {}", e),
            })?;
        Ok((status, body))
    }
}

/// Classify a management API answer
///
/// 5xx means the member is not serving; 4xx and a non-zero `code` mean it
/// refused the request.
fn classify_response<T: for<'de> Deserialize<'de>>(
    member: &Member,
    status: u16,
    body: &str,
) -> Result<Option<T>> {
    if status >= 500 {
        return Err(OperatorError::ConnectivityError {
            member: member.node.clone(),
            message: format!("HTTP {}: {}", status, body.trim()),
        });
    }
    if status >= 400 {
        return Err(OperatorError::AdminApiError {
            member: member.node.clone(),
            message: format!("HTTP {}: {}", status, body.trim()),
        });
    }
    let response: ApiResponse<T> =
        serde_json::from_str(body).map_err(|e| OperatorError::AdminApiError {
            member: member.node.clone(),
            message: format!("unexpected response: {}", e),
        })?;
    if response.code != 0 {
        return Err(OperatorError::AdminApiError {
            member: member.node.clone(),
            message: response
                .message
                .unwrap_or_else(|| format!("error code {}", response.code)),
        });
    }
    Ok(response.data)
}

/// Whether an unload refusal only says the plugin was not running
fn is_not_started(err: &OperatorError) -> bool {
    match err {
        OperatorError::AdminApiError { message, .. } => {
            let message = message.to_lowercase();
            message.contains("not_started") || message.contains("not started")
        }
        _ => false,
    }
}

#[async_trait]
impl MemberAdmin for HttpMemberAdmin {
    async fn node_health(&self, member: &Member) -> Result<NodeHealth> {
        let request = self.http.get(self.url(member, ""));
        let (status, body) = self.send(member, request).await?;
        let health: Option<NodeHealth> = classify_response(member, status, &body)?;
        health.ok_or_else(|| OperatorError::AdminApiError {
            member: member.node.clone(),
            message: "node response carried no data".to_string(),
        })
    }

    async fn load_plugin(
        &self,
        member: &Member,
        plugin: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<()> {
        debug!(member = %member.node, plugin, "Loading plugin");
        let request = self
            .http
            .put(self.url(member, &format!("/plugins/{}/load", plugin)))
            .json(config);
        let (status, body) = self.send(member, request).await?;
        classify_response::<serde_json::Value>(member, status, &body)?;
        Ok(())
    }

    async fn unload_plugin(&self, member: &Member, plugin: &str) -> Result<()> {
        debug!(member = %member.node, plugin, "Unloading plugin");
        let request = self
            .http
            .put(self.url(member, &format!("/plugins/{}/unload", plugin)));
        let (status, body) = self.send(member, request).await?;
        match classify_response::<serde_json::Value>(member, status, &body) {
            Ok(_) => Ok(()),
            Err(e) if is_not_started(&e) => {
                warn!(member = %member.node, plugin, "Plugin was not running");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
