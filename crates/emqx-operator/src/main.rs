//! EMQX Kubernetes Operator
//!
//! Watches `EmqxBroker`, `EmqxEnterprise` and `EmqxPlugin` resources and
//! keeps the broker clusters they describe running.

use anyhow::{Context, Result};
use clap::Parser;
use emqx_operator::config::OperatorConfig;
use emqx_operator::controller;
use emqx_operator::crd;
use kube::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// EMQX Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "emqx-operator")]
#[command(about = "Kubernetes operator for EMQX broker clusters")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Timeout for one Kubernetes API call, in seconds
    #[arg(long, env = "API_TIMEOUT_SECS", default_value = "10")]
    api_timeout_secs: u64,

    /// Timeout for one broker management API call, in seconds
    #[arg(long, env = "ADMIN_TIMEOUT_SECS", default_value = "5")]
    admin_timeout_secs: u64,

    /// Requeue interval for converged clusters, in seconds
    #[arg(long, env = "RESYNC_SECS", default_value = "300")]
    resync_secs: u64,

    /// First retry delay for failed plugin operations, in seconds
    #[arg(long, env = "PLUGIN_RETRY_BASE_SECS", default_value = "10")]
    plugin_retry_base_secs: u64,

    /// Cap on the plugin retry delay, in seconds
    #[arg(long, env = "PLUGIN_RETRY_MAX_SECS", default_value = "300")]
    plugin_retry_max_secs: u64,

    /// Unload attempts before a deleted plugin's finalizer is released
    #[arg(long, env = "MAX_UNLOAD_ATTEMPTS", default_value = "5")]
    max_unload_attempts: u32,

    /// Broker management API user
    #[arg(long, env = "EMQX_ADMIN_USERNAME", default_value = "admin")]
    admin_username: String,

    /// Broker management API password
    #[arg(long, env = "EMQX_ADMIN_PASSWORD", default_value = "public", hide_env_values = true)]
    admin_password: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            workers: self.workers.max(1),
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            admin_timeout: Duration::from_secs(self.admin_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            plugin_retry_base: Duration::from_secs(self.plugin_retry_base_secs),
            plugin_retry_max: Duration::from_secs(self.plugin_retry_max_secs),
            max_unload_attempts: self.max_unload_attempts.max(1),
            admin_username: self.admin_username.clone(),
            admin_password: self.admin_password.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", crd::crds_yaml()?);
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting EMQX Kubernetes Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            cancel.cancel();
        });
    }

    controller::run_controller(client, config, cancel)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}
