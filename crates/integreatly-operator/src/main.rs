//! Integreatly Kubernetes Operator
//!
//! This operator manages Installation custom resources in Kubernetes,
//! installing and reconciling every product of the middleware platform.

use anyhow::{Context, Result};
use clap::Parser;
use integreatly_operator::config::OperatorConfig;
use integreatly_operator::controller;
use integreatly_operator::crd;
use integreatly_operator::providers::{ProviderConfig, DEFAULT_REGION};
use kube::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Integreatly Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "integreatly-operator")]
#[command(about = "Kubernetes operator installing the Integreatly middleware platform")]
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

    /// Log level (trace, debug, info, warn, error); `RUST_LOG` overrides it
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,

    /// Cloud provider for installation storage (aws, in-memory); none if unset
    #[arg(long, env = "CLOUD_PROVIDER")]
    cloud_provider: Option<String>,

    /// Region every cloud resource is provisioned in
    #[arg(long, env = "CLOUD_REGION", default_value = DEFAULT_REGION)]
    cloud_region: String,

    /// Ceiling in seconds for waiting on a database or cache to become available
    #[arg(long, env = "CLOUD_READY_TIMEOUT_SECS", default_value = "1200")]
    cloud_ready_timeout_secs: u64,

    /// Seconds between readiness polls of a database or cache
    #[arg(long, env = "CLOUD_POLL_INTERVAL_SECS", default_value = "15")]
    cloud_poll_interval_secs: u64,

    /// Requeue delay in seconds while an installation is in progress
    #[arg(long, env = "IN_PROGRESS_REQUEUE_SECS", default_value = "10")]
    in_progress_requeue_secs: u64,

    /// Requeue delay in seconds after an installation failed
    #[arg(long, env = "FAILED_REQUEUE_SECS", default_value = "60")]
    failed_requeue_secs: u64,

    /// OLM catalog source products are subscribed from
    #[arg(long, env = "CATALOG_SOURCE", default_value = "integreatly-operators")]
    catalog_source: String,

    /// Namespace of the OLM catalog source
    #[arg(long, env = "CATALOG_NAMESPACE", default_value = "openshift-marketplace")]
    catalog_namespace: String,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        let provider = self.cloud_provider.as_ref().map(|name| ProviderConfig {
            name: name.clone(),
            region: self.cloud_region.clone(),
            ready_timeout: Duration::from_secs(self.cloud_ready_timeout_secs),
            poll_interval: Duration::from_secs(self.cloud_poll_interval_secs),
        });

        OperatorConfig {
            // empty string means cluster-wide
            namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
            provider,
            in_progress_requeue: Duration::from_secs(self.in_progress_requeue_secs),
            failed_requeue: Duration::from_secs(self.failed_requeue_secs),
            catalog_source: self.catalog_source.clone(),
            catalog_namespace: self.catalog_namespace.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        cloud_provider = config
            .provider
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("none"),
        "Starting Integreatly Kubernetes Operator"
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

    controller::run_controller(client, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Filter directives for `level`, with the HTTP client stack kept quiet
fn log_directives(level: Level) -> String {
    format!(
        "{},hyper=warn,hyper_util=warn,tower=warn,rustls=warn",
        level.to_string().to_lowercase()
    )
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directives(args.log_level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
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

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = crd::Installation::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}
