//! AtlasDB Kubernetes Operator
//!
//! Runs the PostgresCluster controller, or renders a manifest offline with
//! `--dry-run`, or prints the CRD with `--print-crd`.

use anyhow::{Context, Result};
use atlasdb_operator::config::OperatorConfig;
use atlasdb_operator::crd::PostgresCluster;
use atlasdb_operator::health::{self, Readiness};
use atlasdb_operator::{controller, dry_run};
use clap::Parser;
use kube::{Client, CustomResourceExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(name = "atlasdb-operator")]
#[command(about = "Kubernetes operator for PostgreSQL clusters")]
#[command(version)]
struct Args {
    /// Prometheus exporter address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Address serving /healthz and /readyz
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch; cluster-wide when unset or empty
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// DNS suffix of in-cluster Service names
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "svc.cluster.local")]
    cluster_domain: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long, conflicts_with = "dry_run")]
    print_crd: bool,

    /// Render the objects for a PostgresCluster manifest without a cluster
    #[arg(long, value_name = "MANIFEST")]
    dry_run: Option<PathBuf>,
}

impl Args {
    fn watch_namespace(&self) -> Option<String> {
        self.namespace.clone().filter(|ns| !ns.trim().is_empty())
    }

    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig::default().with_cluster_domain(self.cluster_domain.as_str())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        let yaml = serde_yaml::to_string(&PostgresCluster::crd())?;
        println!("{}", yaml);
        return Ok(());
    }

    init_logging(args.log_level, args.log_json);
    let config = args.operator_config();

    match &args.dry_run {
        Some(manifest) => render(manifest, config).await,
        None => run(&args, config).await,
    }
}

fn init_logging(level: Level, json: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Print the objects a manifest converges to; logs go to stderr
async fn render(manifest: &Path, config: OperatorConfig) -> Result<()> {
    let source = std::fs::read_to_string(manifest)
        .with_context(|| format!("Failed to read {}", manifest.display()))?;
    let rendered = dry_run::render(&source, config)
        .await
        .with_context(|| format!("Failed to render {}", manifest.display()))?;
    print!("{}", rendered);
    Ok(())
}

async fn run(args: &Args, config: OperatorConfig) -> Result<()> {
    let namespace = args.watch_namespace();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = namespace.as_deref().unwrap_or("all"),
        cluster_domain = %config.cluster_domain,
        "Starting AtlasDB Kubernetes Operator"
    );

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(address = %args.metrics_addr, "Serving metrics");

    let readiness = Readiness::new();
    let health_addr = args.health_addr;
    let probes = readiness.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_addr, probes).await {
            error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    controller::run_controller(client, namespace, config, readiness)
        .await
        .context("Controller failed")
}
