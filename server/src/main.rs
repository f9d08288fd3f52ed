use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use catalog::{Catalog, CatalogMirrorMonitor};
use clap::{Parser, Subcommand};
use flow::FlowableActivity;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod api;
mod worker;

#[derive(Parser)]
#[command(name = "peerdb-flow")]
#[command(about = "Replication engine moving rows from Postgres to analytical peers")]
#[command(version)]
struct Cli {
    /// Orchestrator endpoint, kept for deployment parity.
    #[arg(long, env = "TEMPORAL_HOST_PORT", default_value = "localhost:7233", global = true)]
    temporal_host_port: String,

    /// Orchestrator namespace for workflow isolation.
    #[arg(long, env = "PEERDB_TEMPORAL_NAMESPACE", default_value = "default", global = true)]
    temporal_namespace: String,

    /// DSN of the operational catalog.
    #[arg(
        long,
        env = "PEERDB_CATALOG_DSN",
        default_value = "host=localhost port=5432 user=postgres password=postgres dbname=postgres",
        global = true
    )]
    catalog_dsn: String,

    /// Enable metrics collection for the application.
    #[arg(long, env = "ENABLE_METRICS", global = true)]
    enable_metrics: bool,

    /// HTTP server address for metrics collection.
    #[arg(long, env = "METRICS_SERVER", default_value = "localhost:6061", global = true)]
    metrics_server: String,

    /// Enable profiling for the application.
    #[arg(long, env = "ENABLE_PROFILING", global = true)]
    enable_profiling: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run CDC and QRep flows registered in the catalog.
    Worker,
    /// Run only snapshot (initial copy) flows.
    SnapshotWorker,
    /// Serve the control API with an embedded worker runtime.
    Api {
        /// Port the control API listens on.
        #[arg(short, long, default_value = "8110")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,peer_postgres=info,peer_snowflake=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.enable_metrics {
        let addr: SocketAddr = cli
            .metrics_server
            .parse()
            .context("invalid metrics server address")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install metrics exporter")?;
        tracing::info!("serving metrics on {}", addr);
    }
    if cli.enable_profiling {
        tracing::warn!("profiling requested but no profiler is wired into this build");
    }

    tracing::info!(
        namespace = %cli.temporal_namespace,
        endpoint = %cli.temporal_host_port,
        "starting peerdb-flow"
    );

    let catalog = Arc::new(
        Catalog::connect(&cli.catalog_dsn)
            .await
            .context("failed to connect to catalog")?,
    );
    let monitor = CatalogMirrorMonitor::from_shared(catalog.clone());
    let activities = Arc::new(FlowableActivity::new(monitor));

    match cli.command {
        Commands::Worker => worker::run(catalog, activities, worker::WorkerKind::All).await,
        Commands::SnapshotWorker => {
            worker::run(catalog, activities, worker::WorkerKind::SnapshotOnly).await
        }
        Commands::Api { port } => api::serve(catalog, activities, port).await,
    }
}
