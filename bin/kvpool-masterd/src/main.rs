//! kvpool Master Daemon
//!
//! This binary hosts the metadata master: the control-plane service,
//! its HTTP request surface, and the Prometheus metrics endpoint.

mod http;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use http::AppState;
use kvpool_common::MasterConfig;
use kvpool_master::MasterService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kvpool-masterd")]
#[command(about = "kvpool Metadata Master")]
#[command(version)]
struct Args {
    /// Listen port for the request surface
    #[arg(short, long, default_value = "50051")]
    port: u16,

    /// Maximum number of request handler threads
    #[arg(long, default_value = "4")]
    max_threads: usize,

    /// Enable read-then-delete garbage collection
    #[arg(long)]
    enable_gc: bool,

    /// Enable periodic metric reporting to the log
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    enable_metric_reporting: bool,

    /// Port for the HTTP metrics server
    #[arg(long, default_value = "9003")]
    metrics_port: u16,

    /// Lease granted on reads, in milliseconds
    #[arg(long, default_value = "5000")]
    default_kv_lease_ttl_ms: u64,

    /// Fraction of objects to evict per eviction pass
    #[arg(long, default_value = "0.05")]
    eviction_ratio: f64,

    /// Used-capacity ratio that triggers eviction
    #[arg(long, default_value = "0.95")]
    eviction_high_watermark_ratio: f64,

    /// Enable HA mode (client liveness monitoring and re-mounts)
    #[arg(long)]
    enable_ha: bool,

    /// Seconds without a ping before a client expires (HA)
    #[arg(long, default_value = "10")]
    client_live_ttl_sec: u64,

    /// Cluster membership view announced to clients (HA)
    #[arg(long, default_value = "0")]
    view_version: u64,

    /// Cluster identifier returned by GetFsdir
    #[arg(long, default_value = "")]
    cluster_id: String,

    /// URL the controller notifier posts cache events to; empty
    /// disables notifications
    #[arg(long, default_value = "")]
    controller_notification_url: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let hw_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = args.max_threads.clamp(1, hw_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    info!(
        port = args.port,
        max_threads = args.max_threads,
        enable_gc = args.enable_gc,
        enable_ha = args.enable_ha,
        metrics_port = args.metrics_port,
        controller_notification_url = %args.controller_notification_url,
        "starting kvpool master"
    );

    let config = MasterConfig {
        enable_gc: args.enable_gc,
        default_kv_lease_ttl_ms: args.default_kv_lease_ttl_ms,
        eviction_ratio: args.eviction_ratio,
        eviction_high_watermark_ratio: args.eviction_high_watermark_ratio,
        enable_ha: args.enable_ha,
        client_live_ttl_secs: args.client_live_ttl_sec,
        view_version: args.view_version,
        cluster_id: args.cluster_id.clone(),
    };
    let master = MasterService::new(config).context("failed to start master service")?;
    let state = Arc::new(AppState { master });

    if args.enable_metric_reporting {
        tokio::spawn(report_metrics(state.clone()));
    }

    let api = Router::new()
        .route("/api/v1/exist_key", post(http::exist_key))
        .route("/api/v1/batch_exist_key", post(http::batch_exist_key))
        .route("/api/v1/get_replica_list", post(http::get_replica_list))
        .route(
            "/api/v1/batch_get_replica_list",
            post(http::batch_get_replica_list),
        )
        .route("/api/v1/put_start", post(http::put_start))
        .route("/api/v1/batch_put_start", post(http::batch_put_start))
        .route("/api/v1/put_end", post(http::put_end))
        .route("/api/v1/batch_put_end", post(http::batch_put_end))
        .route("/api/v1/put_revoke", post(http::put_revoke))
        .route("/api/v1/batch_put_revoke", post(http::batch_put_revoke))
        .route("/api/v1/remove", post(http::remove))
        .route("/api/v1/remove_all", post(http::remove_all))
        .route("/api/v1/get_all_keys", get(http::get_all_keys))
        .route("/api/v1/mount_segment", post(http::mount_segment))
        .route("/api/v1/remount_segment", post(http::remount_segment))
        .route("/api/v1/unmount_segment", post(http::unmount_segment))
        .route("/api/v1/get_all_segments", get(http::get_all_segments))
        .route("/api/v1/query_segment", get(http::query_segment))
        .route("/api/v1/ping", post(http::ping))
        .route("/api/v1/get_fsdir", get(http::get_fsdir))
        .with_state(state.clone());

    let metrics = Router::new()
        .route("/metrics", get(http::metrics_handler))
        .route("/healthz", get(http::health_handler))
        .with_state(state);

    let api_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
    let api_listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind {api_addr}"))?;
    let metrics_listener = TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind {metrics_addr}"))?;

    info!(%api_addr, "request surface listening");
    info!(%metrics_addr, "metrics available at /metrics");

    let api_server = async {
        axum::serve(api_listener, api)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };
    let metrics_server = async {
        axum::serve(metrics_listener, metrics)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };
    tokio::try_join!(api_server, metrics_server)?;

    info!("kvpool master shut down gracefully");
    Ok(())
}

/// Log a usage summary on a fixed interval
async fn report_metrics(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        let metrics = state.master.metrics();
        info!(
            keys = metrics.key_count(),
            capacity_bytes = metrics.total_capacity(),
            used_ratio = format!("{:.3}", metrics.global_used_ratio()),
            active_clients = metrics.active_clients(),
            "master status"
        );
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
}
