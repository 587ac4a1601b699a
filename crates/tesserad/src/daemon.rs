//! Daemon lifecycle: open the share store, run the collector, serve metrics

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::config::TesseraConfig;
use tessera_core::PeerId;
use tessera_storage::{
    build_operator, Collector, LeaseStore, S3Credentials, ServerConfig, StorageNode, StorageServer,
    SystemClock,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::{HealthState, NodeMetrics};

/// How often the share/lease gauges are refreshed between sweeps.
const STATS_INTERVAL: Duration = Duration::from_secs(15);

pub async fn run(config: TesseraConfig) -> Result<()> {
    info!("daemon starting");

    let server = Arc::new(open_node(&config).await?);
    info!(
        peer = %server.peer_id().short(),
        shares = server.stats().shares,
        "storage node ready"
    );

    let mut registry = Registry::default();
    let metrics = NodeMetrics::register(&mut registry);
    metrics.observe_stats(&server.stats());

    let cancel = CancellationToken::new();

    // Lease collector
    let collector = Collector::for_server(&server, config.lease.grace_period_secs);
    let interval = Duration::from_secs(config.lease.sweep_interval_secs.max(1));
    let collector_task = {
        let cancel = cancel.clone();
        let server = Arc::clone(&server);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            collector
                .run(interval, Arc::new(SystemClock), cancel, move |report| {
                    metrics.observe_sweep(report);
                    metrics.observe_stats(&server.stats());
                })
                .await;
        })
    };

    // Gauges between sweeps
    let stats_task = {
        let cancel = cancel.clone();
        let server = Arc::clone(&server);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => metrics.observe_stats(&server.stats()),
                }
            }
        })
    };

    // Start Prometheus metrics endpoint
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            operator: server.operator().clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    // Send systemd ready notification
    notify_ready();

    shutdown_signal().await;
    info!("shutdown requested");
    cancel.cancel();
    if let Err(e) = collector_task.await {
        warn!("collector task ended abnormally: {e}");
    }
    if let Err(e) = stats_task.await {
        warn!("stats task ended abnormally: {e}");
    }

    server.leases().flush().context("flushing lease table on shutdown")?;
    info!("daemon stopped");
    Ok(())
}

/// Build the share store and lease table described by `[node]` and `[lease]`.
async fn open_node(config: &TesseraConfig) -> Result<StorageServer> {
    let creds = s3_credentials_from_env();
    let op = build_operator(&config.node, creds.as_ref())
        .with_context(|| format!("building {} backend", config.node.backend))?;

    match tessera_storage::check_health(&op).await {
        Ok(()) => info!(backend = %config.node.backend, "share store: connected"),
        // Keep going; /readyz reports it until the backend comes back.
        Err(e) => warn!(backend = %config.node.backend, "share store: {e}"),
    }

    let leases = match &config.lease.state_file {
        Some(path) => {
            if config.node.backend == "memory" {
                warn!("persistent lease table over a memory share store: leases will outlive their bytes");
            }
            let store = LeaseStore::open(path)?;
            info!(path = %path.display(), records = store.len(), "lease table loaded");
            store
        }
        None => {
            warn!("no [lease] state_file configured: lease table is in memory only");
            LeaseStore::in_memory()
        }
    };

    Ok(StorageServer::new(
        PeerId::from_name(&config.node.name),
        op,
        Arc::new(leases),
        ServerConfig::from(config),
    ))
}

/// S3 keys from `TESSERA_S3_ACCESS_KEY_ID` / `TESSERA_S3_SECRET_ACCESS_KEY`,
/// falling back to the AWS variable names.
fn s3_credentials_from_env() -> Option<S3Credentials> {
    let var = |primary: &str, fallback: &str| {
        std::env::var(primary)
            .or_else(|_| std::env::var(fallback))
            .ok()
            .filter(|v| !v.is_empty())
    };
    Some(S3Credentials {
        access_key_id: var("TESSERA_S3_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID")?,
        secret_access_key: var("TESSERA_S3_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY")?,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    #[cfg(unix)]
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
