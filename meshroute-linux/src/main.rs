// meshroute Linux daemon: announces local backends and joins configured peers over TCP.

mod config;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use meshroute_core::{Node, NodeAddress, NodeIdentity, PeerRoutes};
use tracing_subscriber::{fmt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("meshroute-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => {
                anyhow::bail!("unknown argument {:?} (usage: meshroute-linux [--config PATH])", other)
            }
        }
    }

    let cfg = config::load(config_path.as_deref())?;
    init_logging(&cfg.log_level);
    if cfg.listen.is_empty() {
        anyhow::bail!("no listen addresses configured");
    }

    let mut identity = NodeIdentity::new(
        cfg.node_id(),
        cfg.group_id,
        cfg.listen.iter().copied().map(NodeAddress::from).collect(),
    );
    identity.indexes_shard_count = cfg.indexes_shard_count;

    let transport = Arc::new(transport::TcpTransport::new());
    let store = Arc::new(match cfg.max_backend_id {
        Some(max) => PeerRoutes::with_max_backend_id(max),
        None => PeerRoutes::new(),
    });
    let node = Arc::new(Node::new(identity, transport.clone(), store.clone()));
    for b in &cfg.backends {
        node.enable_backend(b.backend_id, b.group_id, &b.resolve_ids())
            .with_context(|| format!("enabling backend {}", b.backend_id))?;
        if !b.enabled {
            node.disable_backend(b.backend_id)?;
        }
    }
    tracing::info!(
        version = VERSION,
        id = %node.identity().id,
        group = cfg.group_id,
        addresses = cfg.listen.len(),
        backends = cfg.backends.len(),
        remotes = cfg.remotes.len(),
        "meshroute node starting"
    );

    let ctx = transport::Context::new(node, transport, cfg.max_payload);
    let retry = Duration::from_secs(cfg.reconnect_secs);
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        for addr in cfg.listen.iter().copied() {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = transport::serve(ctx, addr).await {
                    tracing::error!(%addr, error = %e, "listener failed");
                }
            });
        }
        for remote in cfg.remotes.iter().copied() {
            tokio::spawn(transport::maintain_remote(ctx.clone(), remote, retry));
        }
        tokio::spawn(report_status(ctx.clone(), store));
        shutdown_signal().await
    })?;
    tracing::info!("shutting down");
    Ok(())
}

/// RUST_LOG wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

async fn report_status(ctx: transport::Context, store: Arc<PeerRoutes>) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        ticker.tick().await;
        let active = ctx.node.snapshot().iter().filter(|b| b.activated).count();
        tracing::debug!(
            connections = ctx.transport.connection_count(),
            joined = ctx.node.joined_connections().len(),
            peers_with_routes = store.connections().len(),
            active_backends = active,
            "status"
        );
    }
}

/// Wait for Ctrl+C or SIGTERM. On shutdown the runtime drops every connection task.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
