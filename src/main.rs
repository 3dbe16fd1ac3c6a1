use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pgsniff::config::{ServerConfig, UpstreamTarget};
use pgsniff::server::{LogRelayFactory, Server, probe_upstream};
use tokio::net::TcpListener;
use tracing::{info, warn};

mod telemetry;

const UPSTREAM_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// PostgreSQL wire-protocol intermediary
#[derive(Parser, Debug)]
#[command(name = "pgsniff", version, about, long_about = None)]
struct Args {
    /// Address to accept client connections on
    #[arg(long, env = "PGSNIFF_LISTEN", default_value = "127.0.0.1:6543")]
    listen: SocketAddr,

    /// Upstream PostgreSQL server (URL or key=value connection string)
    #[arg(long, env = "PGSNIFF_UPSTREAM")]
    upstream: String,

    /// Seconds a client has to complete startup negotiation
    #[arg(long, env = "PGSNIFF_HANDSHAKE_TIMEOUT_SECS", default_value = "10")]
    handshake_timeout_secs: u64,

    /// Maximum number of concurrent client sessions
    #[arg(long, env = "PGSNIFF_MAX_CONNECTIONS", default_value = "1024")]
    max_connections: usize,

    /// Largest accepted frame payload in bytes, excluding the 5-byte tag and length header
    #[arg(long, env = "PGSNIFF_MAX_FRAME_SIZE", default_value = "16777216")]
    max_frame_size: usize,

    /// TCP keepalive idle time in seconds (0 disables)
    #[arg(long, env = "PGSNIFF_TCP_KEEPALIVE_SECS", default_value = "60")]
    tcp_keepalive_secs: u64,

    /// Send a FATAL ErrorResponse before closing a rejected connection
    #[arg(long, env = "PGSNIFF_REJECT_WITH_ERROR")]
    reject_with_error: bool,

    /// Start even if the upstream server is unreachable
    #[arg(long, env = "PGSNIFF_SKIP_UPSTREAM_CHECK")]
    skip_upstream_check: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            max_connections: self.max_connections.max(1),
            max_frame_size: self.max_frame_size,
            tcp_keepalive: (self.tcp_keepalive_secs > 0)
                .then_some(Duration::from_secs(self.tcp_keepalive_secs)),
            reject_with_error: self.reject_with_error,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(&args.log_level, args.json_logs)?;

    let upstream = UpstreamTarget::parse(&args.upstream).context("invalid --upstream")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %upstream,
        upstream_user = upstream.user.as_deref().unwrap_or("-"),
        "starting pgsniff"
    );

    if args.skip_upstream_check {
        warn!("upstream reachability check skipped");
    } else {
        probe_upstream(&upstream, UPSTREAM_PROBE_TIMEOUT)
            .await
            .with_context(|| format!("upstream {} is not reachable", upstream))?;
        info!(%upstream, "upstream reachable");
    }

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    let relays = LogRelayFactory::new(upstream, UPSTREAM_PROBE_TIMEOUT);
    Server::new(listener, args.server_config(), relays)
        .serve_with_shutdown(wait_for_shutdown_signal())
        .await;

    info!("pgsniff stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
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
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
