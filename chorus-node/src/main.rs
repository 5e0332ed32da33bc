// Chorus node daemon: listen, dial configured peers, optionally fetch one file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chorus_node::{config, Config, Node, NodeEvent};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// How long a fetch waits for the remaining configured peers after the first one connects.
const FETCH_SETTLE: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Chorus peer node
#[derive(Parser, Debug)]
#[command(name = "chorus", version, about = "Peer-to-peer segmented file sharing node")]
struct Args {
    /// TCP listen port
    #[arg(long)]
    port: Option<u16>,

    /// Peer to dial at startup, host:service (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// File to fetch from connected peers once they are up
    #[arg(long)]
    fetch: Option<String>,

    /// Number of segments to ask serving peers for
    #[arg(long)]
    segments: Option<u32>,

    /// Cycle scheduler period in milliseconds
    #[arg(long)]
    cycle_ms: Option<u64>,

    /// Config file (default: ~/.config/chorus/config.toml, then /etc/chorus/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, cfg: &mut Config) {
        if let Some(port) = self.port {
            cfg.listen_port = port;
        }
        cfg.peers.extend(self.connect.iter().cloned());
        if let Some(n) = self.segments {
            cfg.default_segment_count = Some(n);
        }
        if let Some(ms) = self.cycle_ms {
            cfg.cycle_interval_ms = ms;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = match &args.config {
        Some(path) => {
            let mut c = config::load_file(path)?;
            c.apply_env(|k| std::env::var(k).ok());
            c
        }
        None => config::load()?,
    };
    args.apply(&mut cfg);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), port = cfg.listen_port, peers = cfg.peers.len(), "chorus starting");

    // One reactor thread drives every socket and timer.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    rt.block_on(run(cfg, args.fetch))
}

async fn run(cfg: Config, fetch: Option<String>) -> anyhow::Result<()> {
    let mut node = Node::start(&cfg).await?;
    let handle = node.handle();
    let mut events = node.take_events().context("event channel already taken")?;

    let mut expected = 0usize;
    for target in &cfg.peers {
        match handle.connect_to(target).await {
            Ok(peer_id) => {
                tracing::debug!(peer_id, target = %target, "dialling");
                expected += 1;
            }
            Err(e) => tracing::warn!(target = %target, error = ?e, "cannot dial peer"),
        }
    }

    let mut pending_fetch = fetch;
    let mut fetch_at: Option<tokio::time::Instant> = None;
    let mut connected = 0usize;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                tracing::info!("shutdown requested");
                break;
            }
            _ = wait_until(fetch_at) => {
                fetch_at = None;
                if let Some(name) = pending_fetch.take() {
                    if let Err(e) = handle.start_fetch(&name).await {
                        tracing::error!(name = %name, error = ?e, "fetch failed to start");
                    }
                }
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    NodeEvent::Connected { .. } => {
                        connected += 1;
                        if pending_fetch.is_some() {
                            let now = tokio::time::Instant::now();
                            if connected >= expected {
                                fetch_at = Some(now);
                            } else if fetch_at.is_none() {
                                fetch_at = Some(now + FETCH_SETTLE);
                            }
                        }
                    }
                    NodeEvent::Disconnected { .. } => {
                        connected = connected.saturating_sub(1);
                    }
                    NodeEvent::PeerDead { assigned_id, peer_id } => {
                        tracing::warn!(assigned_id, peer_id, "peer dropped from transfer");
                    }
                    NodeEvent::TransferFinished { name, bytes_written, missing } => {
                        if missing.is_empty() {
                            tracing::info!(name = %name, bytes_written, "fetch complete");
                        } else {
                            tracing::warn!(name = %name, bytes_written, missing = ?missing, "fetch finished with gaps");
                        }
                    }
                    NodeEvent::TransferStalled { name, bytes_written, write_cursor } => {
                        tracing::error!(name = %name, bytes_written, write_cursor, "fetch stalled, every peer is dead");
                    }
                }
            }
        }
    }

    node.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("waiting for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    }
    Ok(())
}
