//! cogwheel-node: runs a scheduling engine until Ctrl-C.
//!
//! Payloads given with `--submit` are stored and scheduled at startup; with
//! `--local-peers N` the node shares an in-process mesh with N extra engines
//! so delegation can be observed without a network.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn};

use cogwheel_core::{Config, MemoryStore, PayloadStore, PeerId, Requirements};
use cogwheel_engine::{Engine, EngineEvent, EngineHandle};
use cogwheel_mesh::MemoryHub;

// ── CLI ─────────────────────────────────────────────────────────────

/// Priority task scheduler node with dependency graphs and peer delegation.
#[derive(Parser, Debug)]
#[command(name = "cogwheel-node", version, about)]
struct Cli {
    /// Path to cogwheel.toml. Without it, configuration comes from the
    /// environment only.
    #[arg(long, env = "COGWHEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Override `node.peer_id`.
    #[arg(long)]
    peer_id: Option<String>,

    /// Extra in-process engines joined to this node's mesh.
    #[arg(long, default_value_t = 0)]
    local_peers: usize,

    /// Text payload to schedule at startup. Repeatable.
    #[arg(long = "submit")]
    submit: Vec<String>,

    /// Make each submitted payload depend on the one before it.
    #[arg(long)]
    chain: bool,
}

async fn log_events(node: &EngineHandle, store: Arc<dyn PayloadStore>) -> anyhow::Result<()> {
    let mut events = node.subscribe(256).await?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                EngineEvent::TaskCompleted { task, result } => match store.get(result).await {
                    Ok(bytes) => info!(
                        task = %task,
                        result = %String::from_utf8_lossy(&bytes),
                        "task completed"
                    ),
                    Err(e) => warn!(task = %task, error = %e, "completed task result unreadable"),
                },
                EngineEvent::TaskFailed { task, error } => {
                    warn!(task = %task, %error, "task failed")
                }
                other => match serde_json::to_string(other) {
                    Ok(json) => info!(event = %json, "engine event"),
                    Err(e) => warn!(error = %e, "unserializable engine event"),
                },
            }
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(peer_id) = cli.peer_id {
        config.node.peer_id = peer_id;
    }
    config.log_summary();

    let store: Arc<dyn PayloadStore> = Arc::new(MemoryStore::new());
    let hub = MemoryHub::new();
    let local = PeerId::new(config.node.peer_id.clone());

    let node = Engine::builder(config.clone())
        .store(store.clone())
        .transport(hub.join(local.clone())?)
        .start()?;

    let mut peers = Vec::with_capacity(cli.local_peers);
    for i in 0..cli.local_peers {
        let peer = PeerId::new(format!("{local}-peer-{i}"));
        let mut peer_config = config.clone();
        peer_config.node.peer_id = peer.to_string();
        let handle = Engine::builder(peer_config)
            .store(store.clone())
            .transport(hub.join(peer)?)
            .start()?;
        peers.push(handle);
    }
    info!(peer = %local, local_peers = peers.len(), "node running, Ctrl-C to stop");

    log_events(&node, store.clone()).await?;

    let mut previous = None;
    for text in cli.submit {
        let payload = store.put(Bytes::from(text)).await?;
        let id = node
            .submit_task(payload, previous, Requirements::default())
            .await?;
        if cli.chain {
            previous = Some(id);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    let metrics = node.metrics().await?;
    info!(metrics = %serde_json::to_string(&metrics)?, "final metrics");

    for peer in &peers {
        peer.shutdown().await?;
    }
    node.shutdown().await?;
    Ok(())
}
