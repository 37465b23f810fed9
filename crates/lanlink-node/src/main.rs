//! lanlink daemon entry point.
//!
//! Announces this device on the LAN, links with every other lanlink device
//! it hears, and logs link and packet activity.
//!
//! # Usage
//!
//! ```text
//! lanlink [OPTIONS]
//!
//! Options:
//!   --config <PATH>         Config file [default: platform config dir]
//!   --port <PORT>           Discovery and link port [default: 1714]
//!   --bind <IP>             Address to bind listeners to
//!   --broadcast <IP>        Announcement destination
//!   --device-name <NAME>    Name announced to peers
//!   --device-id <ID>        Stable device id [default: random per process]
//!   --log-level <LEVEL>     tracing level when RUST_LOG is unset
//! ```
//!
//! Every option can also be set through the `LANLINK_*` environment variable
//! shown in `--help`.  Precedence: CLI, environment, config file, defaults.
//!
//! On Unix, `SIGHUP` is treated as a network change and triggers a fresh
//! announcement.  Ctrl-C stops discovery and closes every link.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lanlink_core::{IdentityPacket, NetworkPacket};
use lanlink_node::infrastructure::storage::config::{self, NodeConfig};
use lanlink_node::{Link, LinkHandler, LinkProvider, PacketReceiver, StaticIdentitySource};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// LAN peer discovery and link daemon.
#[derive(Debug, Parser)]
#[command(name = "lanlink", about = "Discover and link with devices on the local network", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "LANLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Port shared by UDP discovery and TCP links.
    #[arg(long, env = "LANLINK_PORT")]
    port: Option<u16>,

    /// IP address to bind both listeners to.
    #[arg(long, env = "LANLINK_BIND")]
    bind: Option<String>,

    /// Destination IP for identity announcements, e.g. `192.168.1.255`.
    #[arg(long, env = "LANLINK_BROADCAST")]
    broadcast: Option<String>,

    /// Name announced to peers.
    #[arg(long, env = "LANLINK_DEVICE_NAME")]
    device_name: Option<String>,

    /// Stable device id.
    #[arg(long, env = "LANLINK_DEVICE_ID")]
    device_id: Option<String>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "LANLINK_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the config file and layers the CLI overrides on top.
    fn into_node_config(self) -> anyhow::Result<NodeConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load_config_from(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => config::load_config().context("loading config")?,
        };

        if let Some(port) = self.port {
            cfg.network.port = port;
        }
        if let Some(bind) = self.bind {
            cfg.network.bind_address = bind;
        }
        if let Some(broadcast) = self.broadcast {
            cfg.network.broadcast_address = broadcast;
        }
        if let Some(name) = self.device_name {
            cfg.device.name = name;
        }
        if let Some(id) = self.device_id {
            cfg.device.id = Some(id);
        }
        if let Some(level) = self.log_level {
            cfg.logging.level = level;
        }
        Ok(cfg)
    }
}

// ── Link logging ──────────────────────────────────────────────────────────────

struct LoggingHandler {
    packets: Arc<PacketLogger>,
}

impl LinkHandler for LoggingHandler {
    fn on_link_established(&self, identity: &IdentityPacket, link: Link) {
        info!(
            device_id = %identity.device_id,
            device_name = %identity.device_name,
            peer = %link.peer_addr(),
            "link established"
        );
        link.add_packet_receiver(self.packets.clone());
    }

    fn on_link_lost(&self, link: Link) {
        info!(device_id = %link.device_id(), peer = %link.peer_addr(), "link lost");
    }
}

struct PacketLogger;

impl PacketReceiver for PacketLogger {
    fn on_packet_received(&self, link: &Link, packet: &NetworkPacket) {
        info!(
            device_id = %link.device_id(),
            packet_type = packet.packet_type(),
            "packet received"
        );
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Cli::parse().into_node_config()?;

    // RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level)),
        )
        .init();

    let provider_config = cfg.to_provider_config().context("invalid network settings")?;
    let identity = cfg.local_identity();
    info!(
        device_id = %identity.device_id,
        device_name = %identity.device_name,
        port = cfg.network.port,
        "lanlink starting"
    );

    let provider = Arc::new(LinkProvider::new(
        provider_config,
        Arc::new(StaticIdentitySource::new(identity)),
        Arc::new(LoggingHandler {
            packets: Arc::new(PacketLogger),
        }),
    ));
    provider.start();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP received; treating as a network change");
                provider.on_network_changed();
            }
        });
    }

    info!("lanlink ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("shutdown signal received");
    provider.stop();
    provider.shutdown().await;
    info!("lanlink stopped");
    Ok(())
}
