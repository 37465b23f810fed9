//! One-shot UDP broadcast of the local identity.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::application::coordinator::Announce;

/// Sends each announcement from a fresh ephemeral socket with
/// `SO_BROADCAST` set.  No acknowledgement and no retry.
#[derive(Debug, Clone)]
pub struct UdpAnnouncer {
    bind_ip: IpAddr,
    destination: SocketAddr,
}

impl UdpAnnouncer {
    /// `destination` is normally the LAN broadcast address at the well-known
    /// port.
    pub fn new(bind_ip: IpAddr, destination: SocketAddr) -> Self {
        Self {
            bind_ip,
            destination,
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

#[async_trait]
impl Announce for UdpAnnouncer {
    async fn broadcast(&self, datagram: Bytes) -> std::io::Result<()> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        socket.set_broadcast(true)?;
        let sent = socket.send_to(&datagram, self.destination).await?;
        debug!(destination = %self.destination, bytes = sent, "announcement sent");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
