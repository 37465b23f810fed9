//! Outbound side of link establishment.
//!
//! When the discovery listener hears a foreign identity it asks the
//! [`Connector`] to dial the sender.  On success the local identity is written
//! as the very first line, and the session is reported with the peer's
//! identity from the datagram so the coordinator can complete the handshake
//! immediately.  Failures are logged and dropped; the peer's next broadcast is
//! the retry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lanlink_core::IdentityPacket;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::application::coordinator::SessionOrigin;
use crate::application::handler::IdentitySource;
use crate::application::link::LinkError;
use crate::infrastructure::network::session::SessionSpawner;
use crate::infrastructure::network::TransportError;

/// Dials discovered peers.
#[derive(Clone)]
pub struct Connector {
    spawner: SessionSpawner,
    identity: Arc<dyn IdentitySource>,
    connect_timeout: Option<Duration>,
}

impl Connector {
    pub fn new(
        spawner: SessionSpawner,
        identity: Arc<dyn IdentitySource>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            spawner,
            identity,
            connect_timeout,
        }
    }

    /// Dials `addr` and runs the resulting session until it ends.
    pub async fn dial(&self, addr: SocketAddr, peer: IdentityPacket) {
        let device_id = peer.device_id.clone();
        if let Err(e) = self.try_dial(addr, peer).await {
            warn!(%addr, %device_id, "{e}");
        }
    }

    async fn try_dial(&self, addr: SocketAddr, peer: IdentityPacket) -> Result<(), TransportError> {
        debug!(%addr, device_id = %peer.device_id, "dialing discovered peer");
        let stream = self.connect(addr).await?;
        info!(%addr, device_id = %peer.device_id, "connected to discovered peer");
        self.spawner.configure(&stream);

        let greeting = self
            .identity
            .identity()
            .to_packet()
            .serialize()
            .map_err(|e| TransportError::Greeting {
                addr,
                source: LinkError::Encode(e),
            })?;

        self.spawner
            .run_session(stream, addr, SessionOrigin::Outbound(peer), Some(greeting))
            .await
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let connect = TcpStream::connect(addr);
        let result = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| TransportError::ConnectTimeout { addr, timeout })?,
            None => connect.await,
        };
        result.map_err(|source| TransportError::Connect { addr, source })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
