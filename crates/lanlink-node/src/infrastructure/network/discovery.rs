//! UDP discovery listener.
//!
//! Binds the well-known port (with address reuse, so several lanlink
//! processes on one host can all hear broadcasts) and waits for identity
//! datagrams.  For each one it:
//!
//! 1. Frames the datagram and decodes the first line as a packet.
//! 2. Reads it as an identity packet; anything else is logged and dropped.
//! 3. Drops our own announcements, recognised by the local device id.
//! 4. Spawns a [`Connector`] dial to the sender's IP at the advertised
//!    `tcpPort`, or the well-known port when none is advertised.
//!
//! # How discovery works (for beginners)
//!
//! A device sends its identity to the LAN broadcast address, so every host on
//! the segment receives it.  The hosts that are listening learn the sender's
//! IP from the datagram's source address and open a TCP connection back to
//! it.  TCP then gives the link ordering and retransmission for free; UDP is
//! only used to learn who is out there.

use std::net::SocketAddr;
use std::sync::Arc;

use lanlink_core::{
    FramerError, IdentityError, IdentityPacket, LineFramer, NetworkPacket, PacketError,
};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::handler::IdentitySource;
use crate::infrastructure::network::connector::Connector;
use crate::infrastructure::network::TransportError;

/// Largest datagram we read; anything longer is truncated by the OS.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Why a datagram did not yield a usable identity.
#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("datagram framing failed: {0}")]
    Framing(#[from] FramerError),
    #[error("datagram is empty")]
    Empty,
    #[error("datagram is not a valid packet: {0}")]
    Decode(#[from] PacketError),
    #[error("datagram is not an identity: {0}")]
    NotIdentity(#[from] IdentityError),
}

/// Decodes the identity carried by one discovery datagram.
///
/// A datagram is expected to hold exactly one packet; extra lines are ignored.
///
/// # Errors
///
/// Returns a [`DatagramError`] describing the first problem found.
pub fn identity_from_datagram(
    datagram: &[u8],
    max_line_length: Option<usize>,
) -> Result<IdentityPacket, DatagramError> {
    let mut framer = match max_line_length {
        Some(limit) => LineFramer::with_max_length(limit),
        None => LineFramer::new(),
    };
    let lines = framer.frame_datagram(datagram)?;
    let first = lines.first().ok_or(DatagramError::Empty)?;
    if lines.len() > 1 {
        debug!(extra = lines.len() - 1, "ignoring extra lines in datagram");
    }
    let packet = NetworkPacket::from_slice(first)?;
    Ok(IdentityPacket::try_from(&packet)?)
}

/// Binds the discovery socket.
///
/// # Errors
///
/// Returns [`TransportError::Bind`] if the socket cannot be created or bound.
pub fn bind_discovery_socket(
    addr: SocketAddr,
    reuse_address: bool,
) -> Result<UdpSocket, TransportError> {
    let bind_err = |source| TransportError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    if reuse_address {
        socket.set_reuse_address(true).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    UdpSocket::from_std(socket.into()).map_err(bind_err)
}

/// Receives identity broadcasts and dials their senders.
pub struct DiscoveryListener {
    socket: UdpSocket,
    identity: Arc<dyn IdentitySource>,
    connector: Connector,
    default_port: u16,
    max_line_length: Option<usize>,
}

impl DiscoveryListener {
    pub fn new(
        socket: UdpSocket,
        identity: Arc<dyn IdentitySource>,
        connector: Connector,
        default_port: u16,
        max_line_length: Option<usize>,
    ) -> Self {
        Self {
            socket,
            identity,
            connector,
            default_port,
            max_line_length,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until `cancel` fires.  The socket is closed on return.
    pub async fn run(self, cancel: CancellationToken) {
        match self.socket.local_addr() {
            Ok(addr) => info!("discovery listener on UDP {addr}"),
            Err(e) => warn!("discovery listener on an unknown address: {e}"),
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, src)) => self.handle_datagram(&buf[..len], src),
                // ICMP port-unreachable and friends surface here on some
                // platforms; none of them are fatal to the listener.
                Err(e) => debug!("discovery recv error: {e}"),
            }
        }

        info!("discovery listener stopped");
    }

    fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) {
        let identity = match identity_from_datagram(datagram, self.max_line_length) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(%src, "discarding discovery datagram: {e}");
                return;
            }
        };

        if identity.device_id == self.identity.identity().device_id {
            debug!(%src, "ignoring our own announcement");
            return;
        }

        let target = SocketAddr::new(src.ip(), identity.tcp_port.unwrap_or(self.default_port));
        info!(
            device_id = %identity.device_id,
            device_name = %identity.device_name,
            %target,
            "discovered peer"
        );
        let connector = self.connector.clone();
        tokio::spawn(async move { connector.dial(target, identity).await });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
