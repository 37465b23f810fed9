//! TCP acceptor: the inbound side of link establishment.
//!
//! Every accepted stream becomes a session in `AwaitingIdentity`.  The
//! acceptor does not care whether the peer found us through our broadcast or
//! some other way; whatever identity the peer sends first decides the link.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::coordinator::SessionOrigin;
use crate::infrastructure::network::session::SessionSpawner;
use crate::infrastructure::network::TransportError;

/// Pause after a failed `accept()` so a persistent error (e.g. out of file
/// descriptors) does not spin the task.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Binds the link listener.
///
/// # Errors
///
/// Returns [`TransportError::Bind`] if the socket cannot be created, bound, or
/// put into listening mode.
pub fn bind_acceptor(addr: SocketAddr, reuse_address: bool) -> Result<TcpListener, TransportError> {
    let bind_err = |source| TransportError::Bind { addr, source };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    if reuse_address {
        socket.set_reuseaddr(true).map_err(bind_err)?;
    }
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(1024).map_err(bind_err)
}

/// Accepts connections until `cancel` fires, handing each one to its own task.
pub async fn run_acceptor(listener: TcpListener, spawner: SessionSpawner, cancel: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("link acceptor listening on TCP {addr}"),
        Err(e) => warn!("link acceptor listening on an unknown address: {e}"),
    }

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!(%peer_addr, "accepted TCP connection");
                spawner.configure(&stream);
                let spawner = spawner.clone();
                tokio::spawn(async move {
                    if let Err(e) = spawner
                        .run_session(stream, peer_addr, SessionOrigin::Inbound, None)
                        .await
                    {
                        warn!(%peer_addr, "inbound session failed: {e}");
                    }
                });
            }
            Err(e) => {
                error!("accept error: {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    info!("link acceptor stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
