//! The established, device-bound connection handed to the owning system.
//!
//! A [`Link`] is a cheap, cloneable handle.  All clones share the same state,
//! so the owning system, the coordinator and any registered
//! [`PacketReceiver`] see the same `is_closed()` value.
//!
//! A link never owns a socket directly.  It writes through a [`SessionSink`],
//! which the TCP session in `infrastructure::network::session` implements and
//! which tests replace with a recording double.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lanlink_core::{FramerError, LinkKey, NetworkPacket, PacketError, SessionId};
use thiserror::Error;
use tracing::debug;

/// Errors returned by [`Link::send`].
#[derive(Debug, Error)]
pub enum LinkError {
    /// The session behind the link has ended.
    #[error("link to {device_id} is closed")]
    Closed { device_id: String },

    /// The packet could not be serialized.
    #[error("failed to encode packet: {0}")]
    Encode(#[from] PacketError),

    /// The write to the underlying session failed.
    #[error("transport error: {0}")]
    Transport(#[from] FramerError),
}

/// Write side of a live session.
#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Writes one packet text followed by the line delimiter.
    async fn send_line(&self, line: String) -> Result<(), FramerError>;

    /// Asks the transport to end the session.  Returns immediately; the
    /// transport reports the closure through its own close notification.
    fn close(&self);

    /// Returns `true` once the session has ended or a close was requested.
    fn is_closed(&self) -> bool;
}

/// Receives the packets delivered to a link after its handshake.
///
/// Called on the coordinator task, in the order the packets arrived on the
/// session.  Implementations must not block.
pub trait PacketReceiver: Send + Sync {
    fn on_packet_received(&self, link: &Link, packet: &NetworkPacket);
}

struct LinkInner {
    key: LinkKey,
    session_id: SessionId,
    device_id: String,
    peer_addr: SocketAddr,
    sink: Arc<dyn SessionSink>,
    receivers: Mutex<Vec<Arc<dyn PacketReceiver>>>,
    closed: AtomicBool,
}

/// A session that completed its identity handshake, bound to one device id.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    pub fn new(
        key: LinkKey,
        session_id: SessionId,
        device_id: impl Into<String>,
        peer_addr: SocketAddr,
        sink: Arc<dyn SessionSink>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                key,
                session_id,
                device_id: device_id.into(),
                peer_addr,
                sink,
                receivers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> LinkKey {
        self.inner.key
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    /// The peer's device id, fixed at construction.
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Sends one packet to the peer.
    ///
    /// A failed send does not close the link; only the transport's close
    /// notification does that.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Closed`] if the session has ended.
    /// - [`LinkError::Encode`] if the packet cannot be serialized.
    /// - [`LinkError::Transport`] if the write fails.
    pub async fn send(&self, packet: &NetworkPacket) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed {
                device_id: self.inner.device_id.clone(),
            });
        }
        let text = packet.serialize()?;
        self.inner.sink.send_line(text).await?;
        Ok(())
    }

    /// Requests the transport to end the session.
    pub fn close(&self) {
        self.mark_closed();
        self.inner.sink.close();
    }

    /// Returns `true` once the session has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.sink.is_closed()
    }

    /// Registers a receiver for packets arriving on this link.
    pub fn add_packet_receiver(&self, receiver: Arc<dyn PacketReceiver>) {
        self.receivers().push(receiver);
    }

    /// Hands `packet` to every registered receiver, in registration order.
    pub(crate) fn deliver(&self, packet: &NetworkPacket) {
        let receivers = self.receivers().clone();
        if receivers.is_empty() {
            debug!(
                device_id = %self.inner.device_id,
                packet_type = packet.packet_type(),
                "no receiver registered, packet dropped"
            );
        }
        for receiver in receivers {
            receiver.on_packet_received(self, packet);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn receivers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn PacketReceiver>>> {
        // A receiver that panicked must not take the link down with it.
        self.inner
            .receivers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Link {}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("key", &self.inner.key)
            .field("session_id", &self.inner.session_id)
            .field("device_id", &self.inner.device_id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
