//! The coordinator: single owner of the link registry.
//!
//! Every transport task (TCP session readers, the UDP listener, outbound
//! connectors) only *produces* [`SessionEvent`]s.  One coordinator task
//! consumes them in order and is the only code that touches the
//! [`LinkRegistry`], so each lifecycle transition (create, evict-and-replace,
//! remove) is applied as a unit without locks.
//!
//! ```text
//!  acceptor ─┐
//!  connector ┼─► mpsc<SessionEvent> ─► Coordinator ─► LinkHandler callbacks
//!  readers  ─┘                           │
//!  provider ──► mpsc<CoordinatorCommand> ┘ └─► announce task (cancellable)
//! ```
//!
//! # Ordering
//!
//! A session's reader task sends `Opened` before any `PacketReceived` and
//! `Closed` last, all on the same channel, so the coordinator sees a session's
//! events in the order they happened.  Nothing is promised across sessions.
//!
//! # Simultaneous dials
//!
//! Two devices that hear each other's announcements dial each other, so a
//! pair briefly holds two connections.  When a second connection for a device
//! identifies within [`CoordinatorConfig::duplicate_window`] of the first, both
//! ends keep the connection dialed by the lower device id and close the other
//! without any callbacks.  A re-dial by the same device, or any connection
//! after the window, replaces the existing link.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lanlink_core::{
    classify_packet, resolve_duplicate, HandshakeAction, HandshakeState, IdentityPacket,
    LinkRegistry, NetworkPacket, ProtocolViolation, RegistryError, SessionId, Supersession,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::handler::{IdentitySource, LinkHandler};
use crate::application::link::{Link, SessionSink};

/// How a session came to exist.
#[derive(Debug, Clone)]
pub enum SessionOrigin {
    /// Accepted by the TCP acceptor; the peer must identify itself first.
    Inbound,
    /// Dialed after a UDP announcement.  The peer's identity is already known
    /// from the datagram, so the handshake completes as soon as the session
    /// opens.
    Outbound(IdentityPacket),
}

/// Structured notifications from transport tasks.
pub enum SessionEvent {
    Opened {
        session_id: SessionId,
        peer_addr: SocketAddr,
        sink: Arc<dyn SessionSink>,
        origin: SessionOrigin,
    },
    PacketReceived {
        session_id: SessionId,
        line: Bytes,
    },
    Closed {
        session_id: SessionId,
    },
    /// The session's handshake deadline passed.
    HandshakeExpired {
        session_id: SessionId,
    },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened {
                session_id,
                peer_addr,
                origin,
                ..
            } => f
                .debug_struct("Opened")
                .field("session_id", session_id)
                .field("peer_addr", peer_addr)
                .field("origin", origin)
                .finish(),
            Self::PacketReceived { session_id, line } => f
                .debug_struct("PacketReceived")
                .field("session_id", session_id)
                .field("len", &line.len())
                .finish(),
            Self::Closed { session_id } => {
                f.debug_struct("Closed").field("session_id", session_id).finish()
            }
            Self::HandshakeExpired { session_id } => f
                .debug_struct("HandshakeExpired")
                .field("session_id", session_id)
                .finish(),
        }
    }
}

/// Requests from the provider facade.
#[derive(Debug)]
pub enum CoordinatorCommand {
    /// Broadcast the local identity.  Aborts an announce still in flight.
    Announce,
    /// Reply with every current link.
    Snapshot(oneshot::Sender<Vec<Link>>),
}

/// Sends one discovery datagram.
#[async_trait]
pub trait Announce: Send + Sync {
    async fn broadcast(&self, datagram: Bytes) -> std::io::Result<()>;
}

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long an inbound session may stay silent before it is closed.
    /// `None` disables the deadline.
    pub handshake_timeout: Option<Duration>,
    /// A second connection for a device that identifies within this long of
    /// the first is treated as a simultaneous dial.
    pub duplicate_window: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            duplicate_window: Duration::from_secs(5),
        }
    }
}

/// Which end opened a session.
#[derive(Debug, Clone, Copy)]
enum Dialer {
    Local,
    Peer,
}

impl Dialer {
    fn device_id<'a>(self, local_id: &'a str, peer_id: &'a str) -> &'a str {
        match self {
            Self::Local => local_id,
            Self::Peer => peer_id,
        }
    }
}

struct PendingSession {
    peer_addr: SocketAddr,
    dialer: Dialer,
    sink: Arc<dyn SessionSink>,
    deadline: Option<JoinHandle<()>>,
}

impl PendingSession {
    fn disarm(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

/// How an established link came to be, for settling simultaneous dials.
struct LinkOrigin {
    dialer: Dialer,
    established_at: Instant,
}

/// Owns the registry and turns session events into link callbacks.
pub struct Coordinator {
    registry: LinkRegistry<Link>,
    pending: HashMap<SessionId, PendingSession>,
    origins: HashMap<SessionId, LinkOrigin>,
    handler: Arc<dyn LinkHandler>,
    identity: Arc<dyn IdentitySource>,
    announcer: Arc<dyn Announce>,
    config: CoordinatorConfig,
    /// Used by deadline timers to report back into the event stream.
    events: mpsc::Sender<SessionEvent>,
    announce_task: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(
        handler: Arc<dyn LinkHandler>,
        identity: Arc<dyn IdentitySource>,
        announcer: Arc<dyn Announce>,
        config: CoordinatorConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            registry: LinkRegistry::new(),
            pending: HashMap::new(),
            origins: HashMap::new(),
            handler,
            identity,
            announcer,
            config,
            events,
            announce_task: None,
        }
    }

    /// Processes events and commands until `shutdown` is cancelled or both
    /// channels close.  Every link still registered is reported lost on exit.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SessionEvent>,
        mut commands: mpsc::Receiver<CoordinatorCommand>,
        shutdown: CancellationToken,
    ) {
        info!("coordinator started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = events.recv() => self.handle_event(event),
                else => break,
            }
        }
        self.shutdown();
        info!("coordinator stopped");
    }

    pub(crate) fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Announce => self.announce(),
            CoordinatorCommand::Snapshot(reply) => {
                let links = self.registry.links().map(|(_, l)| l.clone()).collect();
                let _ = reply.send(links);
            }
        }
    }

    pub(crate) fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened {
                session_id,
                peer_addr,
                sink,
                origin,
            } => self.on_opened(session_id, peer_addr, sink, origin),
            SessionEvent::PacketReceived { session_id, line } => {
                self.on_packet(session_id, &line)
            }
            SessionEvent::Closed { session_id } => self.on_closed(session_id),
            SessionEvent::HandshakeExpired { session_id } => self.on_expired(session_id),
        }
    }

    fn on_opened(
        &mut self,
        session_id: SessionId,
        peer_addr: SocketAddr,
        sink: Arc<dyn SessionSink>,
        origin: SessionOrigin,
    ) {
        if let Err(e) = self.registry.register_handshaking(session_id) {
            warn!(%session_id, %peer_addr, "rejecting session: {e}");
            sink.close();
            return;
        }
        debug!(%session_id, %peer_addr, "session awaiting identity");

        let dialer = match origin {
            SessionOrigin::Outbound(_) => Dialer::Local,
            SessionOrigin::Inbound => Dialer::Peer,
        };
        let mut pending = PendingSession {
            peer_addr,
            dialer,
            sink,
            deadline: None,
        };
        match origin {
            SessionOrigin::Outbound(identity) => {
                self.pending.insert(session_id, pending);
                self.establish(session_id, identity);
            }
            SessionOrigin::Inbound => {
                pending.deadline = self.arm_deadline(session_id);
                self.pending.insert(session_id, pending);
            }
        }
    }

    fn on_packet(&mut self, session_id: SessionId, line: &[u8]) {
        let packet = match NetworkPacket::from_slice(line) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%session_id, "discarding undecodable packet: {e}");
                return;
            }
        };

        match classify_packet(self.registry.state(session_id), packet) {
            HandshakeAction::Establish(identity) => self.establish(session_id, identity),
            HandshakeAction::Dispatch(packet) => self.dispatch(session_id, &packet),
            HandshakeAction::Reject(violation) => {
                warn!(%session_id, "protocol violation: {violation}");
            }
        }
    }

    /// Forwards a post-handshake packet to the session's link.
    fn dispatch(&self, session_id: SessionId, packet: &NetworkPacket) {
        match self.registry.link_for_session(session_id) {
            Ok(link) => {
                debug!(
                    %session_id,
                    device_id = link.device_id(),
                    packet_type = packet.packet_type(),
                    "dispatching packet"
                );
                link.deliver(packet);
            }
            Err(e) => {
                let violation = match e {
                    RegistryError::SessionClosed(_) => ProtocolViolation::SessionClosed,
                    RegistryError::UnknownSession(_) => ProtocolViolation::UnknownSession,
                    _ => ProtocolViolation::NoLink,
                };
                warn!(%session_id, "protocol violation: {violation}");
            }
        }
    }

    fn establish(&mut self, session_id: SessionId, identity: IdentityPacket) {
        let Some(mut pending) = self.pending.remove(&session_id) else {
            warn!(%session_id, "identity for a session that is not pending");
            return;
        };
        pending.disarm();

        let device_id = identity.device_id.clone();
        let existing = self.registry.link_for_device(&device_id).map(Link::session_id);
        if let Some(existing) = existing {
            if self.resolve(existing, &device_id, pending.dialer) == Supersession::KeepExisting {
                info!(
                    %device_id,
                    kept_session = %existing,
                    dropped_session = %session_id,
                    "simultaneous connection, keeping existing link"
                );
                self.registry.remove_by_session(session_id);
                pending.sink.close();
                return;
            }
        }

        let peer_addr = pending.peer_addr;
        let dialer = pending.dialer;
        let sink = Arc::clone(&pending.sink);
        let result = self
            .registry
            .complete_handshake(session_id, &device_id, |key| {
                Link::new(key, session_id, device_id.clone(), peer_addr, sink)
            });

        let established = match result {
            Ok(established) => established,
            Err(e) => {
                warn!(%session_id, %device_id, "handshake rejected: {e}");
                pending.sink.close();
                return;
            }
        };

        if let Some(evicted) = established.evicted {
            info!(
                %device_id,
                old_session = %evicted.session_id,
                new_session = %session_id,
                "superseding existing link"
            );
            self.origins.remove(&evicted.session_id);
            evicted.link.mark_closed();
            self.handler.on_link_lost(evicted.link.clone());
            evicted.link.close();
        }
        self.origins.insert(
            session_id,
            LinkOrigin {
                dialer,
                established_at: Instant::now(),
            },
        );

        info!(
            %device_id,
            device_name = %identity.device_name,
            %session_id,
            %peer_addr,
            "link established"
        );
        self.handler.on_link_established(&identity, established.link);
    }

    /// Applies the simultaneous-dial rule to a new connection for a device
    /// whose link lives on `existing`.
    fn resolve(&self, existing: SessionId, peer_id: &str, candidate: Dialer) -> Supersession {
        let Some(origin) = self.origins.get(&existing) else {
            return Supersession::Replace;
        };
        let local_id = self.identity.identity().device_id;
        resolve_duplicate(
            origin.dialer.device_id(&local_id, peer_id),
            origin.established_at.elapsed(),
            candidate.device_id(&local_id, peer_id),
            self.config.duplicate_window,
        )
    }

    fn on_closed(&mut self, session_id: SessionId) {
        self.origins.remove(&session_id);
        if let Some(mut pending) = self.pending.remove(&session_id) {
            pending.disarm();
            debug!(%session_id, "session closed before identifying");
        }
        if let Some(link) = self.registry.remove_by_session(session_id) {
            info!(%session_id, device_id = link.device_id(), "link lost");
            link.mark_closed();
            self.handler.on_link_lost(link);
        }
    }

    fn on_expired(&mut self, session_id: SessionId) {
        if self.registry.state(session_id) != Some(HandshakeState::AwaitingIdentity) {
            return;
        }
        if let Some(pending) = self.pending.get_mut(&session_id) {
            warn!(
                %session_id,
                peer_addr = %pending.peer_addr,
                "no identity before the handshake deadline, closing session"
            );
            pending.deadline = None;
            pending.sink.close();
        }
    }

    fn arm_deadline(&self, session_id: SessionId) -> Option<JoinHandle<()>> {
        let timeout = self.config.handshake_timeout?;
        let events = self.events.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events
                .send(SessionEvent::HandshakeExpired { session_id })
                .await;
        }))
    }

    /// Spawns a broadcast of the local identity, aborting any previous one.
    fn announce(&mut self) {
        if let Some(previous) = self.announce_task.take() {
            previous.abort();
        }

        let identity = self.identity.identity();
        let line = match identity.to_packet().to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to encode identity for announce: {e}");
                return;
            }
        };
        let announcer = Arc::clone(&self.announcer);
        self.announce_task = Some(tokio::spawn(async move {
            match announcer.broadcast(Bytes::from(line)).await {
                Ok(()) => debug!(device_id = %identity.device_id, "identity announced"),
                Err(e) => warn!("announce failed: {e}"),
            }
        }));
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
        for (_, mut pending) in self.pending.drain() {
            pending.disarm();
            pending.sink.close();
        }
        self.origins.clear();
        let session_ids: Vec<SessionId> = self
            .registry
            .links()
            .map(|(_, link)| link.session_id())
            .collect();
        for session_id in session_ids {
            if let Some(link) = self.registry.remove_by_session(session_id) {
                link.close();
                self.handler.on_link_lost(link);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
