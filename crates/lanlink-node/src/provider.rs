//! The LAN broadcast link provider.
//!
//! [`LinkProvider`] is the facade the owning system talks to.  It wires the
//! pieces together on first [`start`](LinkProvider::start):
//!
//! ```text
//!  DiscoveryListener ──dial──▶ Connector ─┐
//!                                          ├─▶ SessionSpawner ──events──▶ Coordinator ──▶ LinkHandler
//!  run_acceptor ───────────────────────────┘                                  │
//!                                                                              └──▶ UdpAnnouncer
//! ```
//!
//! `start`, `stop` and `on_network_changed` are synchronous and must be called
//! from within a Tokio runtime.  `stop` only silences discovery; established
//! links and the TCP acceptor stay up until [`shutdown`](LinkProvider::shutdown).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lanlink_core::protocol::DEFAULT_PORT;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::coordinator::{Coordinator, CoordinatorCommand, CoordinatorConfig};
use crate::application::handler::{AdvertisedIdentity, IdentitySource, LinkHandler};
use crate::application::link::Link;
use crate::infrastructure::network::acceptor::{bind_acceptor, run_acceptor};
use crate::infrastructure::network::announcer::UdpAnnouncer;
use crate::infrastructure::network::connector::Connector;
use crate::infrastructure::network::discovery::{bind_discovery_socket, DiscoveryListener};
use crate::infrastructure::network::session::{SessionOptions, SessionSpawner};
use crate::infrastructure::network::TransportError;

/// Name reported to the owning system.
pub const PROVIDER_NAME: &str = "LanBroadcastLinkProvider";
/// Preference among link providers; higher wins.
pub const PROVIDER_PRIORITY: i32 = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Runtime settings for a [`LinkProvider`].
///
/// | Field               | Default               |
/// |---------------------|-----------------------|
/// | `tcp_bind_addr`     | `0.0.0.0:1714`        |
/// | `udp_bind_addr`     | `0.0.0.0:1714`        |
/// | `broadcast_addr`    | `255.255.255.255:1714`|
/// | `default_peer_port` | `1714`                |
/// | `connect_timeout`   | 5 s                   |
/// | `handshake_timeout` | 10 s                  |
/// | `max_line_length`   | 1 MiB                 |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Where the link acceptor listens.  Port `0` picks an ephemeral port,
    /// which is then advertised as `tcpPort`.
    pub tcp_bind_addr: SocketAddr,
    /// Where the discovery listener listens.
    pub udp_bind_addr: SocketAddr,
    /// Destination of identity announcements.
    pub broadcast_addr: SocketAddr,
    /// Port dialled when a peer's announcement carries no `tcpPort`.
    pub default_peer_port: u16,
    pub reuse_address: bool,
    pub tcp_keepalive: bool,
    /// `None` waits for the OS connect timeout.
    pub connect_timeout: Option<Duration>,
    /// `None` lets an inbound session wait for its identity forever.
    pub handshake_timeout: Option<Duration>,
    /// `None` accepts lines of any length.
    pub max_line_length: Option<usize>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            tcp_bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            udp_bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            broadcast_addr: SocketAddr::from((Ipv4Addr::BROADCAST, DEFAULT_PORT)),
            default_peer_port: DEFAULT_PORT,
            reuse_address: true,
            tcp_keepalive: true,
            connect_timeout: Some(Duration::from_secs(5)),
            handshake_timeout: Some(Duration::from_secs(10)),
            max_line_length: Some(1024 * 1024),
        }
    }
}

impl ProviderConfig {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            keepalive: self.tcp_keepalive,
            max_line_length: self.max_line_length,
        }
    }

    /// Local address announcements are sent from.  Falls back to the
    /// unspecified address when the bind address belongs to the other family.
    fn announce_bind_ip(&self) -> IpAddr {
        let bind_ip = self.udp_bind_addr.ip();
        match (bind_ip, self.broadcast_addr) {
            (IpAddr::V4(_), SocketAddr::V4(_)) | (IpAddr::V6(_), SocketAddr::V6(_)) => bind_ip,
            (_, SocketAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (_, SocketAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Tasks and channels that live from the first `start` until `shutdown`.
struct Running {
    root: CancellationToken,
    commands: mpsc::Sender<CoordinatorCommand>,
    spawner: SessionSpawner,
    connector: Connector,
    coordinator: JoinHandle<()>,
}

struct ActiveDiscovery {
    addr: SocketAddr,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ProviderState {
    running: Option<Running>,
    acceptor_attempted: bool,
    tcp_addr: Option<SocketAddr>,
    discovery: Option<ActiveDiscovery>,
    shut_down: bool,
}

/// Discovers peers on the LAN and keeps at most one link per device.
pub struct LinkProvider {
    config: ProviderConfig,
    identity: Arc<AdvertisedIdentity>,
    handler: Arc<dyn LinkHandler>,
    state: Mutex<ProviderState>,
}

impl LinkProvider {
    pub fn new(
        config: ProviderConfig,
        identity: Arc<dyn IdentitySource>,
        handler: Arc<dyn LinkHandler>,
    ) -> Self {
        Self {
            config,
            identity: Arc::new(AdvertisedIdentity::new(identity)),
            handler,
            state: Mutex::new(ProviderState::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    pub fn priority(&self) -> i32 {
        PROVIDER_PRIORITY
    }

    /// Binds the listeners and announces the local identity.
    ///
    /// The TCP acceptor is bound on the first call only; the discovery socket
    /// is bound on every call that finds discovery stopped.  A bind failure
    /// disables that transport and is logged; the provider keeps running
    /// with whatever did bind.  Calling `start` after [`shutdown`] does nothing.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    ///
    /// [`shutdown`]: LinkProvider::shutdown
    pub fn start(&self) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.shut_down {
            warn!("start called after shutdown; ignoring");
            return;
        }

        let running = state.running.get_or_insert_with(|| self.spawn_running());

        if !state.acceptor_attempted {
            state.acceptor_attempted = true;
            match self.bind_link_acceptor() {
                Ok((addr, listener)) => {
                    self.identity.set_tcp_port(addr.port());
                    state.tcp_addr = Some(addr);
                    tokio::spawn(run_acceptor(
                        listener,
                        running.spawner.clone(),
                        running.root.child_token(),
                    ));
                }
                Err(e) => error!("link acceptor disabled: {e}"),
            }
        }

        if state.discovery.is_none() {
            match self.spawn_discovery(running) {
                Ok(discovery) => state.discovery = Some(discovery),
                Err(e) => error!("discovery disabled: {e}"),
            }
        }

        request_announce(&running.commands);
    }

    /// Closes the discovery socket.  Established links are left alone.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if let Some(discovery) = state.discovery.take() {
            discovery.cancel.cancel();
            info!(addr = %discovery.addr, "discovery stopped");
        }
    }

    /// Re-announces the local identity if discovery is active.
    pub fn on_network_changed(&self) {
        let state = self.lock_state();
        match (&state.running, &state.discovery) {
            (Some(running), Some(_)) => {
                debug!("network changed; re-announcing");
                request_announce(&running.commands);
            }
            _ => debug!("network changed while discovery is stopped; ignoring"),
        }
    }

    /// Address the link acceptor is bound to, if it bound.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.lock_state().tcp_addr
    }

    /// Address the discovery listener is bound to while discovery is active.
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.lock_state().discovery.as_ref().map(|d| d.addr)
    }

    /// Every established link, in no particular order.
    pub async fn links(&self) -> Vec<Link> {
        let commands = match &self.lock_state().running {
            Some(running) => running.commands.clone(),
            None => return Vec::new(),
        };
        let (reply, response) = oneshot::channel();
        if commands.send(CoordinatorCommand::Snapshot(reply)).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Stops discovery, closes the acceptor and every session, and waits for
    /// the coordinator to report each remaining link lost.
    pub async fn shutdown(&self) {
        let running = {
            let mut state = self.lock_state();
            state.shut_down = true;
            if let Some(discovery) = state.discovery.take() {
                discovery.cancel.cancel();
            }
            state.tcp_addr = None;
            state.running.take()
        };

        let Some(running) = running else {
            return;
        };
        running.root.cancel();
        if let Err(e) = running.coordinator.await {
            error!("coordinator task failed: {e}");
        }
        info!("link provider shut down");
    }

    fn spawn_running(&self) -> Running {
        let root = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let identity: Arc<dyn IdentitySource> = self.identity.clone();
        let announcer = Arc::new(UdpAnnouncer::new(
            self.config.announce_bind_ip(),
            self.config.broadcast_addr,
        ));
        let coordinator = Coordinator::new(
            Arc::clone(&self.handler),
            Arc::clone(&identity),
            announcer,
            CoordinatorConfig {
                handshake_timeout: self.config.handshake_timeout,
                ..CoordinatorConfig::default()
            },
            events_tx.clone(),
        );
        let coordinator = tokio::spawn(coordinator.run(events_rx, commands_rx, root.clone()));

        let spawner = SessionSpawner::new(events_tx, root.clone(), self.config.session_options());
        let connector = Connector::new(spawner.clone(), identity, self.config.connect_timeout);

        info!(name = PROVIDER_NAME, "link provider started");
        Running {
            root,
            commands: commands_tx,
            spawner,
            connector,
            coordinator,
        }
    }

    fn bind_link_acceptor(&self) -> Result<(SocketAddr, TcpListener), TransportError> {
        let addr = self.config.tcp_bind_addr;
        let listener = bind_acceptor(addr, self.config.reuse_address)?;
        let bound = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok((bound, listener))
    }

    fn spawn_discovery(&self, running: &Running) -> Result<ActiveDiscovery, TransportError> {
        let addr = self.config.udp_bind_addr;
        let socket = bind_discovery_socket(addr, self.config.reuse_address)?;
        let listener = DiscoveryListener::new(
            socket,
            self.identity.clone(),
            running.connector.clone(),
            self.config.default_peer_port,
            self.config.max_line_length,
        );
        let addr = listener.local_addr().unwrap_or(addr);
        let cancel = running.root.child_token();
        tokio::spawn(listener.run(cancel.clone()));
        Ok(ActiveDiscovery { addr, cancel })
    }

    fn lock_state(&self) -> MutexGuard<'_, ProviderState> {
        // Every critical section is panic-free, so a poisoned lock still holds
        // consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LinkProvider {
    fn drop(&mut self) {
        if let Some(running) = self.lock_state().running.as_ref() {
            running.root.cancel();
        }
    }
}

fn request_announce(commands: &mpsc::Sender<CoordinatorCommand>) {
    if let Err(e) = commands.try_send(CoordinatorCommand::Announce) {
        warn!("announce request dropped: {e}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
