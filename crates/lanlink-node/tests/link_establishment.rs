//! Loopback integration tests for discovery and link establishment.
//!
//! Every test binds to `127.0.0.1` with ephemeral ports, so tests run in
//! parallel without touching the real LAN.  "Raw" peers are plain
//! `TcpStream`s and `UdpSocket`s speaking the line protocol by hand.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lanlink_core::{IdentityPacket, NetworkPacket};
use lanlink_node::{
    Link, LinkHandler, LinkProvider, PacketReceiver, ProviderConfig, StaticIdentitySource,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(5);
/// How long we wait to be confident something did NOT happen.
const QUIET: Duration = Duration::from_millis(300);

// ── Helpers ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Observed {
    Established { device_id: String, link: Link },
    Lost { device_id: String, link: Link },
    Packet { device_id: String, packet_type: String },
}

/// Forwards every callback into a channel the test can await.
struct RecordingHandler {
    tx: mpsc::UnboundedSender<Observed>,
}

impl LinkHandler for RecordingHandler {
    fn on_link_established(&self, identity: &IdentityPacket, link: Link) {
        link.add_packet_receiver(Arc::new(RecordingReceiver {
            tx: self.tx.clone(),
        }));
        let _ = self.tx.send(Observed::Established {
            device_id: identity.device_id.clone(),
            link,
        });
    }

    fn on_link_lost(&self, link: Link) {
        let _ = self.tx.send(Observed::Lost {
            device_id: link.device_id().to_string(),
            link,
        });
    }
}

struct RecordingReceiver {
    tx: mpsc::UnboundedSender<Observed>,
}

impl PacketReceiver for RecordingReceiver {
    fn on_packet_received(&self, link: &Link, packet: &NetworkPacket) {
        let _ = self.tx.send(Observed::Packet {
            device_id: link.device_id().to_string(),
            packet_type: packet.packet_type().to_string(),
        });
    }
}

fn loopback_config(broadcast: SocketAddr) -> ProviderConfig {
    ProviderConfig {
        tcp_bind_addr: "127.0.0.1:0".parse().unwrap(),
        udp_bind_addr: "127.0.0.1:0".parse().unwrap(),
        broadcast_addr: broadcast,
        handshake_timeout: Some(Duration::from_secs(10)),
        ..ProviderConfig::default()
    }
}

/// Port 9 (discard) on loopback: announcements sent here reach nobody.
fn nowhere() -> SocketAddr {
    "127.0.0.1:9".parse().unwrap()
}

fn start_provider(
    device_id: &str,
    config: ProviderConfig,
) -> (LinkProvider, mpsc::UnboundedReceiver<Observed>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let provider = LinkProvider::new(
        config,
        Arc::new(StaticIdentitySource::new(IdentityPacket::new(
            device_id,
            format!("{device_id} device"),
        ))),
        Arc::new(RecordingHandler { tx }),
    );
    provider.start();
    (provider, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Observed>) -> Observed {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("handler channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Observed>) {
    if let Ok(Some(observed)) = tokio::time::timeout(QUIET, rx.recv()).await {
        panic!("unexpected callback {observed:?}");
    }
}

fn identity_line(device_id: &str) -> String {
    IdentityPacket::new(device_id, "raw peer")
        .to_packet()
        .to_line()
        .unwrap()
}

fn packet_line(packet_type: &str) -> String {
    NetworkPacket::new(packet_type).to_line().unwrap()
}

async fn raw_connect(provider: &LinkProvider) -> TcpStream {
    let addr = provider.local_tcp_addr().expect("acceptor bound");
    TcpStream::connect(addr).await.unwrap()
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
    let mut line = String::new();
    tokio::time::timeout(WAIT, reader.read_line(&mut line))
        .await
        .expect("timed out reading a line")
        .unwrap();
    line
}

async fn assert_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("timed out waiting for the session to close")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected the provider to close the session");
}

// ── Discovery ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_announcement_leads_to_one_link_on_each_side() {
    // Arrange: B listens; A announces straight at B's discovery socket.
    let (b, mut b_rx) = start_provider("B", loopback_config(nowhere()));
    let b_udp = b.local_udp_addr().expect("discovery bound");

    // Act
    let (a, mut a_rx) = start_provider("A", loopback_config(b_udp));

    // Assert: B dialled A and both sides hold exactly one link.
    match next(&mut b_rx).await {
        Observed::Established { device_id, link } => {
            assert_eq!(device_id, "A");
            assert_eq!(link.device_id(), "A");
        }
        other => panic!("B: unexpected {other:?}"),
    }
    match next(&mut a_rx).await {
        Observed::Established { device_id, .. } => assert_eq!(device_id, "B"),
        other => panic!("A: unexpected {other:?}"),
    }
    assert_quiet(&mut a_rx).await;
    assert_quiet(&mut b_rx).await;
    assert_eq!(a.links().await.len(), 1);
    assert_eq!(b.links().await.len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_packets_flow_both_ways_over_a_discovered_link() {
    // Arrange
    let (b, mut b_rx) = start_provider("B", loopback_config(nowhere()));
    let (a, mut a_rx) = start_provider("A", loopback_config(b.local_udp_addr().unwrap()));
    let Observed::Established { link: b_link, .. } = next(&mut b_rx).await else {
        panic!("B did not establish");
    };
    let Observed::Established { link: a_link, .. } = next(&mut a_rx).await else {
        panic!("A did not establish");
    };

    // Act
    assert_ok!(a_link.send(&NetworkPacket::new("ping")).await);
    assert_ok!(b_link.send(&NetworkPacket::new("pong")).await);

    // Assert
    match next(&mut b_rx).await {
        Observed::Packet {
            device_id,
            packet_type,
        } => {
            assert_eq!(device_id, "A");
            assert_eq!(packet_type, "ping");
        }
        other => panic!("B: unexpected {other:?}"),
    }
    match next(&mut a_rx).await {
        Observed::Packet {
            device_id,
            packet_type,
        } => {
            assert_eq!(device_id, "B");
            assert_eq!(packet_type, "pong");
        }
        other => panic!("A: unexpected {other:?}"),
    }

    a.shutdown().await;
    b.shutdown().await;
}

/// Drains callbacks until none arrive for [`QUIET`].
async fn settle(rx: &mut mpsc::UnboundedReceiver<Observed>) {
    while let Ok(Some(_)) = tokio::time::timeout(QUIET, rx.recv()).await {}
}

#[tokio::test]
async fn test_mutual_announcements_converge_on_one_shared_link() {
    // Arrange: reserve A's discovery port so B can announce to it
    let a_udp = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let (b, mut b_rx) = start_provider("B", loopback_config(a_udp));
    let b_udp = b.local_udp_addr().expect("discovery bound");
    let (a, mut a_rx) = start_provider(
        "A",
        ProviderConfig {
            udp_bind_addr: a_udp,
            ..loopback_config(b_udp)
        },
    );
    assert_eq!(a.local_udp_addr(), Some(a_udp));

    // Act: both sides announce at once, so each dials the other every round
    for round in 0..5 {
        a.on_network_changed();
        b.on_network_changed();
        tokio::time::sleep(Duration::from_millis(100)).await;
        settle(&mut a_rx).await;
        settle(&mut b_rx).await;

        // Assert
        assert_eq!(a.links().await.len(), 1, "A after round {round}");
        assert_eq!(b.links().await.len(), 1, "B after round {round}");
    }

    // ...and the link both kept is the same connection
    let a_link = a.links().await.remove(0);
    let b_link = b.links().await.remove(0);
    assert_ok!(a_link.send(&NetworkPacket::new("ping")).await);
    assert_ok!(b_link.send(&NetworkPacket::new("pong")).await);
    match next(&mut b_rx).await {
        Observed::Packet {
            device_id,
            packet_type,
        } => {
            assert_eq!(device_id, "A");
            assert_eq!(packet_type, "ping");
        }
        other => panic!("B: unexpected {other:?}"),
    }
    match next(&mut a_rx).await {
        Observed::Packet {
            device_id,
            packet_type,
        } => {
            assert_eq!(device_id, "B");
            assert_eq!(packet_type, "pong");
        }
        other => panic!("A: unexpected {other:?}"),
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_own_announcement_is_ignored_and_foreign_one_is_dialled() {
    // Arrange: a raw TCP listener stands in for the announcing peer.
    let (a, mut a_rx) = start_provider("A", loopback_config(nowhere()));
    let a_udp = a.local_udp_addr().unwrap();
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Act 1: an announcement carrying A's own device id
    let own = IdentityPacket::new("A", "echo").with_tcp_port(peer_port);
    sender
        .send_to(own.to_packet().to_line().unwrap().as_bytes(), a_udp)
        .await
        .unwrap();

    // Assert 1: nobody dials
    assert!(
        tokio::time::timeout(QUIET, peer.accept()).await.is_err(),
        "A must not dial its own announcement"
    );

    // Act 2: a foreign announcement
    let foreign = IdentityPacket::new("Z", "stranger").with_tcp_port(peer_port);
    sender
        .send_to(foreign.to_packet().to_line().unwrap().as_bytes(), a_udp)
        .await
        .unwrap();

    // Assert 2: A dials and greets with its identity, advertising its acceptor
    let (stream, _) = tokio::time::timeout(WAIT, peer.accept())
        .await
        .expect("A should dial the announcer")
        .unwrap();
    let (read, _write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let greeting = NetworkPacket::deserialize(read_line(&mut reader).await.trim_end()).unwrap();
    let greeting = IdentityPacket::try_from(&greeting).unwrap();
    assert_eq!(greeting.device_id, "A");
    assert_eq!(greeting.tcp_port, a.local_tcp_addr().map(|addr| addr.port()));

    match next(&mut a_rx).await {
        Observed::Established { device_id, .. } => assert_eq!(device_id, "Z"),
        other => panic!("unexpected {other:?}"),
    }

    a.shutdown().await;
}

#[tokio::test]
async fn test_malformed_datagram_is_dropped() {
    let (a, mut a_rx) = start_provider("A", loopback_config(nowhere()));
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sender
        .send_to(b"definitely not json\n", a.local_udp_addr().unwrap())
        .await
        .unwrap();

    assert_quiet(&mut a_rx).await;
    assert!(a.local_udp_addr().is_some(), "listener keeps running");
    a.shutdown().await;
}

// ── Inbound handshake ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_inbound_identity_establishes_link_and_dispatches_later_packets() {
    // Arrange
    let (a, mut a_rx) = start_provider("A", loopback_config(nowhere()));
    let mut stream = raw_connect(&a).await;

    // Act
    stream.write_all(identity_line("X").as_bytes()).await.unwrap();

    // Assert
    let link = match next(&mut a_rx).await {
        Observed::Established { device_id, link } => {
            assert_eq!(device_id, "X");
            link
        }
        other => panic!("unexpected {other:?}"),
    };

    stream.write_all(packet_line("ping").as_bytes()).await.unwrap();
    match next(&mut a_rx).await {
        Observed::Packet { packet_type, .. } => assert_eq!(packet_type, "ping"),
        other => panic!("unexpected {other:?}"),
    }

    // ...and the link writes back over the same stream
    assert_ok!(link.send(&NetworkPacket::new("pong")).await);
    let (read, _write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let reply = NetworkPacket::deserialize(read_line(&mut reader).await.trim_end()).unwrap();
    assert_eq!(reply.packet_type(), "pong");

    a.shutdown().await;
}

#[tokio::test]
async fn test_packet_before_identity_is_rejected_without_closing_the_session() {
    // Arrange
    let (a, mut a_rx) = start_provider("A", loopback_config(nowhere()));
    let mut stream = raw_connect(&a).await;

    // Act
    stream.write_all(packet_line("ping").as_bytes()).await.unwrap();
    stream.write_all(b"{broken json\n").await.unwrap();
    stream.write_all(identity_line("X").as_bytes()).await.unwrap();

    // Assert: the ping was never delivered, and the identity still counts.
    match next(&mut a_rx).await {
        Observed::Established { device_id, .. } => assert_eq!(device_id, "X"),
        other => panic!("unexpected {other:?}"),
    }
    assert_quiet(&mut a_rx).await;

    a.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_supersedes_existing_link() {
    // Arrange
    let (a, mut a_rx) = start_provider("A", loopback_config(nowhere()));
    let mut first = raw_connect(&a).await;
    first.write_all(identity_line("X").as_bytes()).await.unwrap();
    let Observed::Established { link: old, .. } = next(&mut a_rx).await else {
        panic!("first session did not establish");
    };

    // Act
    let mut second = raw_connect(&a).await;
    second.write_all(identity_line("X").as_bytes()).await.unwrap();

    // Assert: lost(old) strictly before established(new)
    match next(&mut a_rx).await {
        Observed::Lost { device_id, link } => {
            assert_eq!(device_id, "X");
            assert_eq!(link, old);
        }
        other => panic!("expected the old link to be lost first, got {other:?}"),
    }
    let new = match next(&mut a_rx).await {
        Observed::Established { link, .. } => link,
        other => panic!("unexpected {other:?}"),
    };
    assert_ne!(new, old);
    assert!(old.is_closed());
    assert_err!(old.send(&NetworkPacket::new("ping")).await);

    let links = a.links().await;
    assert_eq!(links, vec![new]);
    assert_eof(&mut first).await;

    // The old session closing later does not disturb the new link.
    drop(first);
    assert_quiet(&mut a_rx).await;
    assert_eq!(a.links().await.len(), 1);

    second.write_all(packet_line("ping").as_bytes()).await.unwrap();
    assert!(matches!(next(&mut a_rx).await, Observed::Packet { .. }));

    a.shutdown().await;
}

#[tokio::test]
async fn test_peer_disconnect_reports_link_lost() {
    let (a, mut a_rx) = start_provider("A", loopback_config(nowhere()));
    let mut stream = raw_connect(&a).await;
    stream.write_all(identity_line("X").as_bytes()).await.unwrap();
    assert!(matches!(next(&mut a_rx).await, Observed::Established { .. }));

    drop(stream);

    match next(&mut a_rx).await {
        Observed::Lost { device_id, link } => {
            assert_eq!(device_id, "X");
            assert!(link.is_closed());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(a.links().await.is_empty());
    a.shutdown().await;
}

#[tokio::test]
async fn test_silent_inbound_session_is_closed_at_the_handshake_deadline() {
    // Arrange
    let config = ProviderConfig {
        handshake_timeout: Some(Duration::from_millis(200)),
        ..loopback_config(nowhere())
    };
    let (a, mut a_rx) = start_provider("A", config);

    // Act
    let mut stream = raw_connect(&a).await;

    // Assert
    assert_eof(&mut stream).await;
    assert_quiet(&mut a_rx).await;
    a.shutdown().await;
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_keeps_established_links() {
    // Arrange
    let (a, mut a_rx) = start_provider("A", loopback_config(nowhere()));
    let mut stream = raw_connect(&a).await;
    stream.write_all(identity_line("X").as_bytes()).await.unwrap();
    assert!(matches!(next(&mut a_rx).await, Observed::Established { .. }));

    // Act
    a.stop();

    // Assert
    assert!(a.local_udp_addr().is_none());
    assert_eq!(a.links().await.len(), 1);
    stream.write_all(packet_line("ping").as_bytes()).await.unwrap();
    assert!(matches!(next(&mut a_rx).await, Observed::Packet { .. }));

    a.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_reports_every_link_lost_and_closes_sessions() {
    // Arrange
    let (a, mut a_rx) = start_provider("A", loopback_config(nowhere()));
    let mut x = raw_connect(&a).await;
    x.write_all(identity_line("X").as_bytes()).await.unwrap();
    let mut y = raw_connect(&a).await;
    y.write_all(identity_line("Y").as_bytes()).await.unwrap();
    assert!(matches!(next(&mut a_rx).await, Observed::Established { .. }));
    assert!(matches!(next(&mut a_rx).await, Observed::Established { .. }));

    // Act
    a.shutdown().await;

    // Assert
    let mut lost = Vec::new();
    for _ in 0..2 {
        match next(&mut a_rx).await {
            Observed::Lost { device_id, .. } => lost.push(device_id),
            other => panic!("unexpected {other:?}"),
        }
    }
    lost.sort();
    assert_eq!(lost, ["X", "Y"]);
    assert_eof(&mut x).await;
    assert_eof(&mut y).await;
}
