//! TCP session plumbing shared by the acceptor and the connector.
//!
//! A session is split in two:
//!
//! - The write half lives in a [`TcpSessionSink`], which the coordinator wraps
//!   in a [`Link`](crate::application::link::Link) once the peer identifies
//!   itself.
//! - The read half is driven by the task that called
//!   [`SessionSpawner::run_session`].  It frames lines with [`LineFramer`] and
//!   forwards each one to the coordinator.
//!
//! Every session gets a child of the provider's root [`CancellationToken`].
//! Cancelling it (through [`SessionSink::close`] or a provider shutdown) ends
//! the reader, aborts any write in flight, produces exactly one `Closed`
//! event, and then shuts down the write half so the peer sees EOF.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lanlink_core::{FramerError, LineFramer, SessionId, SessionIdGenerator};
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::coordinator::{SessionEvent, SessionOrigin};
use crate::application::link::{LinkError, SessionSink};
use crate::infrastructure::network::TransportError;

/// Upper bound on sending FIN once the session has been reported closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Per-session socket and framing options.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Enable TCP keep-alive on every session.
    pub keepalive: bool,
    /// Longest accepted line; longer lines end the session.
    pub max_line_length: Option<usize>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            max_line_length: Some(1024 * 1024),
        }
    }
}

/// Write half of a TCP session.
pub struct TcpSessionSink {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LineFramer>>,
    cancel: CancellationToken,
}

impl TcpSessionSink {
    fn new(write_half: OwnedWriteHalf, cancel: CancellationToken) -> Self {
        Self {
            writer: Mutex::new(FramedWrite::new(write_half, LineFramer::new())),
            cancel,
        }
    }

    /// Sends FIN to the peer.  Errors are expected when the peer already left.
    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("write half shutdown: {e}");
        }
    }
}

#[async_trait]
impl SessionSink for TcpSessionSink {
    async fn send_line(&self, line: String) -> Result<(), FramerError> {
        // A peer that stops reading must not pin the writer past cancellation.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FramerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session is closed",
            ))),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.send(line).await
            } => result,
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Turns connected TCP streams into sessions that report to the coordinator.
#[derive(Clone)]
pub struct SessionSpawner {
    ids: Arc<SessionIdGenerator>,
    events: mpsc::Sender<SessionEvent>,
    shutdown: CancellationToken,
    options: SessionOptions,
}

impl SessionSpawner {
    pub fn new(
        events: mpsc::Sender<SessionEvent>,
        shutdown: CancellationToken,
        options: SessionOptions,
    ) -> Self {
        Self {
            ids: Arc::new(SessionIdGenerator::new()),
            events,
            shutdown,
            options,
        }
    }

    /// Applies socket options to a fresh stream.  Failures are logged only.
    pub fn configure(&self, stream: &TcpStream) {
        if self.options.keepalive {
            if let Err(e) = SockRef::from(stream).set_keepalive(true) {
                warn!("failed to enable TCP keep-alive: {e}");
            }
        }
    }

    /// Runs a session to completion.
    ///
    /// If `greeting` is given it is written before the session is reported,
    /// so it is always the first line the peer receives.  Then `Opened` is
    /// sent, every framed line follows as `PacketReceived`, and `Closed` is
    /// sent last.  `Closed` never waits on a blocked write.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Greeting`] if the greeting cannot be written;
    /// no events are produced in that case.
    pub async fn run_session(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        origin: SessionOrigin,
        greeting: Option<String>,
    ) -> Result<(), TransportError> {
        let session_id = self.ids.next();
        let cancel = self.shutdown.child_token();
        let (read_half, write_half) = stream.into_split();
        let sink = Arc::new(TcpSessionSink::new(write_half, cancel.clone()));

        if let Some(line) = greeting {
            if let Err(e) = sink.send_line(line).await {
                cancel.cancel();
                return Err(TransportError::Greeting {
                    addr: peer_addr,
                    source: LinkError::Transport(e),
                });
            }
        }

        let opened = SessionEvent::Opened {
            session_id,
            peer_addr,
            sink: Arc::clone(&sink) as Arc<dyn SessionSink>,
            origin,
        };
        if self.events.send(opened).await.is_err() {
            debug!(%session_id, "coordinator gone, dropping session");
            cancel.cancel();
            sink.shutdown().await;
            return Ok(());
        }
        debug!(%session_id, %peer_addr, "session opened");

        self.read_lines(session_id, read_half, &cancel).await;

        cancel.cancel();
        let _ = self.events.send(SessionEvent::Closed { session_id }).await;
        if tokio::time::timeout(SHUTDOWN_GRACE, sink.shutdown()).await.is_err() {
            debug!(%session_id, "write half shutdown timed out");
        }
        debug!(%session_id, %peer_addr, "session closed");
        Ok(())
    }

    async fn read_lines(
        &self,
        session_id: SessionId,
        read_half: OwnedReadHalf,
        cancel: &CancellationToken,
    ) {
        let framer = match self.options.max_line_length {
            Some(limit) => LineFramer::with_max_length(limit),
            None => LineFramer::new(),
        };
        let mut lines = FramedRead::new(read_half, framer);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%session_id, "session cancelled");
                    return;
                }
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) if line.is_empty() => continue,
                Some(Ok(line)) => {
                    let event = SessionEvent::PacketReceived { session_id, line };
                    if self.events.send(event).await.is_err() {
                        return;
                    }
                }
                Some(Err(FramerError::LineTooLong { limit })) => {
                    warn!(%session_id, limit, "line exceeds limit, ending session");
                    return;
                }
                Some(Err(e)) => {
                    debug!(%session_id, "read error: {e}");
                    return;
                }
                None => {
                    debug!(%session_id, "peer closed the stream");
                    return;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, peer) = accepted.unwrap();
        (client.unwrap(), server, peer)
    }

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    fn spawner(options: SessionOptions) -> (SessionSpawner, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            SessionSpawner::new(tx, CancellationToken::new(), options),
            rx,
        )
    }

    #[tokio::test]
    async fn test_session_reports_opened_lines_and_closed_in_order() {
        // Arrange
        let (mut client, server, peer) = connected_pair().await;
        let (spawner, mut rx) = spawner(SessionOptions::default());
        tokio::spawn(async move {
            spawner
                .run_session(server, peer, SessionOrigin::Inbound, None)
                .await
        });

        // Act: one write carrying two lines, an empty line, and a split line
        client.write_all(b"first\n\nsec").await.unwrap();
        client.write_all(b"ond\n").await.unwrap();
        client.shutdown().await.unwrap();

        // Assert
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Opened { .. }));
        match next_event(&mut rx).await {
            SessionEvent::PacketReceived { line, .. } => assert_eq!(&line[..], b"first"),
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut rx).await {
            SessionEvent::PacketReceived { line, .. } => assert_eq!(&line[..], b"second"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_greeting_is_the_first_line_the_peer_reads() {
        // Arrange
        let (client, server, peer) = connected_pair().await;
        let (spawner, mut rx) = spawner(SessionOptions::default());

        // Act
        tokio::spawn(async move {
            spawner
                .run_session(server, peer, SessionOrigin::Inbound, Some("hello".into()))
                .await
        });

        // Assert
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "hello\n");
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Opened { .. }));
    }

    #[tokio::test]
    async fn test_closing_the_sink_ends_the_session_and_the_peer_sees_eof() {
        // Arrange
        let (client, server, peer) = connected_pair().await;
        let (spawner, mut rx) = spawner(SessionOptions::default());
        tokio::spawn(async move {
            spawner
                .run_session(server, peer, SessionOrigin::Inbound, None)
                .await
        });
        let sink = match next_event(&mut rx).await {
            SessionEvent::Opened { sink, .. } => sink,
            other => panic!("unexpected {other:?}"),
        };

        // Act
        sink.close();

        // Assert
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Closed { .. }));
        assert!(sink.is_closed());
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "peer must see EOF");
        assert!(sink.send_line("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_half_close_during_a_blocked_write_still_reports_closed() {
        // Arrange: the peer never reads, so the flood below fills both buffers
        let (mut client, server, peer) = connected_pair().await;
        let (spawner, mut rx) = spawner(SessionOptions::default());
        tokio::spawn(async move {
            spawner
                .run_session(server, peer, SessionOrigin::Inbound, None)
                .await
        });
        let sink = match next_event(&mut rx).await {
            SessionEvent::Opened { sink, .. } => sink,
            other => panic!("unexpected {other:?}"),
        };
        let writer = Arc::clone(&sink);
        let flood = tokio::spawn(async move {
            let chunk = "x".repeat(1024 * 1024);
            while writer.send_line(chunk.clone()).await.is_ok() {}
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Act
        client.shutdown().await.unwrap();

        // Assert
        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("Closed must not wait on the blocked write")
            .expect("channel open");
        assert!(matches!(event, SessionEvent::Closed { .. }));
        assert!(sink.is_closed());
        tokio::time::timeout(Duration::from_secs(3), flood)
            .await
            .expect("blocked write is released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_overlong_line_ends_the_session() {
        // Arrange
        let (mut client, server, peer) = connected_pair().await;
        let (spawner, mut rx) = spawner(SessionOptions {
            keepalive: false,
            max_line_length: Some(8),
        });
        tokio::spawn(async move {
            spawner
                .run_session(server, peer, SessionOrigin::Inbound, None)
                .await
        });

        // Act
        client.write_all(b"0123456789abcdef").await.unwrap();

        // Assert
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Opened { .. }));
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_sink_writes_are_newline_terminated() {
        let (client, server, peer) = connected_pair().await;
        let (spawner, mut rx) = spawner(SessionOptions::default());
        tokio::spawn(async move {
            spawner
                .run_session(server, peer, SessionOrigin::Inbound, None)
                .await
        });
        let sink = match next_event(&mut rx).await {
            SessionEvent::Opened { sink, .. } => sink,
            other => panic!("unexpected {other:?}"),
        };

        sink.send_line("{\"type\":\"ping\"}".into()).await.unwrap();

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"type\":\"ping\"}\n");
    }

    #[tokio::test]
    async fn test_session_ids_are_unique_per_spawner() {
        let (spawner, _rx) = spawner(SessionOptions::default());
        let a = spawner.ids.next();
        let b = spawner.clone().ids.next();
        assert_ne!(a, b, "clones share one generator");
    }
}
