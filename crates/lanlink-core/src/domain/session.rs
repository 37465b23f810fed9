//! Session identifiers and the per-session handshake state.
//!
//! A *session* is one live transport endpoint: an accepted or dialled TCP
//! stream.  The transport layer hands every session a [`SessionId`] from a
//! shared [`SessionIdGenerator`] when the stream is created; the identifier is
//! never reused for the lifetime of the process, so a late close notification
//! for an old session can never be mistaken for a newer one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque, transport-assigned identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Thread-safe source of fresh [`SessionId`]s.
///
/// Identifiers start at 1 and increase by one per call.  The counter is an
/// `AtomicU64`, so the accept loop and every outbound connector can draw from
/// the same generator without a lock.
#[derive(Debug)]
pub struct SessionIdGenerator {
    inner: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns a session identifier that has not been handed out before.
    pub fn next(&self) -> SessionId {
        // `Relaxed` is enough: uniqueness comes from the atomic RMW itself and
        // no other memory is published through this counter.
        SessionId(self.inner.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Handshake progress of a single session.
///
/// ```text
/// AwaitingIdentity ──identity──► Identified
///        │                            │
///        └────── closed ──────► Closed ◄── closed / superseded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// The session is open but has not delivered a valid identity yet.
    AwaitingIdentity,
    /// A link exists for this session; packets are dispatched to it.
    Identified,
    /// Terminal: the session ended or its link was superseded.
    Closed,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
