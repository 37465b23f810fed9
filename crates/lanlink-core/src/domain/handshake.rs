//! The per-session handshake rule: the first packet must be an identity.
//!
//! [`classify_packet`] is the whole state machine as a pure function.  Given
//! the session's current [`HandshakeState`] and a decoded packet it decides
//! what the caller should do; it never mutates anything itself.
//!
//! | State              | Identity packet        | Other packet          |
//! |--------------------|------------------------|-----------------------|
//! | `AwaitingIdentity` | `Establish`            | `Reject` (violation)  |
//! | `Identified`       | `Dispatch`             | `Dispatch`            |
//! | `Closed`           | `Reject`               | `Reject`              |
//! | unknown            | `Reject`               | `Reject`              |
//!
//! A rejected packet never changes the session's state: a peer that sends
//! garbage before its identity stays in `AwaitingIdentity` and may still
//! identify itself later.
//!
//! [`resolve_duplicate`] settles the other race a handshake can lose: two
//! devices that hear each other's announcements dial each other at the same
//! time, so each pair briefly has two connections.  Both ends apply the same
//! rule to the same dialer ids and therefore keep the same connection.

use std::time::Duration;

use thiserror::Error;

use crate::domain::session::HandshakeState;
use crate::protocol::identity::{IdentityError, IdentityPacket};
use crate::protocol::packet::NetworkPacket;

/// A packet that breaks the handshake rules.  Never fatal: the packet is
/// logged and dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("expected an identity packet first, got {packet_type:?}")]
    ExpectedIdentity { packet_type: String },
    #[error("invalid identity packet: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("packet for a session that is not registered")]
    UnknownSession,
    #[error("packet for a session that is closed")]
    SessionClosed,
    #[error("packet for a session without a link")]
    NoLink,
}

/// What to do with a packet received on a session.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeAction {
    /// Complete the handshake with this identity.
    Establish(IdentityPacket),
    /// Forward the packet to the session's link.
    Dispatch(NetworkPacket),
    /// Drop the packet.
    Reject(ProtocolViolation),
}

/// Decides how a session in `state` handles `packet`.
pub fn classify_packet(state: Option<HandshakeState>, packet: NetworkPacket) -> HandshakeAction {
    match state {
        None => HandshakeAction::Reject(ProtocolViolation::UnknownSession),
        Some(HandshakeState::Closed) => HandshakeAction::Reject(ProtocolViolation::SessionClosed),
        Some(HandshakeState::Identified) => HandshakeAction::Dispatch(packet),
        Some(HandshakeState::AwaitingIdentity) if packet.is_identity() => {
            match IdentityPacket::try_from(&packet) {
                Ok(identity) => HandshakeAction::Establish(identity),
                Err(e) => HandshakeAction::Reject(e.into()),
            }
        }
        Some(HandshakeState::AwaitingIdentity) => {
            HandshakeAction::Reject(ProtocolViolation::ExpectedIdentity {
                packet_type: packet.packet_type().to_string(),
            })
        }
    }
}

/// Outcome of a second handshake for a device that already has a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supersession {
    /// The new connection replaces the existing link.
    Replace,
    /// The new connection is dropped; the existing link stays.
    KeepExisting,
}

/// Decides whether a new connection supersedes the existing link of the same
/// device.  Each connection is named by the device id of the end that dialed
/// it, which both ends of a TCP connection agree on.
///
/// A link older than `window` is always replaced, as is a link the same
/// device dialed: the peer reconnected.  Inside the window, connections
/// dialed by different devices are a simultaneous dial and the one dialed by
/// the lower device id wins, so both peers converge on one connection.
pub fn resolve_duplicate(
    existing_dialer: &str,
    existing_age: Duration,
    candidate_dialer: &str,
    window: Duration,
) -> Supersession {
    if existing_age >= window || candidate_dialer <= existing_dialer {
        Supersession::Replace
    } else {
        Supersession::KeepExisting
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
