//! # lanlink-core
//!
//! Shared library for lanlink containing the packet envelope, the newline
//! framer, the per-session handshake rules, and the link registry.
//!
//! It has zero dependencies on sockets or async runtimes: everything in here
//! can be unit-tested synchronously.  The `lanlink-node` crate drives these
//! types from its Tokio tasks.
//!
//! # Architecture overview (for beginners)
//!
//! lanlink finds other devices on the same LAN and keeps one TCP connection
//! (a *link*) open to each of them:
//!
//! 1. A device broadcasts an *identity packet* over UDP.
//! 2. Every device that hears it dials back over TCP and sends its own identity
//!    as the first line on the new connection.
//! 3. Both ends now know who is on the other side and register a link keyed by
//!    the peer's `deviceId`.
//!
//! This crate defines:
//!
//! - **`protocol`** – What travels on the wire: single-line JSON packets
//!   (`NetworkPacket`), the typed `IdentityPacket` view, and the `LineFramer`
//!   that splits a byte stream on `\n`.
//!
//! - **`domain`** – Pure bookkeeping: session identifiers, the handshake state
//!   machine, and the `LinkRegistry` that guarantees at most one link per
//!   device.

pub mod domain;
pub mod protocol;

pub use domain::handshake::{
    classify_packet, resolve_duplicate, HandshakeAction, ProtocolViolation, Supersession,
};
pub use domain::registry::{Established, Evicted, LinkKey, LinkRegistry, RegistryError};
pub use domain::session::{HandshakeState, SessionId, SessionIdGenerator};
pub use protocol::framer::{FramerError, LineFramer};
pub use protocol::identity::{IdentityError, IdentityPacket};
pub use protocol::packet::{NetworkPacket, PacketError, PACKET_TYPE_IDENTITY};
