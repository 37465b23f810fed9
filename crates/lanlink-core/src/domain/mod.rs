//! Domain logic for lanlink.
//!
//! Nothing in here touches a socket.  The types describe *what* a session and
//! a link are and which transitions between them are legal; the node crate
//! decides *when* those transitions happen.

/// Per-session handshake classification.
pub mod handshake;

/// Arena of links indexed by session and by device.
///
/// See [`registry::LinkRegistry`] for the main type.
pub mod registry;

/// Session identifiers and handshake states.
pub mod session;
