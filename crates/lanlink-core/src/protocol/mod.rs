//! Protocol module containing the packet envelope, the identity packet, and
//! the newline framer.

pub mod framer;
pub mod identity;
pub mod packet;

pub use framer::{FramerError, LineFramer};
pub use identity::{IdentityError, IdentityPacket, PROTOCOL_VERSION};
pub use packet::{NetworkPacket, PacketError, PACKET_TYPE_IDENTITY};

/// The single TCP+UDP port used for both discovery and link traffic.
pub const DEFAULT_PORT: u16 = 1714;
