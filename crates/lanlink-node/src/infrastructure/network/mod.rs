//! Network infrastructure for the lanlink node.
//!
//! # Sub-modules
//!
//! - **`session`** – One TCP session: the write half behind a
//!   [`SessionSink`](crate::application::link::SessionSink) and a reader task
//!   that frames lines and reports them to the coordinator.
//!
//! - **`acceptor`** – TCP listener; every accepted stream becomes an inbound
//!   session that must identify itself first.
//!
//! - **`discovery`** – UDP listener for identity broadcasts.  Each valid,
//!   foreign identity triggers an outbound dial.
//!
//! - **`connector`** – Outbound TCP dial with a timeout; greets the peer with
//!   the local identity before the session is reported.
//!
//! - **`announcer`** – Sends the local identity as one UDP broadcast.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::application::link::LinkError;

pub mod acceptor;
pub mod announcer;
pub mod connector;
pub mod discovery;
pub mod session;

/// Errors raised while binding or dialing sockets.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A listening socket could not be bound.  Fatal to that transport only.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An outbound TCP connection was refused or failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An outbound TCP connection did not complete in time.
    #[error("connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    /// The greeting could not be written to a freshly dialed session.
    #[error("failed to greet {addr}: {source}")]
    Greeting {
        addr: SocketAddr,
        #[source]
        source: LinkError,
    },
}
