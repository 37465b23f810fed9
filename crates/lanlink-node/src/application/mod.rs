//! Application layer for the lanlink node.
//!
//! Sits between the pure bookkeeping in `lanlink_core` and the sockets in
//! `infrastructure`.  Nothing in here opens a socket: sessions are reached
//! through the [`link::SessionSink`] trait and discovery broadcasts through
//! [`coordinator::Announce`], so the whole layer can be driven from unit tests
//! with recording doubles.
//!
//! # Sub-modules
//!
//! - **`link`** – The [`link::Link`] handle given to the owning system once a
//!   peer has identified itself.
//!
//! - **`handler`** – The traits the owning system implements: callbacks for
//!   established/lost links and the source of the local identity packet.
//!
//! - **`coordinator`** – The single task that owns the link registry.  Every
//!   transport task reports to it over a channel.

pub mod coordinator;
pub mod handler;
pub mod link;
