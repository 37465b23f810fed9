//! lanlink-node library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the `lanlink` binary share the same module tree.
//!
//! Most callers only need [`provider::LinkProvider`], the
//! [`application::handler::LinkHandler`] callbacks it drives, and the
//! [`application::link::Link`] handles it hands out.

pub mod application;
pub mod infrastructure;
pub mod provider;

pub use application::handler::{IdentitySource, LinkHandler, StaticIdentitySource};
pub use application::link::{Link, LinkError, PacketReceiver};
pub use provider::{LinkProvider, ProviderConfig};
