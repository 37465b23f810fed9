//! Traits implemented by the system that owns the link provider.

use std::sync::{Arc, OnceLock};

use lanlink_core::IdentityPacket;

use crate::application::link::Link;

/// Link lifecycle callbacks.
///
/// Both methods run on the coordinator task.  For a device that reconnects,
/// `on_link_lost` for the old link is always called before
/// `on_link_established` for the new one.
pub trait LinkHandler: Send + Sync {
    fn on_link_established(&self, identity: &IdentityPacket, link: Link);
    fn on_link_lost(&self, link: Link);
}

/// Builds the identity packet this device announces and greets peers with.
#[cfg_attr(test, mockall::automock)]
pub trait IdentitySource: Send + Sync {
    fn identity(&self) -> IdentityPacket;
}

/// An [`IdentitySource`] that always returns the same packet.
#[derive(Debug, Clone)]
pub struct StaticIdentitySource {
    identity: IdentityPacket,
}

impl StaticIdentitySource {
    pub fn new(identity: IdentityPacket) -> Self {
        Self { identity }
    }
}

impl IdentitySource for StaticIdentitySource {
    fn identity(&self) -> IdentityPacket {
        self.identity.clone()
    }
}

/// Wraps the owner's identity source and stamps the TCP port the acceptor
/// actually bound, so peers dial the right port.
pub(crate) struct AdvertisedIdentity {
    inner: Arc<dyn IdentitySource>,
    tcp_port: OnceLock<u16>,
}

impl AdvertisedIdentity {
    pub(crate) fn new(inner: Arc<dyn IdentitySource>) -> Self {
        Self {
            inner,
            tcp_port: OnceLock::new(),
        }
    }

    /// Records the bound acceptor port.  Only the first call has an effect.
    pub(crate) fn set_tcp_port(&self, port: u16) {
        let _ = self.tcp_port.set(port);
    }
}

impl IdentitySource for AdvertisedIdentity {
    fn identity(&self) -> IdentityPacket {
        let mut identity = self.inner.identity();
        if identity.tcp_port.is_none() {
            identity.tcp_port = self.tcp_port.get().copied();
        }
        identity
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
