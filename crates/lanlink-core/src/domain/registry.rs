//! LinkRegistry: the at-most-one-link-per-device bookkeeping.
//!
//! Links live in a single arena keyed by a generated [`LinkKey`].  Two
//! secondary indices point into it:
//!
//! - `by_session` – [`SessionId`] → key, used when packets or close
//!   notifications arrive from the transport.
//! - `by_device`  – `deviceId` → key, used to find the link a new handshake
//!   supersedes.
//!
//! The registry also records the [`HandshakeState`] of every session it has
//! seen, including sessions that have not produced a link yet.
//!
//! # Concurrency
//!
//! The registry is a plain `&mut self` data structure with no interior
//! locking.  In `lanlink-node` exactly one coordinator task owns it and every
//! transport task talks to that task over a channel, so each method call is an
//! atomic lifecycle transition: no observer can ever see one index updated and
//! the other not.
//!
//! # Callbacks
//!
//! The registry never calls out.  [`LinkRegistry::complete_handshake`] returns
//! the evicted link (if any) alongside the new one so the caller can report
//! "lost" for the old link *before* "established" for the new one.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::domain::session::{HandshakeState, SessionId};

/// Arena key of a registered link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey(u64);

impl LinkKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Error type for registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    AlreadyRegistered(SessionId),
    #[error("{0} is not registered")]
    UnknownSession(SessionId),
    #[error("{0} already completed its handshake")]
    AlreadyIdentified(SessionId),
    #[error("{0} is closed")]
    SessionClosed(SessionId),
    #[error("{0} has no link (handshake never completed)")]
    NoLink(SessionId),
}

/// A link that was pushed out of the registry by a newer handshake for the
/// same device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted<L> {
    pub key: LinkKey,
    pub session_id: SessionId,
    pub device_id: String,
    pub link: L,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Established<L> {
    pub key: LinkKey,
    pub link: L,
    /// The previous link for the same device, already removed from both indices.
    pub evicted: Option<Evicted<L>>,
}

#[derive(Debug)]
struct LinkEntry<L> {
    session_id: SessionId,
    device_id: String,
    link: L,
}

/// Arena of links with session and device indices.
#[derive(Debug)]
pub struct LinkRegistry<L> {
    next_key: u64,
    links: HashMap<LinkKey, LinkEntry<L>>,
    by_session: HashMap<SessionId, LinkKey>,
    by_device: HashMap<String, LinkKey>,
    sessions: HashMap<SessionId, HandshakeState>,
}

impl<L> Default for LinkRegistry<L> {
    fn default() -> Self {
        Self {
            next_key: 1,
            links: HashMap::new(),
            by_session: HashMap::new(),
            by_device: HashMap::new(),
            sessions: HashMap::new(),
        }
    }
}

impl<L: Clone> LinkRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a freshly opened session as awaiting its identity packet.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the session is known.
    pub fn register_handshaking(&mut self, session_id: SessionId) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&session_id) {
            return Err(RegistryError::AlreadyRegistered(session_id));
        }
        self.sessions.insert(session_id, HandshakeState::AwaitingIdentity);
        Ok(())
    }

    /// Returns the handshake state of a session, or `None` if it was never
    /// registered or has already been removed.
    pub fn state(&self, session_id: SessionId) -> Option<HandshakeState> {
        self.sessions.get(&session_id).copied()
    }

    /// Completes the handshake of `session_id` for `device_id`.
    ///
    /// Any existing link for `device_id` is removed from both indices first
    /// (last writer wins) and its session is marked [`HandshakeState::Closed`].
    /// `build` is then called with the new key to construct the link value.
    ///
    /// # Errors
    ///
    /// Fails without touching the registry if the session is unknown, already
    /// identified, or closed.
    pub fn complete_handshake<F>(
        &mut self,
        session_id: SessionId,
        device_id: &str,
        build: F,
    ) -> Result<Established<L>, RegistryError>
    where
        F: FnOnce(LinkKey) -> L,
    {
        match self.sessions.get(&session_id) {
            None => return Err(RegistryError::UnknownSession(session_id)),
            Some(HandshakeState::Identified) => {
                return Err(RegistryError::AlreadyIdentified(session_id))
            }
            Some(HandshakeState::Closed) => return Err(RegistryError::SessionClosed(session_id)),
            Some(HandshakeState::AwaitingIdentity) => {}
        }

        let evicted = self.evict_device(device_id);

        let key = LinkKey(self.next_key);
        self.next_key += 1;
        let link = build(key);

        self.links.insert(
            key,
            LinkEntry {
                session_id,
                device_id: device_id.to_string(),
                link: link.clone(),
            },
        );
        self.by_session.insert(session_id, key);
        self.by_device.insert(device_id.to_string(), key);
        self.sessions.insert(session_id, HandshakeState::Identified);

        Ok(Established { key, link, evicted })
    }

    /// Returns the link owning `session_id`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::UnknownSession`] – never registered or already removed.
    /// - [`RegistryError::SessionClosed`] – the link was superseded.
    /// - [`RegistryError::NoLink`] – the handshake has not completed.
    pub fn link_for_session(&self, session_id: SessionId) -> Result<&L, RegistryError> {
        match self.sessions.get(&session_id) {
            None => Err(RegistryError::UnknownSession(session_id)),
            Some(HandshakeState::Closed) => Err(RegistryError::SessionClosed(session_id)),
            Some(HandshakeState::AwaitingIdentity) => Err(RegistryError::NoLink(session_id)),
            Some(HandshakeState::Identified) => self
                .by_session
                .get(&session_id)
                .and_then(|key| self.links.get(key))
                .map(|entry| &entry.link)
                .ok_or(RegistryError::NoLink(session_id)),
        }
    }

    /// Returns the current link for `device_id`, if any.
    pub fn link_for_device(&self, device_id: &str) -> Option<&L> {
        self.by_device
            .get(device_id)
            .and_then(|key| self.links.get(key))
            .map(|entry| &entry.link)
    }

    /// Forgets a session after its transport closed.
    ///
    /// Returns the session's link if it still owned one.  Calling this for a
    /// session that was superseded or already removed returns `None`.
    pub fn remove_by_session(&mut self, session_id: SessionId) -> Option<L> {
        self.sessions.remove(&session_id);
        let key = self.by_session.remove(&session_id)?;
        let entry = self.links.remove(&key)?;
        if self.by_device.get(&entry.device_id) == Some(&key) {
            self.by_device.remove(&entry.device_id);
        }
        Some(entry.link)
    }

    /// Number of established links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of sessions still waiting for their identity packet.
    pub fn handshaking_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| **s == HandshakeState::AwaitingIdentity)
            .count()
    }

    /// Iterates over `(device_id, link)` pairs in unspecified order.
    pub fn links(&self) -> impl Iterator<Item = (&str, &L)> {
        self.links
            .values()
            .map(|entry| (entry.device_id.as_str(), &entry.link))
    }

    /// Checks that the arena and both indices agree.
    ///
    /// Every link must be reachable from exactly one session and exactly one
    /// device id, and every index entry must point at a live link whose
    /// session is `Identified`.
    pub fn is_consistent(&self) -> bool {
        if self.by_session.len() != self.links.len() || self.by_device.len() != self.links.len() {
            return false;
        }
        let links_ok = self.links.iter().all(|(key, entry)| {
            self.by_session.get(&entry.session_id) == Some(key)
                && self.by_device.get(&entry.device_id) == Some(key)
                && self.sessions.get(&entry.session_id) == Some(&HandshakeState::Identified)
        });
        let sessions_ok = self.by_session.iter().all(|(session_id, key)| {
            self.links
                .get(key)
                .is_some_and(|entry| entry.session_id == *session_id)
        });
        let devices_ok = self.by_device.iter().all(|(device_id, key)| {
            self.links
                .get(key)
                .is_some_and(|entry| entry.device_id == *device_id)
        });
        links_ok && sessions_ok && devices_ok
    }

    fn evict_device(&mut self, device_id: &str) -> Option<Evicted<L>> {
        let key = self.by_device.remove(device_id)?;
        let entry = self.links.remove(&key)?;
        self.by_session.remove(&entry.session_id);
        self.sessions.insert(entry.session_id, HandshakeState::Closed);
        Some(Evicted {
            key,
            session_id: entry.session_id,
            device_id: entry.device_id,
            link: entry.link,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
