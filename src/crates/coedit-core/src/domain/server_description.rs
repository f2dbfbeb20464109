//! ServerDescription: a discovered server and its liveness.
//!
//! # Lifecycle
//!
//! ```text
//! first Announce ──► active ──(Announce)──► active (fields compared, timer reset)
//!                      │
//!                      └──(silence > staleness window)──► inactive  (terminal)
//! ```
//!
//! A description is identified by the announced id, the network endpoint
//! the datagram came from, and the announced port.  An announce reusing an id
//! from a different endpoint is a different logical server.
//!
//! The entity is passive: [`ServerDescription::apply_announce`] and
//! [`ServerDescription::mark_inactive`] report whether anything changed and
//! leave notification to the owning registry.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::protocol::announce::Announce;
use crate::protocol::messages::SessionId;

/// Registry key of a discovered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub id: SessionId,
    pub endpoint: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.endpoint, self.port)
    }
}

/// Errors raised while applying an announce to an existing description.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The announce does not belong to this registration.
    #[error("announce for {actual} does not match registration {expected}")]
    IdentityMismatch { expected: ServerKey, actual: ServerKey },

    /// The description already went inactive and must be discarded.
    #[error("server {0} is inactive")]
    Inactive(ServerKey),
}

/// A server discovered through its announces.
///
/// `endpoint`, `ping`, `active` and `last_updated` are local to the
/// listener and never transmitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    id: SessionId,
    name: String,
    port: u16,
    requires_password: bool,
    client_count: u16,
    max_clients: u16,
    endpoint: IpAddr,
    ping: Option<Duration>,
    active: bool,
    last_updated: Instant,
}

impl ServerDescription {
    /// Creates a description from the first announce heard from `endpoint`.
    pub fn from_announce(announce: &Announce, endpoint: IpAddr, now: Instant) -> Self {
        Self {
            id: announce.id,
            name: announce.name.clone(),
            port: announce.port,
            requires_password: announce.requires_password,
            client_count: announce.client_count,
            max_clients: announce.max_clients,
            endpoint,
            ping: None,
            active: true,
            last_updated: now,
        }
    }

    /// Key under which an announce from `endpoint` is registered.
    pub fn key_for(announce: &Announce, endpoint: IpAddr) -> ServerKey {
        ServerKey {
            id: announce.id,
            endpoint,
            port: announce.port,
        }
    }

    pub fn key(&self) -> ServerKey {
        ServerKey {
            id: self.id,
            endpoint: self.endpoint,
            port: self.port,
        }
    }

    /// Applies a later announce.  Always resets the last-heard timer and
    /// returns `true` if at least one mutable field changed.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::IdentityMismatch`] if id, endpoint or port
    /// differ from the registration, and [`DiscoveryError::Inactive`] once the
    /// description has gone inactive.
    pub fn apply_announce(
        &mut self,
        announce: &Announce,
        endpoint: IpAddr,
        now: Instant,
    ) -> Result<bool, DiscoveryError> {
        let actual = Self::key_for(announce, endpoint);
        if actual != self.key() {
            return Err(DiscoveryError::IdentityMismatch {
                expected: self.key(),
                actual,
            });
        }
        if !self.active {
            return Err(DiscoveryError::Inactive(self.key()));
        }

        let mut changed = false;
        if self.name != announce.name {
            self.name.clone_from(&announce.name);
            changed = true;
        }
        if self.client_count != announce.client_count {
            self.client_count = announce.client_count;
            changed = true;
        }
        if self.max_clients != announce.max_clients {
            self.max_clients = announce.max_clients;
            changed = true;
        }
        if self.requires_password != announce.requires_password {
            self.requires_password = announce.requires_password;
            changed = true;
        }
        self.last_updated = now;
        Ok(changed)
    }

    /// Time since the last announce, measured at `now`.
    pub fn elapsed_since_update(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_updated)
    }

    pub fn is_stale(&self, now: Instant, staleness: Duration) -> bool {
        self.elapsed_since_update(now) > staleness
    }

    /// Transitions to inactive.  Returns `true` only on the first call.
    pub fn mark_inactive(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    pub fn set_ping(&mut self, ping: Duration) {
        self.ping = Some(ping);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requires_password(&self) -> bool {
        self.requires_password
    }

    pub fn client_count(&self) -> u16 {
        self.client_count
    }

    pub fn max_clients(&self) -> u16 {
        self.max_clients
    }

    pub fn endpoint(&self) -> IpAddr {
        self.endpoint
    }

    pub fn ping(&self) -> Option<Duration> {
        self.ping
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }
}
