//! UDP presence announcer.
//!
//! The server broadcasts one [`Announce`] datagram per interval to the
//! discovery port (by default `255.255.255.255:55556`).  Listeners on the LAN
//! build their server list from these datagrams and drop servers that fall
//! silent.
//!
//! # Delivery
//!
//! The socket has `SO_BROADCAST` set.  Announces are not acknowledged and a
//! lost one is replaced by the next.
//!
//! The announcer runs on a dedicated thread so the blocking socket never
//! touches the async runtime.  It re-reads the live client count from the
//! hub each cycle, so listeners see the session fill up.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use coedit_core::{Announce, SessionId, ValidationError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::collaboration::CollaborationHub;

/// Default time between two announces.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Granularity at which the announcer notices a shutdown request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for announcer start-up.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound or configured.
    #[error("failed to bind announce socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The announced identity or port is not acceptable.
    #[error("invalid announce: {0}")]
    InvalidAnnounce(#[from] ValidationError),

    #[error("failed to spawn announcer thread: {0}")]
    Spawn(std::io::Error),
}

/// What the server announces and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceSettings {
    pub server_id: SessionId,
    pub name: String,
    /// TCP port clients connect to.
    pub port: u16,
    /// Where datagrams are sent.
    pub target: SocketAddr,
    pub interval: Duration,
}

impl AnnounceSettings {
    /// Settings broadcasting to `255.255.255.255:discovery_port` every
    /// [`DEFAULT_ANNOUNCE_INTERVAL`].
    pub fn broadcast(server_id: SessionId, name: &str, port: u16, discovery_port: u16) -> Self {
        Self {
            server_id,
            name: name.to_string(),
            port,
            target: SocketAddr::from((Ipv4Addr::BROADCAST, discovery_port)),
            interval: DEFAULT_ANNOUNCE_INTERVAL,
        }
    }
}

/// Builds the announce for the hub's current state.
///
/// # Errors
///
/// Returns [`ValidationError`] for a nil id or a privileged port.
pub fn build_announce(
    settings: &AnnounceSettings,
    hub: &CollaborationHub,
) -> Result<Announce, ValidationError> {
    Announce::new(
        settings.server_id,
        &settings.name,
        settings.port,
        hub.requires_password(),
        saturate(hub.client_count()),
        saturate(hub.max_clients()),
    )
}

fn saturate(n: usize) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

/// Validates `settings`, binds an ephemeral broadcast-capable socket, and
/// spawns the announcer thread.  The thread exits once `running` is cleared.
///
/// # Errors
///
/// Returns [`DiscoveryError::InvalidAnnounce`] before binding if the
/// settings cannot produce a valid announce.
pub fn start_announcer(
    settings: AnnounceSettings,
    hub: Arc<CollaborationHub>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, DiscoveryError> {
    build_announce(&settings, &hub)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let socket = UdpSocket::bind(addr).map_err(|source| DiscoveryError::BindFailed { addr, source })?;
    socket
        .set_broadcast(true)
        .map_err(|source| DiscoveryError::BindFailed { addr, source })?;

    info!(
        "announcing '{}' (TCP {}) to {} every {:?}",
        settings.name, settings.port, settings.target, settings.interval
    );
    thread::Builder::new()
        .name("coedit-announce".to_string())
        .spawn(move || announce_loop(socket, settings, hub, running))
        .map_err(DiscoveryError::Spawn)
}

fn announce_loop(
    socket: UdpSocket,
    settings: AnnounceSettings,
    hub: Arc<CollaborationHub>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match build_announce(&settings, &hub) {
            Ok(announce) => {
                if let Err(e) = socket.send_to(&announce.encode(), settings.target) {
                    warn!("announce to {} failed: {e}", settings.target);
                } else {
                    debug!(
                        "announced {} client(s) of {}",
                        announce.client_count, announce.max_clients
                    );
                }
            }
            Err(e) => warn!("skipping announce: {e}"),
        }

        let next = Instant::now() + settings.interval;
        while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= next {
                break;
            }
            thread::sleep((next - now).min(STOP_POLL_INTERVAL));
        }
    }
    info!("announcer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::collaboration::HubConfig;
    use coedit_core::ConnectionRequest;
    use uuid::Uuid;

    fn hub() -> Arc<CollaborationHub> {
        Arc::new(
            CollaborationHub::new(HubConfig {
                file_path: "doc.txt".to_string(),
                password: Some("pw".to_string()),
                max_clients: 3,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_build_announce_reflects_hub_state() {
        // Arrange
        let hub = hub();
        let settings = AnnounceSettings::broadcast(Uuid::new_v4(), " Doc A ", 55555, 55556);
        let request = ConnectionRequest::new(Some("pw".to_string()), None).unwrap();
        hub.evaluate_handshake(Uuid::new_v4(), &request).unwrap();

        // Act
        let announce = build_announce(&settings, &hub).unwrap();

        // Assert
        assert_eq!(announce.name, "Doc A");
        assert!(announce.requires_password);
        assert_eq!(announce.client_count, 1);
        assert_eq!(announce.max_clients, 3);
    }

    #[test]
    fn test_start_rejects_privileged_port() {
        let settings = AnnounceSettings::broadcast(Uuid::new_v4(), "x", 80, 55556);
        let result = start_announcer(settings, hub(), Arc::new(AtomicBool::new(true)));
        assert!(matches!(
            result,
            Err(DiscoveryError::InvalidAnnounce(ValidationError::PrivilegedPort(80)))
        ));
    }

    #[test]
    fn test_announcer_sends_datagrams_until_stopped() {
        // Arrange
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let id = Uuid::new_v4();
        let settings = AnnounceSettings {
            server_id: id,
            name: "Doc A".to_string(),
            port: 55555,
            target: receiver.local_addr().unwrap(),
            interval: Duration::from_millis(20),
        };
        let running = Arc::new(AtomicBool::new(true));

        // Act
        let handle = start_announcer(settings, hub(), Arc::clone(&running)).unwrap();
        let mut buf = [0u8; 1024];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        // Assert
        let announce = Announce::decode(&buf[..len]).unwrap();
        assert_eq!(announce.id, id);
        assert_eq!(announce.port, 55555);
    }
}
