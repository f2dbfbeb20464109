//! UDP discovery listener.
//!
//! Binds the discovery port, decodes every [`Announce`] datagram, and feeds
//! it to the [`ServerRegistry`] together with the datagram's source address.
//! Foreign or malformed datagrams are logged and skipped.
//!
//! # Read timeout
//!
//! The socket uses a 500 ms read timeout.  Each wake-up, whether a datagram
//! arrived or the timeout fired, runs the registry's staleness sweep and
//! checks the `running` flag, so silent servers expire even when the network
//! is quiet and shutdown is noticed promptly.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use coedit_core::protocol::announce::MAX_ANNOUNCE_DATAGRAM;
use coedit_core::Announce;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::server_browser::ServerRegistry;

/// Default silence after which a server is considered gone.  Five announce
/// intervals at the default rate.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(5);

const LISTEN_TIMEOUT: Duration = Duration::from_millis(500);

/// Error type for discovery listener start-up.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound or configured.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn discovery thread: {0}")]
    Spawn(std::io::Error),
}

/// A running listener.
#[derive(Debug)]
pub struct DiscoveryListener {
    pub local_addr: SocketAddr,
    pub thread: JoinHandle<()>,
}

/// Binds `0.0.0.0:discovery_port` and starts the listener thread.
pub fn start_discovery_listener(
    discovery_port: u16,
    registry: Arc<ServerRegistry>,
    running: Arc<AtomicBool>,
) -> Result<DiscoveryListener, DiscoveryError> {
    listen_on(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, discovery_port)),
        registry,
        running,
    )
}

/// Binds `addr` and starts the listener thread.  The thread exits once
/// `running` is cleared.
///
/// # Errors
///
/// Returns [`DiscoveryError::BindFailed`] if the socket cannot be bound.
pub fn listen_on(
    addr: SocketAddr,
    registry: Arc<ServerRegistry>,
    running: Arc<AtomicBool>,
) -> Result<DiscoveryListener, DiscoveryError> {
    let socket = UdpSocket::bind(addr).map_err(|source| DiscoveryError::BindFailed { addr, source })?;
    socket
        .set_read_timeout(Some(LISTEN_TIMEOUT))
        .map_err(|source| DiscoveryError::BindFailed { addr, source })?;
    let local_addr = socket
        .local_addr()
        .map_err(|source| DiscoveryError::BindFailed { addr, source })?;

    let thread = thread::Builder::new()
        .name("coedit-discovery".to_string())
        .spawn(move || listen_loop(socket, registry, running))
        .map_err(DiscoveryError::Spawn)?;

    info!("listening for servers on UDP {local_addr}");
    Ok(DiscoveryListener { local_addr, thread })
}

fn listen_loop(socket: UdpSocket, registry: Arc<ServerRegistry>, running: Arc<AtomicBool>) {
    // One byte of slack detects oversized datagrams instead of truncating them.
    let mut buf = vec![0u8; MAX_ANNOUNCE_DATAGRAM + 1];

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, src)) if len > MAX_ANNOUNCE_DATAGRAM => {
                debug!("ignoring oversized datagram ({len} bytes) from {src}");
            }
            Ok((len, src)) => match Announce::decode(&buf[..len]) {
                Ok(announce) => {
                    if let Err(e) = registry.observe(&announce, src.ip()) {
                        warn!("announce from {src} rejected: {e}");
                    }
                }
                Err(e) => debug!("malformed discovery datagram from {src}: {e}"),
            },
            Err(e) if is_timeout_error(&e) => {}
            Err(e) => {
                error!("discovery recv error: {e}");
                thread::sleep(LISTEN_TIMEOUT);
            }
        }
        registry.expire_stale();
    }

    info!("discovery listener stopped");
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
