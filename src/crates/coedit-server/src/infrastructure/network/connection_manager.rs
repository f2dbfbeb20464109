//! ConnectionManager: the TCP accept loop and one serving thread per client.
//!
//! # Connection lifecycle
//!
//! ```text
//! accept ──► read ConnectionRequest ──► hub decides ──► write response
//!                                                         │
//!              rejected: close ◄─────────────────────────┤
//!                                                         ▼
//!            ┌──────────── pull loop ◄──────────────── approved
//!            │  ClientUpdate   → flush notices, answer with ClientUpdate
//!            │  ClientMetadata → store, no answer
//!            │  Disconnection / EOF / fault → leave loop
//!            ▼
//!        hub.disconnect(id) (queues RemoteDisconnection for peers) → close
//! ```
//!
//! Everything here is blocking I/O on plain threads, matching the
//! `FrameConnection` model; the async runtime is never blocked.
//!
//! # Shutdown
//!
//! [`ConnectionManager::shutdown`] flips the hub into shutting-down state (so
//! a handshake already in flight is answered `ServerShuttingDown`), stops the
//! accept loop, and disposes every live connection.  Disposal wakes each
//! serving thread out of its blocking read.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use coedit_core::{
    ConnectionResponse, ConnectionResponseCode, FrameConnection, PacketSequencer, SessionId,
    SyncPayload, TransportError,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::collaboration::{CollaborationHub, HubError};
use crate::application::handshake::Handshake;

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error type for connection management operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type LiveConnections = Arc<Mutex<HashMap<SessionId, Arc<FrameConnection>>>>;

/// Owns the listening socket and the serving threads.
#[derive(Debug)]
pub struct ConnectionManager {
    local_addr: SocketAddr,
    hub: Arc<CollaborationHub>,
    running: Arc<AtomicBool>,
    live: LiveConnections,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Binds `bind_addr` and starts accepting clients.
    ///
    /// `server_id` is the sender identity stamped on every packet the server
    /// writes.  Pass port `0` to let the OS choose; [`Self::local_addr`]
    /// reports the result.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the socket cannot be bound.
    pub fn start(
        bind_addr: SocketAddr,
        server_id: SessionId,
        hub: Arc<CollaborationHub>,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(bind_addr).map_err(|source| NetworkError::BindFailed {
            addr: bind_addr,
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let live: LiveConnections = Arc::new(Mutex::new(HashMap::new()));
        let sequencer = Arc::new(PacketSequencer::new(server_id));

        let accept_thread = {
            let hub = Arc::clone(&hub);
            let running = Arc::clone(&running);
            let live = Arc::clone(&live);
            thread::Builder::new()
                .name("coedit-accept".to_string())
                .spawn(move || accept_loop(listener, hub, sequencer, live, running))?
        };

        info!("accepting clients on TCP {local_addr}");
        Ok(Self {
            local_addr,
            hub,
            running,
            live,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of approved connections currently being served.
    pub fn live_connections(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops accepting, refuses further handshakes, and disposes every live
    /// connection.  Idempotent.
    pub fn shutdown(&self) {
        self.hub.begin_shutdown();
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("accept thread panicked");
            }
        }
        let connections: Vec<Arc<FrameConnection>> = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            conn.close();
        }
        info!("connection manager stopped");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    hub: Arc<CollaborationHub>,
    sequencer: Arc<PacketSequencer>,
    live: LiveConnections,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted TCP connection from {peer}");
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("dropping {peer}: {e}");
                    continue;
                }
                let conn = match FrameConnection::new(stream) {
                    Ok(conn) => Arc::new(conn),
                    Err(e) => {
                        warn!("dropping {peer}: {e}");
                        continue;
                    }
                };
                let hub = Arc::clone(&hub);
                let sequencer = Arc::clone(&sequencer);
                let live = Arc::clone(&live);
                let running = Arc::clone(&running);
                let spawned = thread::Builder::new()
                    .name(format!("coedit-conn-{peer}"))
                    .spawn(move || serve_connection(conn, &hub, &sequencer, &live, &running));
                if let Err(e) = spawned {
                    error!("failed to spawn connection thread for {peer}: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("accept failed: {e}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    debug!("accept loop stopped");
}

/// Serves one connection from handshake to departure.
fn serve_connection(
    conn: Arc<FrameConnection>,
    hub: &CollaborationHub,
    sequencer: &PacketSequencer,
    live: &LiveConnections,
    running: &AtomicBool,
) {
    let peer = conn.peer_addr();
    let session = match perform_handshake(&conn, hub, sequencer) {
        Ok(Some(session)) => session,
        Ok(None) => {
            conn.close();
            return;
        }
        Err(e) => {
            warn!("handshake with {peer} failed: {e}");
            conn.close();
            return;
        }
    };

    live.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(session, Arc::clone(&conn));
    // Shutdown may have drained `live` between the handshake and the insert.
    if !running.load(Ordering::SeqCst) {
        conn.close();
    }

    match pull_loop(&conn, hub, sequencer, session) {
        Ok(()) => debug!("session {session} ({peer}) ended"),
        Err(TransportError::Disposed) => debug!("session {session} ({peer}) disposed"),
        Err(TransportError::Protocol(e)) => warn!("malformed data from {session} ({peer}): {e}"),
        Err(e) => error!("session {session} ({peer}) failed: {e}"),
    }

    hub.disconnect(session);
    live.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&session);
    conn.close();
}

/// Reads the first sequence and answers it.  Returns the session id on
/// approval, `None` on rejection or early departure.
fn perform_handshake(
    conn: &FrameConnection,
    hub: &CollaborationHub,
    sequencer: &PacketSequencer,
) -> Result<Option<SessionId>, TransportError> {
    let Some((sender, payload)) = conn.read_payload()? else {
        return Ok(None);
    };
    let SyncPayload::ConnectionRequest(request) = payload else {
        warn!(
            "{} opened with {:?} instead of a connection request",
            conn.peer_addr(),
            payload.payload_type()
        );
        send_rejection(conn, sequencer, ConnectionResponseCode::Other)?;
        return Ok(None);
    };

    let mut handshake = Handshake::new();
    let response = match handshake.respond(hub, sender, &request) {
        Ok(response) => response,
        Err(e) => {
            warn!("invalid connection request from {sender}: {e}");
            send_rejection(conn, sequencer, ConnectionResponseCode::Other)?;
            return Ok(None);
        }
    };
    let approved = handshake.is_approved();
    if let Err(e) = conn.send_payload(sequencer, &SyncPayload::ConnectionResponse(response)) {
        if approved {
            hub.disconnect(sender);
        }
        return Err(e);
    }
    Ok(approved.then_some(sender))
}

fn send_rejection(
    conn: &FrameConnection,
    sequencer: &PacketSequencer,
    code: ConnectionResponseCode,
) -> Result<(), TransportError> {
    let response = ConnectionResponse::rejected(code)?;
    conn.send_payload(sequencer, &SyncPayload::ConnectionResponse(response))
}

fn pull_loop(
    conn: &FrameConnection,
    hub: &CollaborationHub,
    sequencer: &PacketSequencer,
    session: SessionId,
) -> Result<(), TransportError> {
    while let Some((sender, payload)) = conn.read_payload()? {
        if sender != session {
            warn!("session {session} sent a sequence stamped {sender}; closing");
            return Ok(());
        }
        match payload {
            SyncPayload::Update(update) => {
                let response = match hub.apply_update(session, update) {
                    Ok(response) => response,
                    Err(HubError::UnknownSession(_)) => return Ok(()),
                    Err(HubError::Validation(e)) => {
                        warn!("rejecting update from {session}: {e}");
                        return Ok(());
                    }
                };
                for notice in hub.take_notices(session) {
                    conn.send_payload(sequencer, &notice)?;
                }
                conn.send_payload(sequencer, &SyncPayload::Update(response))?;
            }
            SyncPayload::Metadata(bundle) => {
                if let Err(e) = hub.store_metadata(session, bundle) {
                    warn!("rejecting metadata from {session}: {e}");
                    return Ok(());
                }
            }
            SyncPayload::Disconnection(_) => {
                debug!("session {session} requested disconnection");
                return Ok(());
            }
            other => {
                warn!(
                    "session {session} sent unexpected {:?}; closing",
                    other.payload_type()
                );
                return Ok(());
            }
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::collaboration::HubConfig;
    use coedit_core::ConnectionRequest;
    use uuid::Uuid;

    fn start(max_clients: usize) -> (ConnectionManager, Arc<CollaborationHub>) {
        let hub = Arc::new(
            CollaborationHub::new(HubConfig {
                file_path: "doc.txt".to_string(),
                password: None,
                max_clients,
            })
            .unwrap(),
        );
        let manager =
            ConnectionManager::start("127.0.0.1:0".parse().unwrap(), Uuid::new_v4(), Arc::clone(&hub))
                .unwrap();
        (manager, hub)
    }

    fn handshake(addr: SocketAddr, id: SessionId) -> (FrameConnection, ConnectionResponse) {
        let conn = FrameConnection::connect(addr).unwrap();
        let sequencer = PacketSequencer::new(id);
        conn.send_payload(
            &sequencer,
            &SyncPayload::ConnectionRequest(ConnectionRequest::default()),
        )
        .unwrap();
        match conn.read_payload().unwrap() {
            Some((_, SyncPayload::ConnectionResponse(r))) => (conn, r),
            other => panic!("expected connection response, got {other:?}"),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let (first, hub) = start(4);
        let result = ConnectionManager::start(first.local_addr(), Uuid::new_v4(), hub);
        assert!(matches!(result, Err(NetworkError::BindFailed { .. })));
    }

    #[test]
    fn test_approved_connection_is_tracked_until_peer_leaves() {
        // Arrange
        let (manager, hub) = start(4);

        // Act
        let (conn, response) = handshake(manager.local_addr(), Uuid::new_v4());

        // Assert
        assert!(response.is_approved());
        assert!(wait_until(|| manager.live_connections() == 1));
        drop(conn);
        assert!(wait_until(|| hub.client_count() == 0));
        assert!(wait_until(|| manager.live_connections() == 0));
    }

    #[test]
    fn test_non_request_first_message_is_rejected_as_other() {
        let (manager, _hub) = start(4);
        let conn = FrameConnection::connect(manager.local_addr()).unwrap();
        let sequencer = PacketSequencer::new(Uuid::new_v4());

        conn.send_payload(&sequencer, &SyncPayload::Disconnection(Default::default()))
            .unwrap();
        let reply = conn.read_payload().unwrap();

        match reply {
            Some((_, SyncPayload::ConnectionResponse(r))) => {
                assert_eq!(r.code(), ConnectionResponseCode::Other)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_shutdown_closes_live_connections() {
        let (manager, hub) = start(4);
        let (conn, _) = handshake(manager.local_addr(), Uuid::new_v4());
        assert!(wait_until(|| manager.live_connections() == 1));

        manager.shutdown();

        assert!(conn.read_payload().unwrap().is_none());
        assert!(hub.is_shutting_down());
        assert!(wait_until(|| hub.client_count() == 0));
    }
}
