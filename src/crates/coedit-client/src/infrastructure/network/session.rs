//! ClientSession: the client side of the handshake and the pull cycle.
//!
//! ```text
//! ClientSession::connect
//!   ├─ FrameConnection::connect(server)
//!   ├─ send ConnectionRequest { password, metadata }
//!   └─ read ConnectionResponse
//!        ├─ Approved → ConnectionOutcome::Approved { session, file_path, operations, events }
//!        └─ rejected → ConnectionOutcome::Rejected(code)   (not an error)
//!
//! ClientSession::poll(update)
//!   ├─ send ClientUpdate
//!   ├─ read RemoteConnection / RemoteDisconnection notices → SessionEvent
//!   └─ read ClientUpdate → returned to the caller
//! ```
//!
//! The session is blocking and single-threaded.  Every server message is
//! either the handshake response, a notice queued ahead of an update
//! response, or the update response itself, so all reads happen inside
//! `connect` and `poll`.  Events go out on an unbounded `tokio::sync::mpsc`
//! channel.

use std::net::ToSocketAddrs;

use coedit_core::{
    ClientMetadata, ClientUpdate, ConnectionRequest, ConnectionResponseCode, DisconnectionRequest,
    FrameConnection, Operation, PacketSequencer, PayloadType, SessionId, SyncPayload,
    TransportError, ValidationError,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::sync_state::{OutboundChanges, PeerDirectory, SessionEvent};

/// Errors that can occur in a client session.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection failed or was lost.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A locally built payload was invalid.
    #[error("invalid payload: {0}")]
    Validation(#[from] ValidationError),

    /// The server sent a message that makes no sense at this point.
    #[error("unexpected {0:?} from server")]
    UnexpectedPayload(PayloadType),

    /// The server closed the connection.
    #[error("server closed the connection")]
    ServerClosed,
}

/// Result of a handshake.  A rejection is data, not an error.
#[derive(Debug)]
pub enum ConnectionOutcome {
    Approved {
        session: ClientSession,
        /// Authoritative path of the shared document.
        file_path: String,
        /// Full history to apply before the first poll.
        operations: Vec<Operation>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    },
    Rejected(ConnectionResponseCode),
}

/// An approved connection to a server.
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    conn: FrameConnection,
    sequencer: PacketSequencer,
    peers: PeerDirectory,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientSession {
    /// Connects to `addr` and performs the handshake as `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Validation`] for an oversized password or
    /// metadata (before connecting), [`ClientError::Transport`] if the
    /// connection fails, and [`ClientError::UnexpectedPayload`] /
    /// [`ClientError::ServerClosed`] if the server does not answer with a
    /// connection response.
    pub fn connect(
        addr: impl ToSocketAddrs,
        id: SessionId,
        password: Option<String>,
        metadata: Option<Vec<u8>>,
    ) -> Result<ConnectionOutcome, ClientError> {
        let request = ConnectionRequest::new(password, metadata)?;
        let conn = FrameConnection::connect(addr)?;
        let sequencer = PacketSequencer::new(id);
        debug!("connected to {}, sending handshake as {id}", conn.peer_addr());

        conn.send_payload(&sequencer, &SyncPayload::ConnectionRequest(request))?;
        let response = match conn.read_payload()? {
            Some((_, SyncPayload::ConnectionResponse(response))) => response,
            Some((_, other)) => return Err(ClientError::UnexpectedPayload(other.payload_type())),
            None => return Err(ClientError::ServerClosed),
        };

        let code = response.code();
        let Some((file_path, operations)) = response.into_approval() else {
            info!("server {} rejected the handshake: {code:?}", conn.peer_addr());
            conn.close();
            return Ok(ConnectionOutcome::Rejected(code));
        };

        info!(
            "joined '{file_path}' on {} with {} operation(s) of history",
            conn.peer_addr(),
            operations.len()
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            conn,
            sequencer,
            peers: PeerDirectory::new(),
            events: tx,
        };
        Ok(ConnectionOutcome::Approved {
            session,
            file_path,
            operations,
            events: rx,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Sends one update and returns the server's answer: the remote
    /// operations to apply, in order, and the peers' changed metadata.
    /// Presence notices that arrive first are applied and emitted as events.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ServerClosed`] (after emitting
    /// [`SessionEvent::Disconnected`]) if the server goes away mid-cycle.
    pub fn poll(&mut self, update: ClientUpdate) -> Result<ClientUpdate, ClientError> {
        update.validate_from_client(self.id)?;
        self.send(&SyncPayload::Update(update))?;
        loop {
            match self.conn.read_payload()? {
                Some((_, SyncPayload::Update(reply))) => {
                    for event in self.peers.apply_metadata(&reply) {
                        self.emit(event);
                    }
                    return Ok(reply);
                }
                Some((_, notice)) => match self.peers.apply_notice(&notice) {
                    Some(event) => self.emit(event),
                    None => return Err(ClientError::UnexpectedPayload(notice.payload_type())),
                },
                None => {
                    warn!("server closed the connection during a poll");
                    self.emit(SessionEvent::Disconnected);
                    return Err(ClientError::ServerClosed);
                }
            }
        }
    }

    /// Drains `outbound` into one update and polls with it.
    pub fn sync(&mut self, outbound: &mut OutboundChanges) -> Result<ClientUpdate, ClientError> {
        let update = outbound.take_update(self.id)?;
        self.poll(update)
    }

    /// Pushes new own metadata outside of the pull cycle.
    pub fn push_metadata(&self, blob: Vec<u8>) -> Result<(), ClientError> {
        let bundle = ClientMetadata::single(self.id, blob)?;
        self.send(&SyncPayload::Metadata(bundle))
    }

    /// Announces departure and closes the connection.
    pub fn disconnect(self) -> Result<(), ClientError> {
        let result = self.send(&SyncPayload::Disconnection(DisconnectionRequest));
        self.conn.close();
        info!("left session as {}", self.id);
        result
    }

    fn send(&self, payload: &SyncPayload) -> Result<(), ClientError> {
        match self.conn.send_payload(&self.sequencer, payload) {
            Ok(()) => Ok(()),
            Err(TransportError::Disconnected) => {
                self.emit(SessionEvent::Disconnected);
                Err(ClientError::ServerClosed)
            }
            Err(e) => Err(e.into()),
        }
    }
}
