//! CollaborationHub: the server's authoritative session state.
//!
//! The hub owns everything the server knows about a document session:
//!
//! - the operation history, in authoritative application order, each entry
//!   tagged with the client that produced it;
//! - exactly one metadata blob per connected client;
//! - per-client bookkeeping of what has already been delivered, so each poll
//!   returns only what changed since that client's previous poll;
//! - a queue of presence notices (`RemoteConnection` / `RemoteDisconnection`)
//!   per client, flushed by the connection loop before the next update
//!   response.
//!
//! # Differential updates
//!
//! Clients *pull*.  Every poll carries the client's own new operations and,
//! when it changed, its own metadata.  The hub appends the operations to the
//! history and answers with everything the client has not seen yet:
//!
//! ```text
//! history:  [A1][B1][A2][C1][B2]
//!                  ▲               ▲
//!            B's cursor       end of history
//!
//! B polls with [B2] → hub appends B2, answers with [A2][C1] (B's own B2 is
//! skipped), and moves B's cursor to the end.
//! ```
//!
//! Metadata works the same way with a version counter instead of a cursor.
//! "Nothing new" is expressed by leaving the field absent, never by sending an
//! empty collection.
//!
//! The hub performs no I/O.  It is shared between connection threads behind
//! an `Arc` and serialises all mutation through one internal mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use coedit_core::{
    ClientDescription, ClientMetadata, ClientUpdate, ConnectionRequest, ConnectionResponse,
    ConnectionResponseCode, Operation, RemoteConnection, RemoteDisconnection, SessionId,
    SyncPayload, ValidationError,
};
use thiserror::Error;
use tracing::{debug, info};

/// Error type for hub operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The session is not (or no longer) connected.
    #[error("session {0} is not connected")]
    UnknownSession(SessionId),

    /// The client sent a payload that violates its own constraints.
    #[error("invalid payload: {0}")]
    Validation(#[from] ValidationError),
}

/// Static session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Path of the shared document, sent to every approved client.
    pub file_path: String,
    /// Password clients must present, or `None` for an open session.
    pub password: Option<String>,
    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,
}

#[derive(Debug)]
struct MetadataEntry {
    blob: Vec<u8>,
    version: u64,
}

#[derive(Debug)]
struct ClientState {
    /// Index into the history of the first operation not yet delivered.
    cursor: usize,
    /// Highest metadata version already delivered.
    metadata_seen: u64,
    notices: VecDeque<SyncPayload>,
}

#[derive(Debug, Default)]
struct HubState {
    history: Vec<(SessionId, Operation)>,
    metadata: HashMap<SessionId, MetadataEntry>,
    metadata_version: u64,
    clients: HashMap<SessionId, ClientState>,
    shutting_down: bool,
}

impl HubState {
    fn store_metadata(&mut self, id: SessionId, blob: Vec<u8>) {
        self.metadata_version += 1;
        self.metadata.insert(
            id,
            MetadataEntry {
                blob,
                version: self.metadata_version,
            },
        );
    }

    fn broadcast_notice(&mut self, from: SessionId, notice: &SyncPayload) {
        for (id, client) in self.clients.iter_mut() {
            if *id != from {
                client.notices.push_back(notice.clone());
            }
        }
    }

    fn rejection(
        &self,
        sender: SessionId,
        request: &ConnectionRequest,
        config: &HubConfig,
    ) -> Option<ConnectionResponseCode> {
        if self.shutting_down {
            return Some(ConnectionResponseCode::ServerShuttingDown);
        }
        if sender.is_nil() {
            return Some(ConnectionResponseCode::Other);
        }
        if let Some(expected) = &config.password {
            if request.password() != Some(expected.as_str()) {
                return Some(ConnectionResponseCode::IncorrectPassword);
            }
        }
        if self.clients.contains_key(&sender) {
            return Some(ConnectionResponseCode::DuplicateGuid);
        }
        if self.clients.len() >= config.max_clients {
            return Some(ConnectionResponseCode::SessionFull);
        }
        None
    }
}

/// The server's shared session state.
#[derive(Debug)]
pub struct CollaborationHub {
    config: HubConfig,
    state: Mutex<HubState>,
}

impl CollaborationHub {
    /// Creates an empty session.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyFilePath`] if the configured path is
    /// blank, since no client could ever be approved.
    pub fn new(config: HubConfig) -> Result<Self, ValidationError> {
        if config.file_path.trim().is_empty() {
            return Err(ValidationError::EmptyFilePath);
        }
        Ok(Self {
            config,
            state: Mutex::new(HubState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides a handshake and, on approval, registers `sender`.
    ///
    /// Checks run in this order: shutdown, nil sender, password, duplicate
    /// identity, capacity.  The first failing check determines the rejection
    /// code.  On approval every other client is queued a
    /// [`RemoteConnection`] for the newcomer, and the newcomer is queued one
    /// for each client already present.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] if the request itself is invalid.
    pub fn evaluate_handshake(
        &self,
        sender: SessionId,
        request: &ConnectionRequest,
    ) -> Result<ConnectionResponse, HubError> {
        request.validate()?;
        let mut state = self.lock();

        if let Some(code) = state.rejection(sender, request, &self.config) {
            info!("rejecting session {sender}: {code:?}");
            return Ok(ConnectionResponse::rejected(code)?);
        }

        let snapshot: Vec<Operation> = state.history.iter().map(|(_, op)| op.clone()).collect();
        let response = ConnectionResponse::approved(self.config.file_path.clone(), snapshot)?;

        let existing: Vec<SyncPayload> = state
            .clients
            .keys()
            .map(|id| {
                SyncPayload::RemoteConnection(RemoteConnection {
                    client: ClientDescription {
                        id: *id,
                        metadata: state.metadata.get(id).map(|m| m.blob.clone()),
                    },
                })
            })
            .collect();

        if let Some(blob) = request.metadata() {
            state.store_metadata(sender, blob.to_vec());
        }
        let joined = SyncPayload::RemoteConnection(RemoteConnection {
            client: ClientDescription {
                id: sender,
                metadata: request.metadata().map(<[u8]>::to_vec),
            },
        });
        state.broadcast_notice(sender, &joined);

        let cursor = state.history.len();
        state.clients.insert(
            sender,
            ClientState {
                cursor,
                metadata_seen: 0,
                notices: existing.into(),
            },
        );
        info!(
            "approved session {sender} ({} of {} clients)",
            state.clients.len(),
            self.config.max_clients
        );
        Ok(response)
    }

    /// Applies one poll from `sender` and returns what it has not seen yet.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownSession`] if `sender` is not connected and
    /// [`HubError::Validation`] if the update carries metadata for another
    /// client, more than one entry, or an oversized blob.
    pub fn apply_update(
        &self,
        sender: SessionId,
        update: ClientUpdate,
    ) -> Result<ClientUpdate, HubError> {
        update.validate_from_client(sender)?;
        let mut state = self.lock();
        if !state.clients.contains_key(&sender) {
            return Err(HubError::UnknownSession(sender));
        }

        let (operations, metadata) = update.into_parts();
        if let Some(ops) = operations {
            debug!("session {sender} contributed {} operation(s)", ops.len());
            state.history.extend(ops.into_iter().map(|op| (sender, op)));
        }
        if let Some(blob) = metadata.and_then(|mut m| m.remove(&sender)) {
            state.store_metadata(sender, blob);
        }

        let HubState {
            history,
            metadata,
            metadata_version,
            clients,
            ..
        } = &mut *state;
        let client = clients
            .get_mut(&sender)
            .ok_or(HubError::UnknownSession(sender))?;

        let remote_ops: Vec<Operation> = history[client.cursor..]
            .iter()
            .filter(|(origin, _)| *origin != sender)
            .map(|(_, op)| op.clone())
            .collect();
        client.cursor = history.len();

        let changed: HashMap<SessionId, Vec<u8>> = metadata
            .iter()
            .filter(|(id, entry)| **id != sender && entry.version > client.metadata_seen)
            .map(|(id, entry)| (*id, entry.blob.clone()))
            .collect();
        client.metadata_seen = *metadata_version;

        Ok(ClientUpdate::new(Some(remote_ops), Some(changed))?)
    }

    /// Stores a standalone metadata push from `sender`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`CollaborationHub::apply_update`].
    pub fn store_metadata(&self, sender: SessionId, bundle: ClientMetadata) -> Result<(), HubError> {
        bundle.validate()?;
        let entries = bundle.into_entries();
        if entries.len() > 1 {
            return Err(ValidationError::TooManyMetadataEntries {
                sender,
                count: entries.len(),
            }
            .into());
        }
        if entries.keys().any(|id| *id != sender) {
            return Err(ValidationError::ForeignMetadata { sender }.into());
        }

        let mut state = self.lock();
        if !state.clients.contains_key(&sender) {
            return Err(HubError::UnknownSession(sender));
        }
        for (id, blob) in entries {
            state.store_metadata(id, blob);
        }
        Ok(())
    }

    /// Drains the presence notices queued for `sender`.
    pub fn take_notices(&self, sender: SessionId) -> Vec<SyncPayload> {
        self.lock()
            .clients
            .get_mut(&sender)
            .map(|c| c.notices.drain(..).collect())
            .unwrap_or_default()
    }

    /// Removes `sender` and queues a [`RemoteDisconnection`] for everyone
    /// else.  Returns `false` if it was not connected.
    pub fn disconnect(&self, sender: SessionId) -> bool {
        let mut state = self.lock();
        if state.clients.remove(&sender).is_none() {
            return false;
        }
        state.metadata.remove(&sender);
        if let Ok(notice) = RemoteDisconnection::new(sender) {
            state.broadcast_notice(sender, &SyncPayload::RemoteDisconnection(notice));
        }
        info!("session {sender} left ({} remaining)", state.clients.len());
        true
    }

    /// Refuses all further handshakes with `ServerShuttingDown`.
    pub fn begin_shutdown(&self) {
        self.lock().shutting_down = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_connected(&self, id: SessionId) -> bool {
        self.lock().clients.contains_key(&id)
    }

    /// Number of operations in the authoritative history.
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn requires_password(&self) -> bool {
        self.config.password.is_some()
    }

    pub fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    pub fn file_path(&self) -> &str {
        &self.config.file_path
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn hub(password: Option<&str>, max_clients: usize) -> CollaborationHub {
        CollaborationHub::new(HubConfig {
            file_path: "notes.txt".to_string(),
            password: password.map(str::to_string),
            max_clients,
        })
        .unwrap()
    }

    fn request(password: Option<&str>) -> ConnectionRequest {
        ConnectionRequest::new(password.map(str::to_string), None).unwrap()
    }

    fn op(s: &str) -> Operation {
        Operation::new(s.as_bytes().to_vec())
    }

    fn join(hub: &CollaborationHub) -> SessionId {
        let id = Uuid::new_v4();
        let response = hub.evaluate_handshake(id, &request(None)).unwrap();
        assert!(response.is_approved());
        id
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    #[test]
    fn test_new_rejects_blank_file_path() {
        let result = CollaborationHub::new(HubConfig {
            file_path: "  ".to_string(),
            password: None,
            max_clients: 4,
        });
        assert_eq!(result.unwrap_err(), ValidationError::EmptyFilePath);
    }

    #[test]
    fn test_wrong_password_is_rejected_without_payload() {
        // Arrange
        let hub = hub(Some("secret123"), 4);

        // Act
        let response = hub
            .evaluate_handshake(Uuid::new_v4(), &request(Some("secret")))
            .unwrap();

        // Assert
        assert_eq!(response.code(), ConnectionResponseCode::IncorrectPassword);
        assert!(response.file_path().is_none());
        assert!(response.operations().is_none());
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn test_missing_password_is_rejected_when_required() {
        let hub = hub(Some("secret123"), 4);
        let response = hub.evaluate_handshake(Uuid::new_v4(), &request(None)).unwrap();
        assert_eq!(response.code(), ConnectionResponseCode::IncorrectPassword);
    }

    #[test]
    fn test_correct_password_is_approved_with_file_path() {
        let hub = hub(Some("secret123"), 4);
        let response = hub
            .evaluate_handshake(Uuid::new_v4(), &request(Some("secret123")))
            .unwrap();
        assert!(response.is_approved());
        assert_eq!(response.file_path(), Some("notes.txt"));
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let hub = hub(None, 4);
        let id = join(&hub);

        let response = hub.evaluate_handshake(id, &request(None)).unwrap();

        assert_eq!(response.code(), ConnectionResponseCode::DuplicateGuid);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn test_full_session_is_rejected() {
        let hub = hub(None, 1);
        join(&hub);

        let response = hub.evaluate_handshake(Uuid::new_v4(), &request(None)).unwrap();

        assert_eq!(response.code(), ConnectionResponseCode::SessionFull);
    }

    #[test]
    fn test_nil_sender_is_rejected_as_other() {
        let hub = hub(None, 4);
        let response = hub.evaluate_handshake(Uuid::nil(), &request(None)).unwrap();
        assert_eq!(response.code(), ConnectionResponseCode::Other);
    }

    #[test]
    fn test_shutdown_takes_precedence_over_other_checks() {
        let hub = hub(Some("pw"), 4);
        hub.begin_shutdown();

        let response = hub.evaluate_handshake(Uuid::new_v4(), &request(Some("wrong"))).unwrap();

        assert_eq!(response.code(), ConnectionResponseCode::ServerShuttingDown);
    }

    #[test]
    fn test_approval_carries_full_history() {
        let hub = hub(None, 4);
        let a = join(&hub);
        hub.apply_update(a, ClientUpdate::from_client(a, vec![op("x"), op("y")], None).unwrap())
            .unwrap();

        let response = hub.evaluate_handshake(Uuid::new_v4(), &request(None)).unwrap();

        assert_eq!(response.operations(), Some(&[op("x"), op("y")][..]));
    }

    // ── Differential update ───────────────────────────────────────────────────

    #[test]
    fn test_update_returns_remote_ops_in_order_and_skips_own() {
        // Arrange
        let hub = hub(None, 4);
        let a = join(&hub);
        let b = join(&hub);
        hub.apply_update(a, ClientUpdate::from_client(a, vec![op("a1")], None).unwrap())
            .unwrap();
        hub.apply_update(a, ClientUpdate::from_client(a, vec![op("a2")], None).unwrap())
            .unwrap();

        // Act
        let response = hub
            .apply_update(b, ClientUpdate::from_client(b, vec![op("b1")], None).unwrap())
            .unwrap();

        // Assert
        assert_eq!(response.operations(), Some(&[op("a1"), op("a2")][..]));
        assert_eq!(hub.history_len(), 3);
    }

    #[test]
    fn test_second_poll_without_changes_is_unchanged() {
        let hub = hub(None, 4);
        let a = join(&hub);
        let b = join(&hub);
        hub.apply_update(a, ClientUpdate::from_client(a, vec![op("a1")], Some(vec![1])).unwrap())
            .unwrap();

        let first = hub.apply_update(b, ClientUpdate::unchanged()).unwrap();
        let second = hub.apply_update(b, ClientUpdate::unchanged()).unwrap();

        assert!(!first.is_unchanged());
        assert!(second.is_unchanged());
        assert!(second.operations().is_none());
        assert!(second.metadata().is_none());
    }

    #[test]
    fn test_metadata_is_overwritten_and_delivered_once_per_change() {
        // Arrange
        let hub = hub(None, 4);
        let a = join(&hub);
        let b = join(&hub);

        // Act
        hub.apply_update(a, ClientUpdate::from_client(a, vec![], Some(vec![1])).unwrap())
            .unwrap();
        hub.apply_update(a, ClientUpdate::from_client(a, vec![], Some(vec![2])).unwrap())
            .unwrap();
        let seen_by_b = hub.apply_update(b, ClientUpdate::unchanged()).unwrap();
        let seen_by_a = hub.apply_update(a, ClientUpdate::unchanged()).unwrap();

        // Assert
        assert_eq!(seen_by_b.metadata(), Some(&HashMap::from([(a, vec![2])])));
        assert!(seen_by_a.metadata().is_none(), "own metadata is never echoed");
    }

    #[test]
    fn test_update_with_foreign_metadata_is_rejected() {
        let hub = hub(None, 4);
        let a = join(&hub);
        let b = join(&hub);
        let forged = ClientUpdate::new(None, Some(HashMap::from([(b, vec![9])]))).unwrap();

        let result = hub.apply_update(a, forged);

        assert_eq!(
            result,
            Err(HubError::Validation(ValidationError::ForeignMetadata { sender: a }))
        );
    }

    #[test]
    fn test_update_from_unknown_session_is_rejected() {
        let hub = hub(None, 4);
        let stranger = Uuid::new_v4();
        assert_eq!(
            hub.apply_update(stranger, ClientUpdate::unchanged()),
            Err(HubError::UnknownSession(stranger))
        );
    }

    #[test]
    fn test_standalone_metadata_push_is_stored_like_update_metadata() {
        let hub = hub(None, 4);
        let a = join(&hub);
        let b = join(&hub);

        hub.store_metadata(a, ClientMetadata::single(a, vec![7]).unwrap())
            .unwrap();
        let seen_by_b = hub.apply_update(b, ClientUpdate::unchanged()).unwrap();

        assert_eq!(seen_by_b.metadata(), Some(&HashMap::from([(a, vec![7])])));
    }

    // ── Presence notices ──────────────────────────────────────────────────────

    #[test]
    fn test_join_and_leave_queue_notices_for_peers() {
        // Arrange
        let hub = hub(None, 4);
        let a = join(&hub);
        let b = Uuid::new_v4();
        let with_meta = ConnectionRequest::new(None, Some(b"blue".to_vec())).unwrap();

        // Act
        hub.evaluate_handshake(b, &with_meta).unwrap();
        let after_join = hub.take_notices(a);
        hub.disconnect(b);
        let after_leave = hub.take_notices(a);

        // Assert
        assert_eq!(
            after_join,
            vec![SyncPayload::RemoteConnection(RemoteConnection {
                client: ClientDescription {
                    id: b,
                    metadata: Some(b"blue".to_vec()),
                },
            })]
        );
        assert_eq!(
            after_leave,
            vec![SyncPayload::RemoteDisconnection(RemoteDisconnection::new(b).unwrap())]
        );
        assert!(hub.take_notices(a).is_empty(), "notices are drained once");
    }

    #[test]
    fn test_newcomer_is_told_about_existing_clients() {
        let hub = hub(None, 4);
        let a = join(&hub);
        let b = join(&hub);

        let notices = hub.take_notices(b);

        assert_eq!(notices.len(), 1);
        assert!(matches!(
            &notices[0],
            SyncPayload::RemoteConnection(rc) if rc.client.id == a
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent_and_frees_capacity() {
        let hub = hub(None, 1);
        let a = join(&hub);

        assert!(hub.disconnect(a));
        assert!(!hub.disconnect(a));
        assert_eq!(hub.client_count(), 0);
        assert!(hub
            .evaluate_handshake(Uuid::new_v4(), &request(None))
            .unwrap()
            .is_approved());
    }
}
