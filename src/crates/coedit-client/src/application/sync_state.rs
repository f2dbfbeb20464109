//! Client-side bookkeeping for the pull cycle.
//!
//! - [`OutboundChanges`] buffers local operations and the latest own metadata
//!   between two polls and turns them into one `ClientUpdate`.
//! - [`PeerDirectory`] mirrors what the server has told this client about its
//!   peers and converts each server message into [`SessionEvent`]s.
//!
//! Absence is never "clear": a server update without metadata leaves every
//! cached blob untouched.

use std::collections::HashMap;

use coedit_core::protocol::messages::MAX_METADATA_SIZE;
use coedit_core::{ClientUpdate, Operation, SessionId, SyncPayload, ValidationError};

/// Something the session learned about its peers or its own connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerJoined {
        id: SessionId,
        metadata: Option<Vec<u8>>,
    },
    PeerLeft(SessionId),
    MetadataChanged {
        id: SessionId,
        metadata: Vec<u8>,
    },
    /// The server closed the connection.
    Disconnected,
}

/// Local changes waiting for the next poll.
#[derive(Debug, Default)]
pub struct OutboundChanges {
    operations: Vec<Operation>,
    metadata: Option<Vec<u8>>,
}

impl OutboundChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Replaces the pending own-metadata blob.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MetadataTooLarge`] immediately, before
    /// anything is queued.
    pub fn set_metadata(&mut self, blob: Vec<u8>) -> Result<(), ValidationError> {
        if blob.len() >= MAX_METADATA_SIZE {
            return Err(ValidationError::MetadataTooLarge {
                size: blob.len(),
                max: MAX_METADATA_SIZE,
            });
        }
        self.metadata = Some(blob);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.metadata.is_none()
    }

    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    /// Drains the buffer into the update `sender` sends next.  An empty
    /// buffer yields [`ClientUpdate::unchanged`].
    pub fn take_update(&mut self, sender: SessionId) -> Result<ClientUpdate, ValidationError> {
        let operations = std::mem::take(&mut self.operations);
        let metadata = self.metadata.take();
        ClientUpdate::from_client(sender, operations, metadata)
    }
}

/// What this client knows about the other clients in the session.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<SessionId, Option<Vec<u8>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a presence notice.  Returns `None` for payloads that are not
    /// notices.
    pub fn apply_notice(&mut self, payload: &SyncPayload) -> Option<SessionEvent> {
        match payload {
            SyncPayload::RemoteConnection(rc) => {
                let id = rc.client.id;
                self.peers.insert(id, rc.client.metadata.clone());
                Some(SessionEvent::PeerJoined {
                    id,
                    metadata: rc.client.metadata.clone(),
                })
            }
            SyncPayload::RemoteDisconnection(rd) => {
                self.peers.remove(&rd.id());
                Some(SessionEvent::PeerLeft(rd.id()))
            }
            _ => None,
        }
    }

    /// Merges the metadata of a server update.  Only entries that actually
    /// differ from the cache produce events.
    pub fn apply_metadata(&mut self, update: &ClientUpdate) -> Vec<SessionEvent> {
        let Some(changed) = update.metadata() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for (id, blob) in changed {
            let slot = self.peers.entry(*id).or_default();
            if slot.as_ref() != Some(blob) {
                *slot = Some(blob.clone());
                events.push(SessionEvent::MetadataChanged {
                    id: *id,
                    metadata: blob.clone(),
                });
            }
        }
        events
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn metadata(&self, id: SessionId) -> Option<&[u8]> {
        self.peers.get(&id).and_then(|m| m.as_deref())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
