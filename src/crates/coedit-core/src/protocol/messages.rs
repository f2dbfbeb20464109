//! All coedit synchronisation payload types.
//!
//! A payload is the body of one logical message.  It is serialised with
//! `bincode`, split into fragments by the packet sequencer, and tagged on the
//! wire with its [`PayloadType`].
//!
//! # Absent versus empty
//!
//! Several fields are `Option<Vec<_>>` or `Option<HashMap<_, _>>`.  `None`
//! means "no new information" and never "clear your copy".  Constructors
//! normalise an empty-but-present collection to `None` so the two cannot be
//! confused downstream.
//!
//! # Validation
//!
//! Every type with a size or shape constraint exposes a fallible constructor
//! and a `validate` method.  Constructors reject bad values before anything is
//! sent; `validate` is re-run on every decoded payload because deserialisation
//! bypasses the constructors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::codec::{deserialize_body, serialize_body, ProtocolError};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Exclusive upper bound, in bytes, for a single client metadata blob.
///
/// A blob of exactly this size is rejected.
pub const MAX_METADATA_SIZE: usize = 1024;

/// Maximum size, in bytes, of the password proof in a [`ConnectionRequest`].
pub const MAX_PASSWORD_SIZE: usize = 256;

/// Opaque 128-bit identifier of one client (or server) session.
pub type SessionId = Uuid;

// ── Validation errors ─────────────────────────────────────────────────────────

/// Local construction faults.  These are caller bugs and are raised before
/// anything reaches the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("metadata blob of {size} bytes is not below the {max}-byte cap")]
    MetadataTooLarge { size: usize, max: usize },

    #[error("password of {size} bytes exceeds the {max}-byte cap")]
    PasswordTooLarge { size: usize, max: usize },

    #[error("an approved connection response requires a non-empty file path")]
    EmptyFilePath,

    #[error("Approved is not a rejection code")]
    ApprovedIsNotRejection,

    #[error("response code {0:?} is inconsistent with the response contents")]
    InconsistentResponse(ConnectionResponseCode),

    #[error("session id must not be nil")]
    NilSessionId,

    #[error("client update from {sender} carries metadata for another session")]
    ForeignMetadata { sender: SessionId },

    #[error("client update from {sender} carries {count} metadata entries, at most one allowed")]
    TooManyMetadataEntries { sender: SessionId, count: usize },

    #[error("announced port {0} is below 1024")]
    PrivilegedPort(u16),
}

fn check_metadata(blob: &[u8]) -> Result<(), ValidationError> {
    if blob.len() >= MAX_METADATA_SIZE {
        return Err(ValidationError::MetadataTooLarge {
            size: blob.len(),
            max: MAX_METADATA_SIZE,
        });
    }
    Ok(())
}

// ── Payload type tags ─────────────────────────────────────────────────────────

/// Stable wire tag for every message kind.
///
/// Values are part of the protocol and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum PayloadType {
    // Synchronisation (0x00–0x0F)
    ClientUpdate = 0x01,
    ClientMetadata = 0x02,
    // Connection control (0x10–0x1F)
    ConnectionRequest = 0x10,
    ConnectionResponse = 0x11,
    DisconnectionRequest = 0x12,
    // Presence notices (0x20–0x2F)
    RemoteConnection = 0x20,
    RemoteDisconnection = 0x21,
}

impl TryFrom<u32> for PayloadType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(PayloadType::ClientUpdate),
            0x02 => Ok(PayloadType::ClientMetadata),
            0x10 => Ok(PayloadType::ConnectionRequest),
            0x11 => Ok(PayloadType::ConnectionResponse),
            0x12 => Ok(PayloadType::DisconnectionRequest),
            0x20 => Ok(PayloadType::RemoteConnection),
            0x21 => Ok(PayloadType::RemoteDisconnection),
            other => Err(ProtocolError::UnknownPayloadType(other)),
        }
    }
}

impl From<PayloadType> for u32 {
    fn from(value: PayloadType) -> Self {
        value as u32
    }
}

// ── Operations ────────────────────────────────────────────────────────────────

/// One atomic edit produced by the synchronisation engine.
///
/// This crate never looks inside an operation; it only moves the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation(Vec<u8>);

impl Operation {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// First message a client sends on a fresh connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    password: Option<String>,
    metadata: Option<Vec<u8>>,
}

impl ConnectionRequest {
    /// Builds a request, checking the password and metadata caps.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::PasswordTooLarge`] or
    /// [`ValidationError::MetadataTooLarge`].
    pub fn new(password: Option<String>, metadata: Option<Vec<u8>>) -> Result<Self, ValidationError> {
        let request = Self { password, metadata };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(password) = &self.password {
            if password.len() > MAX_PASSWORD_SIZE {
                return Err(ValidationError::PasswordTooLarge {
                    size: password.len(),
                    max: MAX_PASSWORD_SIZE,
                });
            }
        }
        if let Some(metadata) = &self.metadata {
            check_metadata(metadata)?;
        }
        Ok(())
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn metadata(&self) -> Option<&[u8]> {
        self.metadata.as_deref()
    }
}

/// Outcome code of a handshake.  Rejections are ordinary values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionResponseCode {
    Approved = 0,
    IncorrectPassword = 1,
    ServerShuttingDown = 2,
    SessionFull = 3,
    DuplicateGuid = 4,
    Other = 5,
}

/// The server's single answer to a [`ConnectionRequest`].
///
/// An approved response carries the authoritative file path and the full
/// operation history; a rejection carries neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    code: ConnectionResponseCode,
    file_path: Option<String>,
    operations: Option<Vec<Operation>>,
}

impl ConnectionResponse {
    /// Builds an approval.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyFilePath`] if `file_path` is blank.
    pub fn approved(
        file_path: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Result<Self, ValidationError> {
        let file_path = file_path.into();
        if file_path.trim().is_empty() {
            return Err(ValidationError::EmptyFilePath);
        }
        Ok(Self {
            code: ConnectionResponseCode::Approved,
            file_path: Some(file_path),
            operations: Some(operations),
        })
    }

    /// Builds a rejection.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ApprovedIsNotRejection`] if `code` is
    /// [`ConnectionResponseCode::Approved`].
    pub fn rejected(code: ConnectionResponseCode) -> Result<Self, ValidationError> {
        if code == ConnectionResponseCode::Approved {
            return Err(ValidationError::ApprovedIsNotRejection);
        }
        Ok(Self {
            code,
            file_path: None,
            operations: None,
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match (self.code, &self.file_path, &self.operations) {
            (ConnectionResponseCode::Approved, Some(path), Some(_)) => {
                if path.trim().is_empty() {
                    Err(ValidationError::EmptyFilePath)
                } else {
                    Ok(())
                }
            }
            (ConnectionResponseCode::Approved, None, _) => Err(ValidationError::EmptyFilePath),
            (code @ ConnectionResponseCode::Approved, Some(_), None) => {
                Err(ValidationError::InconsistentResponse(code))
            }
            (_, None, None) => Ok(()),
            (code, _, _) => Err(ValidationError::InconsistentResponse(code)),
        }
    }

    pub fn code(&self) -> ConnectionResponseCode {
        self.code
    }

    pub fn is_approved(&self) -> bool {
        self.code == ConnectionResponseCode::Approved
    }

    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }

    pub fn operations(&self) -> Option<&[Operation]> {
        self.operations.as_deref()
    }

    /// Consumes the response, returning the file path and history of an
    /// approval, or `None` for a rejection.
    pub fn into_approval(self) -> Option<(String, Vec<Operation>)> {
        match (self.code, self.file_path, self.operations) {
            (ConnectionResponseCode::Approved, Some(path), Some(ops)) => Some((path, ops)),
            _ => None,
        }
    }
}

// ── Differential update ───────────────────────────────────────────────────────

/// One pull-cycle message, in either direction.
///
/// From a client: its new local operations and at most one metadata entry
/// (its own).  From the server: the remote operations applied since the
/// client's last poll, in authoritative order, and every other client's
/// metadata that changed since then.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUpdate {
    operations: Option<Vec<Operation>>,
    metadata: Option<HashMap<SessionId, Vec<u8>>>,
}

impl ClientUpdate {
    /// Builds an update, normalising empty collections to absent.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MetadataTooLarge`] if any blob is at or
    /// above [`MAX_METADATA_SIZE`].
    pub fn new(
        operations: Option<Vec<Operation>>,
        metadata: Option<HashMap<SessionId, Vec<u8>>>,
    ) -> Result<Self, ValidationError> {
        let update = Self {
            operations: operations.filter(|ops| !ops.is_empty()),
            metadata: metadata.filter(|m| !m.is_empty()),
        };
        update.validate()?;
        Ok(update)
    }

    /// Builds the update a client sends: new local operations plus, when it
    /// changed, the sender's own metadata.
    pub fn from_client(
        sender: SessionId,
        operations: Vec<Operation>,
        own_metadata: Option<Vec<u8>>,
    ) -> Result<Self, ValidationError> {
        let metadata = own_metadata.map(|blob| HashMap::from([(sender, blob)]));
        Self::new(Some(operations), metadata)
    }

    /// An update carrying nothing: "no change, send me anything new".
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(metadata) = &self.metadata {
            for blob in metadata.values() {
                check_metadata(blob)?;
            }
        }
        Ok(())
    }

    /// Additional checks for an update received from client `sender`.
    pub fn validate_from_client(&self, sender: SessionId) -> Result<(), ValidationError> {
        self.validate()?;
        if let Some(metadata) = &self.metadata {
            if metadata.len() > 1 {
                return Err(ValidationError::TooManyMetadataEntries {
                    sender,
                    count: metadata.len(),
                });
            }
            if metadata.keys().any(|id| *id != sender) {
                return Err(ValidationError::ForeignMetadata { sender });
            }
        }
        Ok(())
    }

    pub fn is_unchanged(&self) -> bool {
        self.operations.is_none() && self.metadata.is_none()
    }

    pub fn operations(&self) -> Option<&[Operation]> {
        self.operations.as_deref()
    }

    pub fn metadata(&self) -> Option<&HashMap<SessionId, Vec<u8>>> {
        self.metadata.as_ref()
    }

    pub fn into_parts(self) -> (Option<Vec<Operation>>, Option<HashMap<SessionId, Vec<u8>>>) {
        (self.operations, self.metadata)
    }
}

/// A standalone metadata bundle, outside of the pull cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    entries: HashMap<SessionId, Vec<u8>>,
}

impl ClientMetadata {
    pub fn new(entries: HashMap<SessionId, Vec<u8>>) -> Result<Self, ValidationError> {
        let bundle = Self { entries };
        bundle.validate()?;
        Ok(bundle)
    }

    /// A bundle holding only `sender`'s own blob.
    pub fn single(sender: SessionId, blob: Vec<u8>) -> Result<Self, ValidationError> {
        Self::new(HashMap::from([(sender, blob)]))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.entries.values().try_for_each(|blob| check_metadata(blob))
    }

    pub fn entries(&self) -> &HashMap<SessionId, Vec<u8>> {
        &self.entries
    }

    pub fn into_entries(self) -> HashMap<SessionId, Vec<u8>> {
        self.entries
    }
}

// ── Control notifications ─────────────────────────────────────────────────────

/// Sent by a client that is leaving.  Carries no body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectionRequest;

/// Description of a client as advertised to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescription {
    pub id: SessionId,
    pub metadata: Option<Vec<u8>>,
}

/// Server → client: a new peer joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConnection {
    pub client: ClientDescription,
}

impl RemoteConnection {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.client.id.is_nil() {
            return Err(ValidationError::NilSessionId);
        }
        match &self.client.metadata {
            Some(blob) => check_metadata(blob),
            None => Ok(()),
        }
    }
}

/// Server → client: a peer left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDisconnection {
    id: SessionId,
}

impl RemoteDisconnection {
    /// # Errors
    ///
    /// Returns [`ValidationError::NilSessionId`] for the nil UUID.
    pub fn new(id: SessionId) -> Result<Self, ValidationError> {
        let notice = Self { id };
        notice.validate()?;
        Ok(notice)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_nil() {
            Err(ValidationError::NilSessionId)
        } else {
            Ok(())
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

// ── Tagged union ──────────────────────────────────────────────────────────────

/// Every message body that can travel inside a packet sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPayload {
    Update(ClientUpdate),
    Metadata(ClientMetadata),
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    Disconnection(DisconnectionRequest),
    RemoteConnection(RemoteConnection),
    RemoteDisconnection(RemoteDisconnection),
}

impl SyncPayload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            SyncPayload::Update(_) => PayloadType::ClientUpdate,
            SyncPayload::Metadata(_) => PayloadType::ClientMetadata,
            SyncPayload::ConnectionRequest(_) => PayloadType::ConnectionRequest,
            SyncPayload::ConnectionResponse(_) => PayloadType::ConnectionResponse,
            SyncPayload::Disconnection(_) => PayloadType::DisconnectionRequest,
            SyncPayload::RemoteConnection(_) => PayloadType::RemoteConnection,
            SyncPayload::RemoteDisconnection(_) => PayloadType::RemoteDisconnection,
        }
    }

    /// Serialises the body.  A disconnection request has no body and encodes
    /// to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if `bincode` fails.
    pub fn encode(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let bytes = match self {
            SyncPayload::Update(m) => serialize_body(m)?,
            SyncPayload::Metadata(m) => serialize_body(m)?,
            SyncPayload::ConnectionRequest(m) => serialize_body(m)?,
            SyncPayload::ConnectionResponse(m) => serialize_body(m)?,
            SyncPayload::Disconnection(_) => return Ok(None),
            SyncPayload::RemoteConnection(m) => serialize_body(m)?,
            SyncPayload::RemoteDisconnection(m) => serialize_body(m)?,
        };
        Ok(Some(bytes))
    }

    /// Deserialises and validates a body of kind `payload_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingPayload`] when a kind that needs a
    /// body arrives without one, [`ProtocolError::Serialization`] for
    /// undecodable bytes, and [`ProtocolError::InvalidPayload`] when the
    /// decoded value violates its own constraints.
    pub fn decode(payload_type: PayloadType, body: Option<&[u8]>) -> Result<Self, ProtocolError> {
        if payload_type == PayloadType::DisconnectionRequest {
            return Ok(SyncPayload::Disconnection(DisconnectionRequest));
        }
        let body = body.ok_or(ProtocolError::MissingPayload(payload_type))?;
        let payload = match payload_type {
            PayloadType::ClientUpdate => SyncPayload::Update(deserialize_body(body)?),
            PayloadType::ClientMetadata => SyncPayload::Metadata(deserialize_body(body)?),
            PayloadType::ConnectionRequest => {
                SyncPayload::ConnectionRequest(deserialize_body(body)?)
            }
            PayloadType::ConnectionResponse => {
                SyncPayload::ConnectionResponse(deserialize_body(body)?)
            }
            PayloadType::RemoteConnection => SyncPayload::RemoteConnection(deserialize_body(body)?),
            PayloadType::RemoteDisconnection => {
                SyncPayload::RemoteDisconnection(deserialize_body(body)?)
            }
            PayloadType::DisconnectionRequest => SyncPayload::Disconnection(DisconnectionRequest),
        };
        payload.validate().map_err(ProtocolError::InvalidPayload)?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            SyncPayload::Update(m) => m.validate(),
            SyncPayload::Metadata(m) => m.validate(),
            SyncPayload::ConnectionRequest(m) => m.validate(),
            SyncPayload::ConnectionResponse(m) => m.validate(),
            SyncPayload::Disconnection(_) => Ok(()),
            SyncPayload::RemoteConnection(m) => m.validate(),
            SyncPayload::RemoteDisconnection(m) => m.validate(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
