//! Discovery datagram broadcast by servers.
//!
//! One datagram is one complete message, so there is no length-prefix
//! framing.  All multi-byte integers are big-endian:
//!
//! ```text
//! [magic:4 "CoEd"][version:1][id:16][port:2][requires_password:1]
//! [client_count:2][max_clients:2][name_len:2][name:N]
//! ```
//!
//! The encoded size never exceeds [`MAX_ANNOUNCE_DATAGRAM`], which keeps the
//! datagram well under any path MTU.

use crate::protocol::codec::{
    read_length_prefixed_string, read_u16, read_uuid, require_len, write_length_prefixed_string,
    ProtocolError,
};
use crate::protocol::messages::{SessionId, ValidationError};

/// Identifies a coedit announce among other broadcast traffic.
pub const ANNOUNCE_MAGIC: [u8; 4] = *b"CoEd";

/// Layout version of the announce datagram.
pub const ANNOUNCE_VERSION: u8 = 0x01;

/// Upper bound on the encoded datagram size.
pub const MAX_ANNOUNCE_DATAGRAM: usize = 512;

/// Lowest port a server may announce.
pub const MIN_ANNOUNCE_PORT: u16 = 1024;

const FIXED_SIZE: usize = 4 + 1 + 16 + 2 + 1 + 2 + 2 + 2;

/// Longest server name, in bytes, that fits in one datagram.
pub const MAX_SERVER_NAME_LEN: usize = MAX_ANNOUNCE_DATAGRAM - FIXED_SIZE;

/// A server's presence advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub id: SessionId,
    pub name: String,
    pub port: u16,
    pub requires_password: bool,
    pub client_count: u16,
    pub max_clients: u16,
}

impl Announce {
    /// Builds an announce, trimming the name and truncating it (on a
    /// character boundary) to [`MAX_SERVER_NAME_LEN`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NilSessionId`] or
    /// [`ValidationError::PrivilegedPort`].
    pub fn new(
        id: SessionId,
        name: &str,
        port: u16,
        requires_password: bool,
        client_count: u16,
        max_clients: u16,
    ) -> Result<Self, ValidationError> {
        let announce = Self {
            id,
            name: truncate_name(name.trim()).to_string(),
            port,
            requires_password,
            client_count,
            max_clients,
        };
        announce.validate()?;
        Ok(announce)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_nil() {
            return Err(ValidationError::NilSessionId);
        }
        if self.port < MIN_ANNOUNCE_PORT {
            return Err(ValidationError::PrivilegedPort(self.port));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = truncate_name(&self.name);
        let mut buf = Vec::with_capacity(FIXED_SIZE + name.len());
        buf.extend_from_slice(&ANNOUNCE_MAGIC);
        buf.push(ANNOUNCE_VERSION);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.push(if self.requires_password { 0x01 } else { 0x00 });
        buf.extend_from_slice(&self.client_count.to_be_bytes());
        buf.extend_from_slice(&self.max_clients.to_be_bytes());
        write_length_prefixed_string(&mut buf, name);
        buf
    }

    /// Parses and validates one datagram.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedDatagram`] for foreign or truncated
    /// data and [`ProtocolError::InvalidPayload`] for a nil id or a
    /// privileged port.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        require_len(datagram, FIXED_SIZE, "Announce")?;
        if datagram[0..4] != ANNOUNCE_MAGIC {
            return Err(ProtocolError::MalformedDatagram("bad magic".to_string()));
        }
        if datagram[4] != ANNOUNCE_VERSION {
            return Err(ProtocolError::MalformedDatagram(format!(
                "unsupported announce version {}",
                datagram[4]
            )));
        }
        let id = read_uuid(datagram, 5)?;
        let port = read_u16(datagram, 21)?;
        let requires_password = datagram[23] != 0;
        let client_count = read_u16(datagram, 24)?;
        let max_clients = read_u16(datagram, 26)?;
        let (name, _) = read_length_prefixed_string(datagram, 28)?;

        let announce = Self {
            id,
            name: name.trim().to_string(),
            port,
            requires_password,
            client_count,
            max_clients,
        };
        announce.validate()?;
        Ok(announce)
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_SERVER_NAME_LEN {
        return name;
    }
    let mut end = MAX_SERVER_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
