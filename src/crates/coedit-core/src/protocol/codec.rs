//! Frame codec for coedit packets.
//!
//! Wire format on a TCP connection, one frame per packet:
//! ```text
//! [frame_len:4 (i32, little-endian)][frame_len bytes: bincode-encoded Packet]
//! ```
//! The length prefix is signed; a negative value or one above
//! [`MAX_FRAME_SIZE`] is rejected before any buffer is allocated.
//!
//! This module also owns [`ProtocolError`] and the small big-endian helpers
//! used by the discovery datagram codec.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::messages::{PayloadType, ValidationError};
use crate::protocol::packet::Packet;

/// Size of the frame length prefix in bytes.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Largest serialised packet accepted by [`frame_body_len`].
///
/// Fragments are capped well below this, so anything larger is either a
/// corrupt prefix or a hostile peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Ways a packet sequence can be malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceViolation {
    ZeroLength,
    LengthTooLarge { length: u32, max: u32 },
    OffsetOutOfRange { offset: u32, length: u32 },
    DuplicateOffset(u32),
    IndexMismatch { expected: u64, actual: u64 },
    TypeMismatch { expected: u32, actual: u32 },
    LengthMismatch { expected: u32, actual: u32 },
    SenderMismatch { expected: Uuid, actual: Uuid },
}

impl std::fmt::Display for SequenceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequenceViolation::ZeroLength => write!(f, "sequence length is zero"),
            SequenceViolation::LengthTooLarge { length, max } => {
                write!(f, "sequence length {length} exceeds the maximum of {max}")
            }
            SequenceViolation::OffsetOutOfRange { offset, length } => {
                write!(f, "offset {offset} is outside a sequence of length {length}")
            }
            SequenceViolation::DuplicateOffset(offset) => {
                write!(f, "offset {offset} received twice")
            }
            SequenceViolation::IndexMismatch { expected, actual } => {
                write!(f, "sequence index {actual} does not match {expected}")
            }
            SequenceViolation::TypeMismatch { expected, actual } => {
                write!(f, "payload type 0x{actual:02X} does not match 0x{expected:02X}")
            }
            SequenceViolation::LengthMismatch { expected, actual } => {
                write!(f, "sequence length {actual} does not match {expected}")
            }
            SequenceViolation::SenderMismatch { expected, actual } => {
                write!(f, "sender {actual} does not match {expected}")
            }
        }
    }
}

/// Errors that can occur while encoding, decoding, or reassembling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The frame length prefix is negative.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i32),

    /// The frame length prefix exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// A fragment broke the sequence invariants.
    #[error("invalid packet sequence: {0}")]
    InvalidSequence(SequenceViolation),

    /// The payload type tag is not a recognised value.
    #[error("unknown payload type: 0x{0:02X}")]
    UnknownPayloadType(u32),

    /// A payload kind that requires a body arrived without one.
    #[error("{0:?} sequence carried no payload")]
    MissingPayload(PayloadType),

    /// `bincode` could not encode or decode a value.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A decoded payload violated its own constraints.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] ValidationError),

    /// A discovery datagram could not be parsed.
    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),
}

impl From<SequenceViolation> for ProtocolError {
    fn from(violation: SequenceViolation) -> Self {
        ProtocolError::InvalidSequence(violation)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Serialises `packet` and prepends its length, producing one complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if encoding fails, or
/// [`ProtocolError::FrameTooLarge`] if the packet would not be accepted by a
/// peer.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let body = serialize_body(packet)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as i32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Interprets a length prefix, returning the body size to read next.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidFrameLength`] for a negative prefix and
/// [`ProtocolError::FrameTooLarge`] above [`MAX_FRAME_SIZE`].
pub fn frame_body_len(prefix: [u8; FRAME_PREFIX_SIZE]) -> Result<usize, ProtocolError> {
    let declared = i32::from_le_bytes(prefix);
    if declared < 0 {
        return Err(ProtocolError::InvalidFrameLength(declared));
    }
    let size = declared as usize;
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(size)
}

/// Decodes the body of one frame back into a [`Packet`].
pub fn decode_packet(body: &[u8]) -> Result<Packet, ProtocolError> {
    deserialize_body(body)
}

/// Decodes one complete frame (prefix included) from the start of `bytes`.
///
/// Returns the packet and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), ProtocolError> {
    if bytes.len() < FRAME_PREFIX_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_PREFIX_SIZE,
            available: bytes.len(),
        });
    }
    let mut prefix = [0u8; FRAME_PREFIX_SIZE];
    prefix.copy_from_slice(&bytes[..FRAME_PREFIX_SIZE]);
    let body_len = frame_body_len(prefix)?;
    let total = FRAME_PREFIX_SIZE + body_len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }
    let packet = decode_packet(&bytes[FRAME_PREFIX_SIZE..total])?;
    Ok((packet, total))
}

// ── bincode helpers ───────────────────────────────────────────────────────────

pub(crate) fn serialize_body<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub(crate) fn deserialize_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

// ── Datagram helpers ──────────────────────────────────────────────────────────

pub(crate) fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedDatagram(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Result<u16, ProtocolError> {
    require_len(buf, offset + 2, "u16")?;
    Ok(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

pub(crate) fn read_uuid(buf: &[u8], offset: usize) -> Result<Uuid, ProtocolError> {
    require_len(buf, offset + 16, "uuid")?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[offset..offset + 16]);
    Ok(Uuid::from_bytes(bytes))
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
pub(crate) fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize) as u16;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&bytes[..len as usize]);
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
pub(crate) fn read_length_prefixed_string(
    buf: &[u8],
    offset: usize,
) -> Result<(String, usize), ProtocolError> {
    let len = read_u16(buf, offset)? as usize;
    let start = offset + 2;
    require_len(buf, start + len, "string")?;
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedDatagram(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
