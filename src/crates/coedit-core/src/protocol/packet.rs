//! The atomic wire unit.

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::{PayloadType, SessionId};

/// One fragment of a logical message.
///
/// All fragments of a sequence share `sender`, `sequence_index`,
/// `sequence_length` and `payload_type`; their offsets are a permutation of
/// `0..sequence_length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Session that produced the sequence.
    pub sender: SessionId,
    /// Unique per sender, monotonically increasing.
    pub sequence_index: u64,
    /// Number of fragments in this sequence (at least 1).
    pub sequence_length: u32,
    /// Position of this fragment, below `sequence_length`.
    pub sequence_offset: u32,
    /// Raw [`PayloadType`] tag, kept as an integer for wire compatibility.
    pub payload_type: u32,
    /// This fragment's share of the payload, or `None` when the whole
    /// message has no body.
    pub payload: Option<Vec<u8>>,
}

impl Packet {
    /// Resolves the raw tag into a known [`PayloadType`].
    pub fn kind(&self) -> Result<PayloadType, ProtocolError> {
        PayloadType::try_from(self.payload_type)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}
