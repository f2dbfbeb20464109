//! Packet sequencer: fragmentation on send, reassembly on receive.
//!
//! # Sending
//!
//! [`PacketSequencer::fragment`] splits a payload into chunks of at most
//! `fragment_size` bytes and stamps every chunk with the same sender,
//! sequence index, and payload type.  An absent payload still produces
//! exactly one packet so the receiver sees the "no payload" signal.
//!
//! # Receiving
//!
//! [`SequenceAssembler::push`] accepts fragments in any order.  The first
//! fragment fixes the sequence identity and allocates one slot per fragment;
//! every later fragment must match that identity and fill an empty slot.
//! Any violation is returned as [`ProtocolError::InvalidSequence`] and leaves
//! the in-progress state untouched.
//!
//! ```text
//!   payload (10 000 bytes)
//!   ├─ Packet{offset 0, len 3, 3900 bytes}
//!   ├─ Packet{offset 1, len 3, 3900 bytes}
//!   └─ Packet{offset 2, len 3, 2200 bytes}
//! ```

use crate::protocol::codec::{ProtocolError, SequenceViolation};
use crate::protocol::messages::{PayloadType, SessionId, SyncPayload};
use crate::protocol::packet::Packet;
use crate::protocol::sequence::SequenceCounter;

/// Default upper bound for one fragment's payload, in bytes.
///
/// Chosen so a fragment plus its packet header stays below 4 KiB, the small
/// socket-buffer threshold common to TCP and UDP stacks.
pub const MAX_FRAGMENT_SIZE: usize = 3900;

/// Largest fragment count a sequence may declare.
///
/// The assembler allocates one slot per declared fragment before any data
/// arrives, so the header value is capped here.  At [`MAX_FRAGMENT_SIZE`]
/// this admits payloads of roughly 250 MB.
pub const MAX_SEQUENCE_LENGTH: u32 = 65_536;

/// Splits outgoing payloads into packets for one sending identity.
#[derive(Debug)]
pub struct PacketSequencer {
    sender: SessionId,
    counter: SequenceCounter,
    fragment_size: usize,
}

impl PacketSequencer {
    /// Creates a sequencer using [`MAX_FRAGMENT_SIZE`].
    pub fn new(sender: SessionId) -> Self {
        Self::with_fragment_size(sender, MAX_FRAGMENT_SIZE)
    }

    /// Creates a sequencer with a custom fragment size.
    ///
    /// # Panics
    ///
    /// Panics if `fragment_size` is zero.
    pub fn with_fragment_size(sender: SessionId, fragment_size: usize) -> Self {
        assert!(fragment_size > 0, "fragment size must be positive");
        Self {
            sender,
            counter: SequenceCounter::new(),
            fragment_size,
        }
    }

    pub fn sender(&self) -> SessionId {
        self.sender
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Splits `payload` into one or more packets sharing a fresh sequence index.
    pub fn fragment(&self, payload_type: PayloadType, payload: Option<&[u8]>) -> Vec<Packet> {
        let sequence_index = self.counter.next();
        let chunks: Vec<Option<Vec<u8>>> = match payload {
            None => vec![None],
            Some([]) => vec![Some(Vec::new())],
            Some(bytes) => bytes
                .chunks(self.fragment_size)
                .map(|chunk| Some(chunk.to_vec()))
                .collect(),
        };
        let sequence_length = chunks.len() as u32;

        chunks
            .into_iter()
            .enumerate()
            .map(|(offset, chunk)| Packet {
                sender: self.sender,
                sequence_index,
                sequence_length,
                sequence_offset: offset as u32,
                payload_type: payload_type.into(),
                payload: chunk,
            })
            .collect()
    }

    /// Serialises `payload` and fragments the resulting bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if encoding fails and
    /// [`ProtocolError::InvalidSequence`] if the body would need more than
    /// [`MAX_SEQUENCE_LENGTH`] fragments.
    pub fn fragment_payload(&self, payload: &SyncPayload) -> Result<Vec<Packet>, ProtocolError> {
        let body = payload.encode()?;
        let fragments = body
            .as_ref()
            .map_or(1, |bytes| bytes.len().div_ceil(self.fragment_size).max(1));
        if fragments > MAX_SEQUENCE_LENGTH as usize {
            return Err(SequenceViolation::LengthTooLarge {
                length: u32::try_from(fragments).unwrap_or(u32::MAX),
                max: MAX_SEQUENCE_LENGTH,
            }
            .into());
        }
        Ok(self.fragment(payload.payload_type(), body.as_deref()))
    }
}

/// A fully reassembled logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledSequence {
    pub sender: SessionId,
    pub sequence_index: u64,
    pub payload_type: u32,
    /// Fragment payloads in offset order, or `None` if every fragment was
    /// absent.
    pub payload: Option<Vec<u8>>,
}

impl ReassembledSequence {
    /// Decodes the assembled bytes into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for an unknown tag or an undecodable body.
    pub fn decode(&self) -> Result<SyncPayload, ProtocolError> {
        let kind = PayloadType::try_from(self.payload_type)?;
        SyncPayload::decode(kind, self.payload.as_deref())
    }
}

#[derive(Debug)]
struct InProgress {
    sender: SessionId,
    sequence_index: u64,
    sequence_length: u32,
    payload_type: u32,
    /// Outer `Option`: slot filled?  Inner `Option`: fragment payload present?
    slots: Vec<Option<Option<Vec<u8>>>>,
    filled: usize,
}

impl InProgress {
    fn check(&self, packet: &Packet) -> Result<(), SequenceViolation> {
        if packet.sequence_index != self.sequence_index {
            return Err(SequenceViolation::IndexMismatch {
                expected: self.sequence_index,
                actual: packet.sequence_index,
            });
        }
        if packet.sender != self.sender {
            return Err(SequenceViolation::SenderMismatch {
                expected: self.sender,
                actual: packet.sender,
            });
        }
        if packet.payload_type != self.payload_type {
            return Err(SequenceViolation::TypeMismatch {
                expected: self.payload_type,
                actual: packet.payload_type,
            });
        }
        if packet.sequence_length != self.sequence_length {
            return Err(SequenceViolation::LengthMismatch {
                expected: self.sequence_length,
                actual: packet.sequence_length,
            });
        }
        check_offset(packet)?;
        if self.slots[packet.sequence_offset as usize].is_some() {
            return Err(SequenceViolation::DuplicateOffset(packet.sequence_offset));
        }
        Ok(())
    }

    fn finish(self) -> ReassembledSequence {
        let fragments: Vec<Option<Vec<u8>>> = self.slots.into_iter().flatten().collect();
        let payload = if fragments.iter().all(Option::is_none) {
            None
        } else {
            let total: usize = fragments.iter().flatten().map(Vec::len).sum();
            let mut joined = Vec::with_capacity(total);
            for fragment in fragments.iter().flatten() {
                joined.extend_from_slice(fragment);
            }
            Some(joined)
        };
        ReassembledSequence {
            sender: self.sender,
            sequence_index: self.sequence_index,
            payload_type: self.payload_type,
            payload,
        }
    }
}

fn check_offset(packet: &Packet) -> Result<(), SequenceViolation> {
    if packet.sequence_length == 0 {
        return Err(SequenceViolation::ZeroLength);
    }
    if packet.sequence_length > MAX_SEQUENCE_LENGTH {
        return Err(SequenceViolation::LengthTooLarge {
            length: packet.sequence_length,
            max: MAX_SEQUENCE_LENGTH,
        });
    }
    if packet.sequence_offset >= packet.sequence_length {
        return Err(SequenceViolation::OffsetOutOfRange {
            offset: packet.sequence_offset,
            length: packet.sequence_length,
        });
    }
    Ok(())
}

/// Reassembles one sequence at a time from incoming packets.
///
/// After a sequence completes the assembler is idle again and the next
/// packet starts a new sequence.
#[derive(Debug, Default)]
pub struct SequenceAssembler {
    current: Option<InProgress>,
}

impl SequenceAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when no sequence is partially assembled.
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// `(received, expected)` fragment counts of the sequence in progress.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.current
            .as_ref()
            .map(|state| (state.filled, state.slots.len()))
    }

    /// Feeds one packet.  Returns the finished sequence once every slot is
    /// filled, `Ok(None)` while fragments are still outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidSequence`] if the packet breaks the
    /// sequence invariants.  A rejected packet does not alter the sequence
    /// already in progress.
    pub fn push(&mut self, packet: Packet) -> Result<Option<ReassembledSequence>, ProtocolError> {
        match self.current.as_mut() {
            None => {
                check_offset(&packet)?;
                if packet.sequence_length == 1 {
                    return Ok(Some(ReassembledSequence {
                        sender: packet.sender,
                        sequence_index: packet.sequence_index,
                        payload_type: packet.payload_type,
                        payload: packet.payload,
                    }));
                }
                let mut slots = vec![None; packet.sequence_length as usize];
                slots[packet.sequence_offset as usize] = Some(packet.payload);
                self.current = Some(InProgress {
                    sender: packet.sender,
                    sequence_index: packet.sequence_index,
                    sequence_length: packet.sequence_length,
                    payload_type: packet.payload_type,
                    slots,
                    filled: 1,
                });
                Ok(None)
            }
            Some(state) => {
                state.check(&packet)?;
                state.slots[packet.sequence_offset as usize] = Some(packet.payload);
                state.filled += 1;
                if state.filled < state.slots.len() {
                    return Ok(None);
                }
                Ok(self.current.take().map(InProgress::finish))
            }
        }
    }

    /// Drops any partially assembled sequence.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
