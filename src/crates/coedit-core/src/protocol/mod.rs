//! Protocol module containing payload types, packets, the frame codec, the
//! packet sequencer, and the discovery datagram.

pub mod announce;
pub mod codec;
pub mod messages;
pub mod packet;
pub mod sequence;
pub mod sequencer;

pub use codec::{ProtocolError, SequenceViolation};
pub use messages::*;
pub use packet::Packet;
pub use sequence::SequenceCounter;
pub use sequencer::{
    PacketSequencer, ReassembledSequence, SequenceAssembler, MAX_FRAGMENT_SIZE,
    MAX_SEQUENCE_LENGTH,
};
