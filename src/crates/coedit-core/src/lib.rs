//! # coedit-core
//!
//! Shared library for coedit containing the wire protocol, the packet
//! sequencer, the framed TCP connection, and the discovery domain entities.
//!
//! This crate is used by both the server and client applications.
//! It has no dependencies on UI frameworks, on the operational-transform
//! engine, or on any async runtime: every I/O call here is blocking.
//!
//! # Architecture overview
//!
//! coedit moves edit operations and per-client metadata between one server
//! and many clients.  The edit operations themselves are opaque to this crate;
//! an external synchronisation engine produces and consumes them.
//!
//! - **`protocol`** – What travels over the network.  A logical message
//!   ([`SyncPayload`]) is serialised, split into bounded [`Packet`] fragments
//!   by the [`PacketSequencer`], written as length-prefixed frames, and put
//!   back together on the other side by the [`SequenceAssembler`].  The UDP
//!   [`Announce`] datagram lives here too.
//!
//! - **`transport`** – The blocking [`FrameConnection`]: length-prefixed
//!   frame I/O over a `TcpStream`, with independent read and write locks,
//!   disconnect detection, a cached liveness probe, and idempotent disposal.
//!
//! - **`domain`** – Passive entities with no I/O.  [`ServerDescription`] is a
//!   discovered server as seen by a listener.

pub mod domain;
pub mod protocol;
pub mod transport;

pub use domain::server_description::{DiscoveryError, ServerDescription, ServerKey};
pub use protocol::announce::Announce;
pub use protocol::codec::{ProtocolError, SequenceViolation};
pub use protocol::messages::{
    ClientDescription, ClientMetadata, ClientUpdate, ConnectionRequest, ConnectionResponse,
    ConnectionResponseCode, DisconnectionRequest, Operation, PayloadType, RemoteConnection,
    RemoteDisconnection, SessionId, SyncPayload, ValidationError,
};
pub use protocol::packet::Packet;
pub use protocol::sequencer::{PacketSequencer, ReassembledSequence, SequenceAssembler};
pub use transport::connection::{FrameConnection, TransportError};
