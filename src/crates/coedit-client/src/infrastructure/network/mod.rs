//! Network infrastructure for the client.
//!
//! # Sub-modules
//!
//! - **`session`** – [`session::ClientSession`]: handshake, the blocking pull
//!   cycle, metadata pushes, and departure over one `FrameConnection`.
//!
//! - **`discovery`** – The UDP listener that turns `Announce` datagrams into
//!   `ServerRegistry` entries and expires servers that fall silent.

pub mod discovery;
pub mod session;
