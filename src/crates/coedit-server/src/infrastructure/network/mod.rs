//! Network infrastructure for the server.
//!
//! # Sub-modules
//!
//! - **`connection_manager`** – The TCP accept loop.  Each accepted socket is
//!   wrapped in a `FrameConnection` and served on its own thread: handshake
//!   first, then the pull loop until the client leaves.
//!
//! - **`discovery`** – The UDP announcer that broadcasts the server's
//!   presence, name, and live client count so clients can find it without
//!   typing an address.

pub mod connection_manager;
pub mod discovery;
