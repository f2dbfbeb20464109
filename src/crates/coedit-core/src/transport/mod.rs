//! Blocking TCP transport.
//!
//! - **`connection`** – [`connection::FrameConnection`], the frame codec bound
//!   to one `TcpStream`: length-prefixed packet I/O, whole-sequence reads and
//!   writes, disconnect detection, cached liveness, and disposal.

pub mod connection;
