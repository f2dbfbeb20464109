//! Infrastructure layer for the client.
//!
//! Contains OS-facing adapters: the TCP session to a server, the UDP
//! discovery listener, and configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `coedit_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
