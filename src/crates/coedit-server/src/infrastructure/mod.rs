//! Infrastructure layer for the server.
//!
//! Contains OS-facing adapters: the TCP listener, the UDP announcer, and
//! configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `coedit_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
