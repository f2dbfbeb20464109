//! Application layer of the server.
//!
//! Contains no network I/O and no file-system access: the infrastructure
//! layer feeds decoded payloads in and writes the results out.
//!
//! # Sub-modules
//!
//! - **`collaboration`** – The [`collaboration::CollaborationHub`]: operation
//!   history, per-client metadata, differential update bookkeeping, and
//!   presence notices.
//!
//! - **`handshake`** – The per-connection `AwaitingRequest → Approved |
//!   Rejected` state machine on top of the hub.

pub mod collaboration;
pub mod handshake;
