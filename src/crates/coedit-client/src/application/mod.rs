//! Application layer of the client.
//!
//! # Sub-modules
//!
//! - **`server_browser`** – The [`server_browser::ServerRegistry`] of servers
//!   heard on the LAN, with typed change events and staleness expiry.
//!
//! - **`sync_state`** – Buffers local changes between polls and mirrors the
//!   server's view of the other clients.

pub mod server_browser;
pub mod sync_state;
