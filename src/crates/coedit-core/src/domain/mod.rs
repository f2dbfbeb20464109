//! Domain entities for coedit.
//!
//! Passive data with no I/O.  Entities here never emit events themselves;
//! the registries that own them do.

/// A discovered server as seen by a listener.
///
/// See [`server_description::ServerDescription`].
pub mod server_description;
