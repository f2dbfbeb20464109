//! Per-connection handshake state machine.
//!
//! ```text
//! AwaitingRequest ──(request)──► Approved
//!                       │
//!                       └──────► Rejected(code)
//! ```
//!
//! A connection answers exactly one [`ConnectionRequest`]; both outcomes are
//! terminal.  A rejection is an ordinary response value, not an error.

use coedit_core::{ConnectionRequest, ConnectionResponse, ConnectionResponseCode, SessionId};
use thiserror::Error;

use crate::application::collaboration::{CollaborationHub, HubError};

/// Where a connection is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingRequest,
    Approved,
    Rejected(ConnectionResponseCode),
}

/// Error type for handshake transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The connection already received its one response.
    #[error("handshake already completed ({0:?})")]
    AlreadyResponded(HandshakeState),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Handshake tracker for one connection.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitingRequest,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_approved(&self) -> bool {
        self.state == HandshakeState::Approved
    }

    /// Evaluates `request` from `sender` against `hub` and moves to the
    /// matching terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::AlreadyResponded`] on a second request and
    /// [`HandshakeError::Hub`] if the request fails validation.
    pub fn respond(
        &mut self,
        hub: &CollaborationHub,
        sender: SessionId,
        request: &ConnectionRequest,
    ) -> Result<ConnectionResponse, HandshakeError> {
        if self.state != HandshakeState::AwaitingRequest {
            return Err(HandshakeError::AlreadyResponded(self.state));
        }
        let response = hub.evaluate_handshake(sender, request)?;
        self.state = match response.code() {
            ConnectionResponseCode::Approved => HandshakeState::Approved,
            code => HandshakeState::Rejected(code),
        };
        Ok(response)
    }
}
