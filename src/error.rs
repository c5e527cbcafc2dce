//! Server error taxonomy.
//!
//! Protocol violations terminate the offending session with an ERROR
//! line; validation failures answer with a numeric and keep the session;
//! everything transport-level arrives as a `DeadClient` event. The
//! dispatcher recovers from all of these. Only startup failures and UID
//! exhaustion are fatal, and the latter only to the session asking.

use thiserror::Error;

use crate::state::uid::IdOverflow;

/// An error from a command handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Protocol violation: the session is terminated and sent an ERROR
    /// line with this text.
    #[error("{0}")]
    Violation(String),

    /// The local UID space is exhausted; fatal to the registering session.
    #[error(transparent)]
    UidOverflow(#[from] IdOverflow),
}

impl HandlerError {
    pub fn violation(reason: impl Into<String>) -> Self {
        HandlerError::Violation(reason.into())
    }
}

/// Result type for command handlers. `Err` means the session that sent
/// the command is to be terminated.
pub type HandlerResult = Result<(), HandlerError>;
