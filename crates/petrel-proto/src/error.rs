//! Codec errors.

use thiserror::Error;

use crate::message::Message;

/// Errors from parsing a wire line.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// The line was empty (or whitespace only).
    #[error("empty message")]
    Empty,

    /// The line exceeded the protocol limit. The payload is the message
    /// parsed from the truncated line; the caller may accept or reject it.
    #[error("line longer than {} bytes", crate::MAX_LINE_LEN)]
    TooLong(Box<Message>),

    /// A prefix sigil with nothing after it, or no command token.
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

/// Errors from encoding a message to a wire line.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    /// The command or a non-final parameter contains bytes that cannot be
    /// represented on the wire (spaces, CR, LF, or a leading `:`).
    #[error("parameter not encodable: {0:?}")]
    BadParam(String),

    /// The line exceeds the protocol limit even with the trailing
    /// parameter truncated away.
    #[error("message too long to encode")]
    TooLong,
}
