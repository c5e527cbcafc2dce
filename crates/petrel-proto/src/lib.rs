//! IRC wire protocol codec.
//!
//! A line-oriented codec for IRC messages as exchanged between clients and
//! servers: `[:prefix ]command[ param]*[ :trailing]`, CRLF-terminated, at
//! most [`MAX_LINE_LEN`] bytes including the terminator.
//!
//! The codec is stateless and knows nothing about command semantics; it
//! tokenizes lines into a prefix, a command, and parameters, and renders
//! them back. Overlong input is reported with a truncation signal that
//! carries the message parsed from the truncated line, so the caller can
//! decide whether to accept or reject it.

mod encode;
mod error;
mod message;
mod parse;

pub use error::{EncodeError, ParseError};
pub use message::Message;

/// Maximum length of a wire line in bytes, including the trailing CRLF.
pub const MAX_LINE_LEN: usize = 512;
