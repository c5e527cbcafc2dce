//! The owned IRC message type.

use std::fmt;
use std::str::FromStr;

use crate::error::{EncodeError, ParseError};

/// A parsed IRC message.
///
/// The prefix (source) is optional. Parameters are kept verbatim; only the
/// final parameter may contain spaces or be empty, which the encoder
/// renders as a trailing `:` parameter.
///
/// # Example
///
/// ```
/// use petrel_proto::Message;
///
/// let msg: Message = ":8ZZ SID irc3.example.com 2 9ZQ :My Desc".parse().unwrap();
/// assert_eq!(msg.prefix.as_deref(), Some("8ZZ"));
/// assert_eq!(msg.command, "SID");
/// assert_eq!(msg.params.len(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message source, without the leading `:`.
    pub prefix: Option<String>,
    /// The command, uppercased for named commands, or a three-digit numeric.
    pub command: String,
    /// Command parameters. The last one may be a trailing parameter.
    pub params: Vec<String>,
}

impl Message {
    /// Create a message with no prefix.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Create a message with a prefix.
    pub fn with_prefix(
        prefix: impl Into<String>,
        command: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        Self {
            prefix: Some(prefix.into()),
            command: command.into(),
            params,
        }
    }

    /// Replace the prefix, keeping everything else.
    #[must_use]
    pub fn prefixed(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Parameter at `idx`, if present.
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// Whether the command is a three-digit numeric reply.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }

    /// Render to a wire line including the trailing CRLF. A trailing
    /// parameter too long for the line limit is truncated to fit.
    pub fn encode(&self) -> Result<String, EncodeError> {
        crate::encode::encode(self)
    }
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::parse::parse(s)
    }
}

impl fmt::Display for Message {
    /// Log-friendly rendering without the CRLF. Falls back to a debug-ish
    /// form for messages that cannot be encoded.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(line) => f.write_str(line.trim_end()),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_detection() {
        assert!(Message::new("001", vec![]).is_numeric());
        assert!(Message::new("433", vec![]).is_numeric());
        assert!(!Message::new("PING", vec![]).is_numeric());
        assert!(!Message::new("1A3", vec![]).is_numeric());
        assert!(!Message::new("01", vec![]).is_numeric());
    }

    #[test]
    fn display_round_trip() {
        let msg = Message::with_prefix("001", "PING", vec!["001".into()]);
        assert_eq!(msg.to_string(), ":001 PING 001");
    }
}
