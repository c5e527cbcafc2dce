//! Wire line parsing.

use crate::error::ParseError;
use crate::message::Message;
use crate::MAX_LINE_LEN;

/// Parse one wire line into a [`Message`].
///
/// The line may carry its CRLF (or bare LF) terminator; it is stripped.
/// Lines longer than the protocol limit yield [`ParseError::TooLong`]
/// carrying the message parsed from the first `MAX_LINE_LEN - 2` bytes.
pub fn parse(line: &str) -> Result<Message, ParseError> {
    let stripped = line.trim_end_matches(['\r', '\n']);

    if stripped.len() > MAX_LINE_LEN - 2 {
        // Truncate at a char boundary at or below the limit, then parse
        // what remains so the caller can decide what to do with it.
        let mut cut = MAX_LINE_LEN - 2;
        while !stripped.is_char_boundary(cut) {
            cut -= 1;
        }
        let msg = parse_inner(&stripped[..cut])?;
        return Err(ParseError::TooLong(Box::new(msg)));
    }

    parse_inner(stripped)
}

fn parse_inner(line: &str) -> Result<Message, ParseError> {
    if line.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut rest = line;

    let prefix = if let Some(after) = rest.strip_prefix(':') {
        let (prefix, after_prefix) = match after.split_once(' ') {
            Some(pair) => pair,
            None => return Err(ParseError::Malformed("prefix with no command")),
        };
        if prefix.is_empty() {
            return Err(ParseError::Malformed("empty prefix"));
        }
        rest = after_prefix.trim_start_matches(' ');
        Some(prefix.to_string())
    } else {
        None
    };

    let (command, after_command) = match rest.split_once(' ') {
        Some((cmd, after)) => (cmd, Some(after)),
        None => (rest, None),
    };
    if command.is_empty() {
        return Err(ParseError::Malformed("missing command"));
    }

    let mut params = Vec::new();
    if let Some(mut rest) = after_command {
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }
    }

    Ok(Message {
        prefix,
        command: command.to_string(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_command() {
        let msg = parse("QUIT\r\n").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn prefix_and_params() {
        let msg = parse(":8ZZ UID will 1 1475024621 +i will blashyrkh. 0 8ZZAAAAAB :will\r\n")
            .unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("8ZZ"));
        assert_eq!(msg.command, "UID");
        assert_eq!(msg.params.len(), 9);
        assert_eq!(msg.params[8], "will");
    }

    #[test]
    fn trailing_keeps_spaces_and_colons() {
        let msg = parse("PRIVMSG #test :hello there: world").unwrap();
        assert_eq!(msg.params, vec!["#test", "hello there: world"]);
    }

    #[test]
    fn empty_trailing() {
        let msg = parse("AWAY :").unwrap();
        assert_eq!(msg.params, vec![""]);
    }

    #[test]
    fn empty_line_rejected() {
        assert_eq!(parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn prefix_without_command_rejected() {
        assert!(matches!(parse(":irc.example.org"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn consecutive_spaces_skipped() {
        let msg = parse("PING  irc.example.org").unwrap();
        assert_eq!(msg.params, vec!["irc.example.org"]);
    }

    #[test]
    fn overlong_line_signals_truncation() {
        let long = format!("PRIVMSG #test :{}", "x".repeat(600));
        match parse(&long) {
            Err(ParseError::TooLong(msg)) => {
                assert_eq!(msg.command, "PRIVMSG");
                let line = format!("PRIVMSG #test :{}", &msg.params[1]);
                assert_eq!(line.len(), MAX_LINE_LEN - 2);
            }
            other => panic!("expected TooLong, got {:?}", other),
        }
    }

    #[test]
    fn line_at_limit_accepted() {
        // 510 bytes of content fits exactly once CRLF is added.
        let text = "x".repeat(MAX_LINE_LEN - 2 - "PRIVMSG #test :".len());
        let line = format!("PRIVMSG #test :{}\r\n", text);
        assert!(parse(&line).is_ok());
    }
}
