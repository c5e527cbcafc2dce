//! Wire line encoding.

use crate::error::EncodeError;
use crate::message::Message;
use crate::MAX_LINE_LEN;

/// Render a message to a wire line, CRLF included.
///
/// The final parameter is written as a trailing parameter (`:`-prefixed)
/// when it is empty, contains a space, or itself begins with `:`. If the
/// rendered line would exceed the protocol limit, the final parameter is
/// truncated to fit; if even the line without it is too long the message
/// is not encodable.
pub fn encode(msg: &Message) -> Result<String, EncodeError> {
    let mut line = String::with_capacity(64);

    if let Some(prefix) = &msg.prefix {
        check_token(prefix)?;
        line.push(':');
        line.push_str(prefix);
        line.push(' ');
    }

    check_token(&msg.command)?;
    line.push_str(&msg.command);

    let Some((last, middle)) = msg.params.split_last() else {
        line.push_str("\r\n");
        return finish(line);
    };

    for param in middle {
        check_token(param)?;
        if param.starts_with(':') {
            return Err(EncodeError::BadParam(param.clone()));
        }
        line.push(' ');
        line.push_str(param);
    }

    line.push(' ');
    let trailing = last.is_empty() || last.contains(' ') || last.starts_with(':');
    if trailing {
        line.push(':');
    }
    if last.contains(['\r', '\n']) {
        return Err(EncodeError::BadParam(last.clone()));
    }

    // Truncate the final parameter if the full line would not fit.
    let budget = MAX_LINE_LEN - 2;
    if line.len() >= budget {
        return Err(EncodeError::TooLong);
    }
    let room = budget - line.len();
    if last.len() > room {
        let mut cut = room;
        while !last.is_char_boundary(cut) {
            cut -= 1;
        }
        line.push_str(&last[..cut]);
    } else {
        line.push_str(last);
    }

    line.push_str("\r\n");
    finish(line)
}

fn finish(line: String) -> Result<String, EncodeError> {
    debug_assert!(line.len() <= MAX_LINE_LEN);
    Ok(line)
}

fn check_token(s: &str) -> Result<(), EncodeError> {
    if s.is_empty() || s.contains([' ', '\r', '\n']) {
        return Err(EncodeError::BadParam(s.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_params() {
        let msg = Message::with_prefix("002", "PONG", vec![
            "irc2.example.org".into(),
            "001".into(),
        ]);
        assert_eq!(encode(&msg).unwrap(), ":002 PONG irc2.example.org 001\r\n");
    }

    #[test]
    fn trailing_with_spaces() {
        let msg = Message::with_prefix(
            "8ZZ",
            "SID",
            vec!["irc3.example.com".into(), "2".into(), "9ZQ".into(), "My Desc".into()],
        );
        assert_eq!(
            encode(&msg).unwrap(),
            ":8ZZ SID irc3.example.com 2 9ZQ :My Desc\r\n"
        );
    }

    #[test]
    fn empty_last_param_gets_sigil() {
        let msg = Message::with_prefix("001", "SJOIN", vec![
            "1475187553".into(),
            "#test".into(),
            "+ns".into(),
            "".into(),
        ]);
        assert_eq!(
            encode(&msg).unwrap(),
            ":001 SJOIN 1475187553 #test +ns :\r\n"
        );
    }

    #[test]
    fn middle_param_with_space_rejected() {
        let msg = Message::new("KICK", vec!["#a b".into(), "nick".into()]);
        assert!(matches!(encode(&msg), Err(EncodeError::BadParam(_))));
    }

    #[test]
    fn overlong_trailing_truncated_to_limit() {
        let msg = Message::new("PRIVMSG", vec!["#test".into(), "y".repeat(700)]);
        let line = encode(&msg).unwrap();
        assert_eq!(line.len(), MAX_LINE_LEN);
        assert!(line.ends_with("\r\n"));
    }

    #[test]
    fn parse_encode_round_trip() {
        for raw in [
            ":001 PING 001",
            ":nick!user@host PRIVMSG #channel :Hello, world!",
            "PASS secret TS 6 9ZQ",
            ":8ZZAAAAAB AWAY :gone fishing",
        ] {
            let msg: Message = raw.parse().unwrap();
            assert_eq!(msg.encode().unwrap(), format!("{}\r\n", raw));
        }
    }
}
