//! Identifier canonicalization, validation, and mask matching.
//!
//! IRC nicknames have a legacy notion of case equivalence: `{}|` are the
//! lowercase forms of `[]\`. Canonical forms are what the nick index is
//! keyed by. Channel names canonicalize by plain lowercasing.

use regex::Regex;

pub const MAX_CHANNEL_LEN: usize = 50;
pub const MAX_TOPIC_LEN: usize = 300;
pub const MAX_USERNAME_LEN: usize = 10;
pub const MAX_REALNAME_LEN: usize = 50;

/// Canonicalize a nickname: lowercase, with `[` -> `{`, `]` -> `}` and
/// `\` -> `|`. `~` is left alone (it is not a valid nick character).
///
/// Does not validate or strip whitespace.
pub fn canonicalize_nick(nick: &str) -> String {
    nick.to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            other => other,
        })
        .collect()
}

/// Canonicalize a channel name. Does not validate.
pub fn canonicalize_channel(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Nick validity: 1..=max_len characters from `-0-9A-Z[\]^_` + backtick +
/// `a-z{|}`, where the first may not be `-` or a digit.
pub fn is_valid_nick(max_len: usize, nick: &str) -> bool {
    if nick.is_empty() || nick.len() > max_len {
        return false;
    }

    for (i, c) in nick.chars().enumerate() {
        if i == 0 && (c == '-' || c.is_ascii_digit()) {
            return false;
        }
        match c {
            '-' | '_' | '`' | '^' => {}
            '[' | '\\' | ']' | '{' | '|' | '}' => {}
            c if c.is_ascii_alphanumeric() => {}
            _ => return false,
        }
    }

    true
}

/// Username validity (USER command): 1..=10 chars; the first from
/// alphanumerics and `[\]^{|}~`; later characters additionally allow
/// `$ - _` + backtick, and `.` at most twice and never last.
pub fn is_valid_username(user: &str) -> bool {
    if user.is_empty() || user.len() > MAX_USERNAME_LEN {
        return false;
    }
    if user.ends_with('.') {
        return false;
    }

    let mut dots = 0;
    for (i, c) in user.chars().enumerate() {
        if i == 0 {
            match c {
                '[' | '\\' | ']' | '^' | '{' | '|' | '}' | '~' => {}
                c if c.is_ascii_alphanumeric() => {}
                _ => return false,
            }
            continue;
        }
        match c {
            '.' => {
                dots += 1;
                if dots > 2 {
                    return false;
                }
            }
            '$' | '-' | '_' | '`' => {}
            '[' | '\\' | ']' | '^' | '{' | '|' | '}' | '~' => {}
            c if c.is_ascii_alphanumeric() => {}
            _ => return false,
        }
    }

    true
}

pub fn is_valid_realname(name: &str) -> bool {
    name.len() <= MAX_REALNAME_LEN
}

/// Channel validity: `#` followed by `[a-z0-9]`, at most 50 bytes total.
/// Canonicalize before calling.
pub fn is_valid_channel(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_CHANNEL_LEN {
        return false;
    }
    let Some(rest) = name.strip_prefix('#') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// SID: `[0-9][0-9A-Z]{2}`.
pub fn is_valid_sid(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 3
        && b[0].is_ascii_digit()
        && b[1..].iter().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

/// The per-server ID half of a UID: `[A-Z][A-Z0-9]{5}`.
pub fn is_valid_id(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 6
        && b[0].is_ascii_uppercase()
        && b[1..].iter().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

/// UID = SID followed by ID, 9 characters.
pub fn is_valid_uid(s: &str) -> bool {
    s.len() == 9 && is_valid_sid(&s[..3]) && is_valid_id(&s[3..])
}

/// Whether a user mask (the user half of user@host, with `*`/`?` globs)
/// looks reasonable.
pub fn is_valid_user_mask(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '?' | '~'))
}

/// Whether a host mask looks reasonable.
pub fn is_valid_host_mask(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '*' | '?' | ':'))
}

/// Compile a glob mask to an anchored regex: every regex metacharacter is
/// quoted, then `*` becomes `.*` and `?` becomes `.`.
pub fn mask_to_regex(mask: &str) -> Result<Regex, regex::Error> {
    let quoted = regex::escape(mask)
        .replace("\\*", ".*")
        .replace("\\?", ".");
    Regex::new(&format!("^{}$", quoted))
}

/// Split a comma-separated channel list into canonical, valid, unique
/// names. Invalid entries and duplicates are dropped.
pub fn comma_channels(list: &str) -> Vec<String> {
    let mut names = Vec::new();
    for raw in list.split(',') {
        let name = canonicalize_channel(raw.trim());
        if name.is_empty() || !is_valid_channel(&name) {
            continue;
        }
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Parse a space-separated capability list into uppercased entries.
pub fn parse_capabs(s: &str) -> std::collections::HashSet<String> {
    s.split_whitespace()
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_canonicalization_folds_brackets() {
        assert_eq!(canonicalize_nick("Alice"), "alice");
        assert_eq!(canonicalize_nick("a[b]c\\d"), "a{b}c|d");
        // Idempotent on the expanded alphabet.
        let once = canonicalize_nick("A[B]\\^~");
        assert_eq!(canonicalize_nick(&once), once);
    }

    #[test]
    fn nick_validity() {
        assert!(is_valid_nick(9, "alice"));
        assert!(is_valid_nick(9, "a1ice"));
        assert!(is_valid_nick(9, "[w]ill`"));
        assert!(!is_valid_nick(9, ""));
        assert!(!is_valid_nick(9, "1alice"));
        assert!(!is_valid_nick(9, "-alice"));
        assert!(!is_valid_nick(9, "toolongnick"));
        assert!(!is_valid_nick(9, "al ice"));
        assert!(!is_valid_nick(9, "al!ce"));
    }

    #[test]
    fn username_validity() {
        assert!(is_valid_username("will"));
        assert!(is_valid_username("~will"));
        assert!(is_valid_username("a.b.c"));
        assert!(!is_valid_username("a.b.c.d"));
        assert!(!is_valid_username("abc."));
        assert!(!is_valid_username(".abc"));
        assert!(!is_valid_username("-abc"));
        assert!(is_valid_username("a-bc"));
        assert!(!is_valid_username("elevenchars"));
        assert!(!is_valid_username(""));
    }

    #[test]
    fn channel_validity() {
        assert!(is_valid_channel("#test"));
        assert!(is_valid_channel("#test2"));
        assert!(!is_valid_channel("#Test"));
        assert!(!is_valid_channel("test"));
        assert!(!is_valid_channel("#"));
        assert!(!is_valid_channel(&format!("#{}", "a".repeat(50))));
    }

    #[test]
    fn sid_and_uid_validity() {
        assert!(is_valid_sid("001"));
        assert!(is_valid_sid("9ZQ"));
        assert!(!is_valid_sid("A01"));
        assert!(!is_valid_sid("0011"));
        assert!(is_valid_uid("001AAAAAB"));
        assert!(is_valid_uid("9ZQA0Z9XY"));
        assert!(!is_valid_uid("0010AAAAB"));
        assert!(!is_valid_uid("001AAAAA"));
    }

    #[test]
    fn masks_behave_as_globs() {
        let re = mask_to_regex("*!*@host?.example.*").unwrap();
        assert!(re.is_match("nick!user@host1.example.org"));
        assert!(!re.is_match("nick!user@host12.example.org"));

        // Regex metacharacters are inert.
        let re = mask_to_regex("a.b").unwrap();
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("axb"));

        let re = mask_to_regex("*").unwrap();
        assert!(re.is_match(""));
        assert!(re.is_match("anything at all"));
    }

    #[test]
    fn comma_channel_lists() {
        assert_eq!(
            comma_channels("#One, #two,#one,bad,#two"),
            vec!["#one".to_string(), "#two".to_string()]
        );
    }
}
