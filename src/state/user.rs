//! The network-wide user entity.

use std::collections::{BTreeSet, HashSet};

use crate::event::ConnId;
use crate::state::ident::mask_to_regex;
use crate::state::uid::{Sid, Uid};

/// A user anywhere on the network, local or remote.
#[derive(Debug, Clone)]
pub struct User {
    /// The nick as displayed. The nick index is keyed by its canonical form.
    pub nick: String,
    /// Hops from us; 0 for local users.
    pub hop_count: u32,
    /// The nick's timestamp. Changes on registration and NICK.
    pub nick_ts: i64,
    /// User modes, from `i`, `o`, `C`.
    pub modes: BTreeSet<char>,
    pub username: String,
    pub hostname: String,
    /// IP literal as carried on the wire. `0` means spoofed/unknown.
    pub ip: String,
    pub uid: Uid,
    pub realname: String,
    /// Away text; empty means present.
    pub away: String,
    /// Canonical names of joined channels.
    pub channels: HashSet<String>,
    /// Exempt from flood limits (set by a matching user rule or by +o).
    pub flood_exempt: bool,
    /// The local session, when the user is ours.
    pub conn: Option<ConnId>,
    /// The local peer through which this user is reached. None for local
    /// users.
    pub via: Option<ConnId>,
    /// The server the user is connected to.
    pub server: Sid,
}

impl User {
    pub fn is_local(&self) -> bool {
        self.conn.is_some()
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    pub fn is_oper(&self) -> bool {
        self.modes.contains(&'o')
    }

    /// `nick!user@host`, the prefix used when this user originates a
    /// client-visible message.
    pub fn uhost(&self) -> String {
        format!("{}!{}@{}", self.nick, self.username, self.hostname)
    }

    /// Mode string, `+` followed by the set modes (`+` alone if none).
    pub fn modes_string(&self) -> String {
        let mut s = String::from("+");
        s.extend(self.modes.iter());
        s
    }

    /// Opers are always flood exempt; others may be flagged so.
    pub fn is_flood_exempt(&self) -> bool {
        self.is_oper() || self.flood_exempt
    }

    /// Whether `user_mask@host_mask` (glob syntax) matches this user.
    pub fn matches_mask(&self, user_mask: &str, host_mask: &str) -> bool {
        let Ok(user_re) = mask_to_regex(user_mask) else {
            return false;
        };
        if !user_re.is_match(&self.username) {
            return false;
        }
        let Ok(host_re) = mask_to_regex(host_mask) else {
            return false;
        };
        host_re.is_match(&self.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user() -> User {
        User {
            nick: "alice".into(),
            hop_count: 0,
            nick_ts: 100,
            modes: BTreeSet::new(),
            username: "~alice".into(),
            hostname: "host.example.org".into(),
            ip: "10.0.0.1".into(),
            uid: Uid::new("001AAAAAB"),
            realname: "Alice".into(),
            away: String::new(),
            channels: HashSet::new(),
            flood_exempt: false,
            conn: Some(ConnId(1)),
            via: None,
            server: Sid::new("001"),
        }
    }

    #[test]
    fn uhost_format() {
        assert_eq!(test_user().uhost(), "alice!~alice@host.example.org");
    }

    #[test]
    fn modes_string_is_sorted_and_nonempty() {
        let mut user = test_user();
        assert_eq!(user.modes_string(), "+");
        user.modes.insert('o');
        user.modes.insert('C');
        user.modes.insert('i');
        assert_eq!(user.modes_string(), "+Cio");
    }

    #[test]
    fn mask_matching() {
        let user = test_user();
        assert!(user.matches_mask("*", "*.example.org"));
        assert!(user.matches_mask("~a????", "host.example.org"));
        assert!(!user.matches_mask("alice", "*"));
    }

    #[test]
    fn oper_is_flood_exempt() {
        let mut user = test_user();
        assert!(!user.is_flood_exempt());
        user.modes.insert('o');
        assert!(user.is_flood_exempt());
    }
}
