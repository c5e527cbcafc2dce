//! The authoritative in-memory model.
//!
//! All tables live here and are owned by the dispatcher; relations between
//! entities are stored as keys (UID, SID, canonical channel name), never
//! as owning references.

use std::collections::{HashMap, HashSet};

use crate::event::ConnId;
use crate::state::channel::Channel;
use crate::state::ident::canonicalize_nick;
use crate::state::kline::KLine;
use crate::state::server::Server;
use crate::state::uid::{Sid, Uid};
use crate::state::user::User;

/// Every user, server, channel, operator, and K-line we know about.
#[derive(Debug, Default)]
pub struct World {
    pub users: HashMap<Uid, User>,
    /// Canonical nick -> UID.
    pub nicks: HashMap<String, Uid>,
    /// Every other server on the network (ours is not listed).
    pub servers: HashMap<Sid, Server>,
    /// Canonical name -> channel.
    pub channels: HashMap<String, Channel>,
    /// UIDs with user mode `o`.
    pub opers: HashSet<Uid>,
    pub klines: Vec<KLine>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user and index their nick; registers in `opers` when +o.
    pub fn insert_user(&mut self, user: User) {
        self.nicks
            .insert(canonicalize_nick(&user.nick), user.uid.clone());
        if user.is_oper() {
            self.opers.insert(user.uid.clone());
        }
        self.users.insert(user.uid.clone(), user);
    }

    /// Remove a user from every table and every channel. Channels left
    /// empty are dropped. Returns the removed user.
    pub fn remove_user(&mut self, uid: &Uid) -> Option<User> {
        let user = self.users.remove(uid)?;
        self.nicks.remove(&canonicalize_nick(&user.nick));
        self.opers.remove(uid);
        for name in &user.channels {
            let emptied = match self.channels.get_mut(name) {
                Some(channel) => {
                    channel.remove_member(uid);
                    channel.members.is_empty()
                }
                None => false,
            };
            if emptied {
                self.channels.remove(name);
            }
        }
        Some(user)
    }

    pub fn user_by_nick(&self, nick: &str) -> Option<&User> {
        let uid = self.nicks.get(&canonicalize_nick(nick))?;
        self.users.get(uid)
    }

    pub fn server_by_name(&self, name: &str) -> Option<&Server> {
        self.servers.values().find(|s| s.name == name)
    }

    /// All servers in the subtree rooted at `sid`: the server itself plus
    /// everything reached through it, transitively over `linked_to`.
    pub fn linked_subtree(&self, sid: &Sid) -> Vec<Sid> {
        let mut lost = vec![sid.clone()];
        let mut grew = true;
        while grew {
            grew = false;
            for server in self.servers.values() {
                if lost.contains(&server.sid) {
                    continue;
                }
                if lost.contains(&server.linked_to) {
                    lost.push(server.sid.clone());
                    grew = true;
                }
            }
        }
        lost
    }

    /// Servers sorted by ascending hop count, for burst ordering.
    pub fn servers_by_hop_count(&self) -> Vec<&Server> {
        let mut servers: Vec<&Server> = self.servers.values().collect();
        servers.sort_by_key(|s| s.hop_count);
        servers
    }

    /// Every local user sharing at least one channel with `uid`, each
    /// listed once. Does not include `uid` itself.
    pub fn local_users_sharing_channel(&self, uid: &Uid) -> Vec<ConnId> {
        let Some(user) = self.users.get(uid) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut conns = Vec::new();
        for name in &user.channels {
            let Some(channel) = self.channels.get(name) else {
                continue;
            };
            for member_uid in &channel.members {
                if member_uid == uid || !seen.insert(member_uid.clone()) {
                    continue;
                }
                if let Some(conn) = self.users.get(member_uid).and_then(|m| m.conn) {
                    conns.push(conn);
                }
            }
        }
        conns
    }

    /// Check the model invariants. Debug aid for tests.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for (canon, uid) in &self.nicks {
            let user = self.users.get(uid).expect("nick index points at a user");
            assert_eq!(canon, &canonicalize_nick(&user.nick));
        }
        for (uid, user) in &self.users {
            assert_eq!(self.nicks.get(&canonicalize_nick(&user.nick)), Some(uid));
            assert_eq!(user.is_oper(), self.opers.contains(uid));
            for name in &user.channels {
                let channel = self.channels.get(name).expect("joined channel exists");
                assert!(channel.members.contains(uid));
            }
        }
        for (name, channel) in &self.channels {
            assert!(!channel.members.is_empty(), "channel {} is empty", name);
            for uid in &channel.members {
                let user = self.users.get(uid).expect("member resolves to a user");
                assert!(user.channels.contains(name));
            }
            assert!(channel.ops.is_subset(&channel.members));
        }
        for uid in &self.opers {
            assert!(self.users.contains_key(uid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn user(uid: &str, nick: &str, server: &str) -> User {
        User {
            nick: nick.into(),
            hop_count: 0,
            nick_ts: 100,
            modes: BTreeSet::new(),
            username: "~u".into(),
            hostname: "host".into(),
            ip: "0".into(),
            uid: Uid::new(uid),
            realname: "r".into(),
            away: String::new(),
            channels: HashSet::new(),
            flood_exempt: false,
            conn: None,
            via: None,
            server: Sid::new(server),
        }
    }

    fn server(sid: &str, name: &str, hop: u32, linked_to: &str) -> Server {
        Server {
            sid: Sid::new(sid),
            name: name.into(),
            description: String::new(),
            hop_count: hop,
            capabs: None,
            conn: None,
            via: None,
            linked_to: Sid::new(linked_to),
        }
    }

    #[test]
    fn insert_and_remove_keep_indexes_consistent() {
        let mut world = World::new();
        world.insert_user(user("001AAAAAA", "Alice", "001"));
        assert!(world.user_by_nick("alice").is_some());
        world.check_invariants();

        let removed = world.remove_user(&Uid::new("001AAAAAA")).unwrap();
        assert_eq!(removed.nick, "Alice");
        assert!(world.user_by_nick("alice").is_none());
        world.check_invariants();
    }

    #[test]
    fn removing_last_member_drops_channel() {
        let mut world = World::new();
        let mut u = user("001AAAAAA", "alice", "001");
        u.channels.insert("#test".into());
        world.insert_user(u);

        let mut chan = Channel::new("#test".into(), 100);
        chan.members.insert(Uid::new("001AAAAAA"));
        world.channels.insert("#test".into(), chan);
        world.check_invariants();

        world.remove_user(&Uid::new("001AAAAAA"));
        assert!(world.channels.is_empty());
    }

    #[test]
    fn subtree_is_transitive() {
        let mut world = World::new();
        // 002 linked to us, 003 behind 002, 004 behind 003, 005 elsewhere.
        world.servers.insert(Sid::new("002"), server("002", "b", 1, "001"));
        world.servers.insert(Sid::new("003"), server("003", "c", 2, "002"));
        world.servers.insert(Sid::new("004"), server("004", "d", 3, "003"));
        world.servers.insert(Sid::new("005"), server("005", "e", 1, "001"));

        let mut lost = world.linked_subtree(&Sid::new("002"));
        lost.sort();
        assert_eq!(
            lost,
            vec![Sid::new("002"), Sid::new("003"), Sid::new("004")]
        );
    }

    #[test]
    fn shared_channel_members_deduplicated() {
        let mut world = World::new();
        for (uid, nick) in [("001AAAAAA", "a"), ("001AAAAAB", "b"), ("002AAAAAA", "c")] {
            let mut u = user(uid, nick, &uid[..3]);
            u.channels.insert("#one".into());
            u.channels.insert("#two".into());
            if uid.starts_with("001") {
                u.conn = Some(ConnId(uid.as_bytes()[8] as u64));
            }
            world.insert_user(u);
        }
        for name in ["#one", "#two"] {
            let mut chan = Channel::new(name.into(), 100);
            for uid in ["001AAAAAA", "001AAAAAB", "002AAAAAA"] {
                chan.members.insert(Uid::new(uid));
            }
            world.channels.insert(name.into(), chan);
        }

        // From c's perspective: a and b are local sharers, each once.
        let conns = world.local_users_sharing_channel(&Uid::new("002AAAAAA"));
        assert_eq!(conns.len(), 2);
    }
}
