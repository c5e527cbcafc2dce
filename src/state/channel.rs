//! The channel entity.

use std::collections::{BTreeSet, HashSet};

use crate::state::uid::Uid;

/// A channel. Exists only while it has members; the dispatcher drops
/// empty channels from the table.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Canonical (lowercase) name, starting with `#`.
    pub name: String,
    pub members: HashSet<Uid>,
    /// Members holding ops. Always a subset of `members`.
    pub ops: HashSet<Uid>,
    /// Channel modes, from `n`, `s`.
    pub modes: BTreeSet<char>,
    /// The channel's timestamp, used for TS arbitration.
    pub ts: i64,
    pub topic: String,
    /// `nick!user@host` (or server name) of whoever set the topic.
    pub topic_setter: String,
    pub topic_ts: i64,
}

impl Channel {
    pub fn new(name: String, ts: i64) -> Self {
        Self {
            name,
            members: HashSet::new(),
            ops: HashSet::new(),
            modes: BTreeSet::new(),
            ts,
            topic: String::new(),
            topic_setter: String::new(),
            topic_ts: 0,
        }
    }

    pub fn has_member(&self, uid: &Uid) -> bool {
        self.members.contains(uid)
    }

    pub fn has_ops(&self, uid: &Uid) -> bool {
        self.ops.contains(uid)
    }

    pub fn grant_ops(&mut self, uid: Uid) {
        if self.members.contains(&uid) {
            self.ops.insert(uid);
        }
    }

    pub fn remove_ops(&mut self, uid: &Uid) {
        self.ops.remove(uid);
    }

    /// Remove a member entirely (membership and ops).
    pub fn remove_member(&mut self, uid: &Uid) {
        self.members.remove(uid);
        self.ops.remove(uid);
    }

    /// Drop every mode and all op grants. Used when TS arbitration rules
    /// that the other side's channel is older.
    pub fn clear_modes(&mut self) {
        self.modes.clear();
        self.ops.clear();
    }

    /// Mode string, `+` followed by the set modes.
    pub fn modes_string(&self) -> String {
        let mut s = String::from("+");
        s.extend(self.modes.iter());
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_require_membership() {
        let mut chan = Channel::new("#test".into(), 100);
        let uid = Uid::new("001AAAAAB");
        chan.grant_ops(uid.clone());
        assert!(!chan.has_ops(&uid));

        chan.members.insert(uid.clone());
        chan.grant_ops(uid.clone());
        assert!(chan.has_ops(&uid));
    }

    #[test]
    fn remove_member_drops_ops() {
        let mut chan = Channel::new("#test".into(), 100);
        let uid = Uid::new("001AAAAAB");
        chan.members.insert(uid.clone());
        chan.grant_ops(uid.clone());
        chan.remove_member(&uid);
        assert!(!chan.has_member(&uid));
        assert!(!chan.has_ops(&uid));
    }

    #[test]
    fn clear_modes_wipes_ops_too() {
        let mut chan = Channel::new("#test".into(), 100);
        let uid = Uid::new("001AAAAAB");
        chan.members.insert(uid.clone());
        chan.grant_ops(uid.clone());
        chan.modes.insert('n');
        chan.modes.insert('s');
        chan.clear_modes();
        assert!(chan.modes.is_empty());
        assert!(chan.ops.is_empty());
        assert!(chan.has_member(&uid));
    }
}
