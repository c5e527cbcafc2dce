//! The server entity: a peer somewhere in the mesh.

use std::collections::HashSet;

use crate::event::ConnId;
use crate::state::uid::Sid;

/// A server we know about, directly linked or beyond.
#[derive(Debug, Clone)]
pub struct Server {
    pub sid: Sid,
    pub name: String,
    pub description: String,
    /// 1 for directly linked peers.
    pub hop_count: u32,
    /// Capabilities, from CAPAB at link time or a GCAP burst. None until
    /// we have heard them; GCAP may arrive only once.
    pub capabs: Option<HashSet<String>>,
    /// The local session, when this server is linked to us directly.
    pub conn: Option<ConnId>,
    /// The directly linked peer this server is reached through.
    pub via: Option<ConnId>,
    /// The server this one is linked to (its upstream relative to us).
    pub linked_to: Sid,
}

impl Server {
    pub fn is_local(&self) -> bool {
        self.conn.is_some()
    }

    pub fn has_capab(&self, cap: &str) -> bool {
        self.capabs
            .as_ref()
            .is_some_and(|caps| caps.contains(cap))
    }

    /// Space-separated capability list for GCAP bursts.
    pub fn capabs_string(&self) -> String {
        let Some(caps) = &self.capabs else {
            return String::new();
        };
        let mut sorted: Vec<&str> = caps.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.join(" ")
    }
}
