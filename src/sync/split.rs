//! Netsplit cleanup.
//!
//! Losing a directly linked peer (dead socket, SQUIT, ERROR) loses the
//! whole subtree of servers reached through it. Every remote user homed
//! in that subtree quits locally; the lost servers leave the table. The
//! caller announces the SQUIT to the remaining peers.

use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::state::uid::{Sid, Uid};

/// Remove the subtree rooted at `lost_sid` and synthesize QUITs for the
/// users behind it. Local users are never affected.
///
/// Also used when a remote SQUIT tells us a distant server went away; in
/// that case `lost_sid` is the remote server and the subtree hangs off
/// it.
pub fn server_split_cleanup(d: &mut Dispatcher, lost_sid: &Sid) {
    if !d.world.servers.contains_key(lost_sid) {
        return;
    }
    let lost = d.world.linked_subtree(lost_sid);

    // The quit message names the two sides of the split: the lost
    // server's uplink and the lost server. Clients parse this shape to
    // recognize a netsplit.
    let quit_reason = {
        let lost_server = &d.world.servers[lost_sid];
        let upstream = if lost_server.linked_to == d.sid {
            d.server_name().to_string()
        } else {
            d.world
                .servers
                .get(&lost_server.linked_to)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| lost_server.linked_to.as_str().to_string())
        };
        format!("{} {}", upstream, lost_server.name)
    };

    let lost_users: Vec<Uid> = d
        .world
        .users
        .values()
        .filter(|user| user.is_remote() && lost.contains(&user.server))
        .map(|user| user.uid.clone())
        .collect();

    info!(
        lost_servers = lost.len(),
        lost_users = lost_users.len(),
        sid = %lost_sid,
        "netsplit cleanup"
    );

    for uid in &lost_users {
        d.quit_remote_user(uid, &quit_reason);
    }

    for sid in &lost {
        d.world.servers.remove(sid);
    }
}
