//! TS6 nick-collision arbitration.
//!
//! A UID introduction or remote NICK change may claim a canonical nick
//! another user already holds. Timestamps arbitrate: the older nick wins,
//! except that an exact TS tie or differing user@host pairs kill both
//! sides. Either way the model is left consistent.

use petrel_proto::Message;
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::event::ConnId;
use crate::state::ident::canonicalize_nick;
use crate::state::uid::Uid;

/// Resolve a claim on `nick` by `incoming_uid` (introduced or renamed via
/// the peer on `from`). Returns whether the caller may proceed with the
/// claim; `false` means the incoming user was refused (and, for a UID
/// introduction, must not be registered).
#[allow(clippy::too_many_arguments)]
pub fn handle_collision(
    d: &mut Dispatcher,
    from: ConnId,
    incoming_uid: &Uid,
    nick: &str,
    username: &str,
    hostname: &str,
    nick_ts: i64,
    origin: &str,
) -> bool {
    let Some(existing) = d.world.user_by_nick(nick) else {
        return true;
    };
    if &existing.uid == incoming_uid {
        return true;
    }

    let existing_uid = existing.uid.clone();
    let existing_ts = existing.nick_ts;
    let same_uhost = existing.username == username && existing.hostname == hostname;

    info!(
        nick = %canonicalize_nick(nick),
        existing = %existing_uid,
        incoming = %incoming_uid,
        origin,
        "nick collision"
    );

    if nick_ts == existing_ts || !same_uhost {
        // No winner: kill both sides.
        d.notice_opers(&format!(
            "Nick collision on {} ({}), killing both",
            nick, origin
        ));
        kill_user(d, &existing_uid, "Nick collision");
        let kill = kill_message(d, incoming_uid, "Nick collision");
        d.forward_to_peers_except(None, &kill);
        return false;
    }

    if nick_ts < existing_ts {
        // The incoming user is older; evict ours and accept theirs.
        d.notice_opers(&format!(
            "Nick collision on {} ({}), killing our side",
            nick, origin
        ));
        kill_user(d, &existing_uid, "Nick collision (older nick wins)");
        return true;
    }

    // The existing user is older; refuse the incoming one and tell its
    // origin to drop it.
    d.notice_opers(&format!(
        "Nick collision on {} ({}), killing incoming",
        nick, origin
    ));
    let kill = kill_message(d, incoming_uid, "Nick collision (older nick wins)");
    d.send_to_conn(from, kill);
    false
}

/// A KILL from us for `uid`, with the reason in path form.
fn kill_message(d: &Dispatcher, uid: &Uid, reason: &str) -> Message {
    Message::with_prefix(
        d.sid.as_str(),
        "KILL",
        vec![
            uid.as_str().to_string(),
            format!("{} ({})", d.server_name(), reason),
        ],
    )
}

/// Remove a user we know about and propagate the KILL everywhere.
fn kill_user(d: &mut Dispatcher, uid: &Uid, reason: &str) {
    let kill = kill_message(d, uid, reason);
    d.forward_to_peers_except(None, &kill);

    let quit_reason = format!("Killed ({} ({}))", d.server_name(), reason);
    let is_local = d.world.users.get(uid).is_some_and(|u| u.is_local());
    if is_local {
        d.quit_local_user_opts(uid, &quit_reason, false);
    } else {
        d.quit_remote_user(uid, &quit_reason);
    }
}
