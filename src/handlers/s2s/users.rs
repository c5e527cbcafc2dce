//! User introduction and user-state commands from peers.

use std::collections::{BTreeSet, HashSet};

use petrel_proto::Message;
use tracing::{debug, info};

use crate::dispatcher::session::Session;
use crate::dispatcher::Dispatcher;
use crate::error::{HandlerError, HandlerResult};
use crate::event::ConnId;
use crate::state::ident::{
    canonicalize_nick, is_valid_nick, is_valid_realname, is_valid_sid, is_valid_uid,
    is_valid_username,
};
use crate::state::uid::{Sid, Uid};
use crate::state::user::User;
use crate::sync::collision;

/// UID introduces a user homed on the server named by the prefix.
pub fn uid(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <nick> <hopcount> <nick TS> <umodes> <username> <hostname> <IP> <UID> <realname>
    if msg.params.len() != 9 {
        return Err(HandlerError::violation(
            "Invalid UID command - invalid parameter count",
        ));
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    if !is_valid_sid(prefix) {
        return Err(HandlerError::violation("Invalid SID"));
    }
    let home_sid = Sid::new(prefix);
    if !d.world.servers.contains_key(&home_sid) {
        return Err(HandlerError::violation(format!(
            "UID message from unknown server {}",
            home_sid
        )));
    }

    if !is_valid_uid(&msg.params[7]) {
        return Err(HandlerError::violation("Invalid UID"));
    }
    let new_uid = Uid::new(msg.params[7].clone());
    if d.world.users.contains_key(&new_uid) {
        return Err(HandlerError::violation(format!(
            "I was sent UID for {}, but I already know it!",
            new_uid
        )));
    }

    let Ok(nick_ts) = msg.params[2].parse::<i64>() else {
        return Err(HandlerError::violation("Invalid nick TS"));
    };

    let nick = msg.params[0].clone();
    if !is_valid_nick(d.config.server.max_nick_length, &nick) {
        return Err(HandlerError::violation(format!("Invalid NICK! ({})", nick)));
    }

    let username = msg.params[4].clone();
    if !is_valid_username(&username) {
        return Err(HandlerError::violation("Invalid username"));
    }

    let hostname = msg.params[5].clone();

    if !collision::handle_collision(
        d, conn, &new_uid, &nick, &username, &hostname, nick_ts, "UID",
    ) {
        return Ok(());
    }

    let Ok(hop_count) = msg.params[1].parse::<u32>() else {
        return Err(HandlerError::violation("Invalid hop count"));
    };

    let mut modes = BTreeSet::new();
    let mut umode_chars = msg.params[3].chars();
    if umode_chars.next() != Some('+') {
        return Err(HandlerError::violation("Malformed umode"));
    }
    for c in umode_chars {
        if matches!(c, 'i' | 'o' | 'C') {
            modes.insert(c);
        }
    }

    let ip = msg.params[6].clone();

    if !is_valid_realname(&msg.params[8]) {
        return Err(HandlerError::violation("Invalid real name"));
    }

    let user = User {
        nick: nick.clone(),
        hop_count,
        nick_ts,
        modes,
        username,
        hostname,
        ip,
        uid: new_uid.clone(),
        realname: msg.params[8].clone(),
        away: String::new(),
        channels: HashSet::new(),
        flood_exempt: false,
        conn: None,
        via: Some(conn),
        server: home_sid.clone(),
    };
    let cliconn = format!(
        "CLICONN {} {} {} {} {} ({})",
        user.nick,
        user.username,
        user.hostname,
        user.ip,
        user.realname,
        d.world
            .servers
            .get(&home_sid)
            .map(|s| s.name.clone())
            .unwrap_or_default()
    );
    d.world.insert_user(user);

    info!(%new_uid, nick = %nick, server = %home_sid, "remote user");

    // Hop count grows by one for the peers beyond us.
    let mut wire = msg.clone();
    wire.params[1] = (hop_count + 1).to_string();
    d.forward_to_peers_except(Some(conn), &wire);

    let bursting = d
        .sessions
        .get(&conn)
        .and_then(Session::as_peer)
        .is_some_and(|peer| peer.bursting);
    if !bursting {
        d.notice_opers_with_mode(Some('C'), &cliconn);
    }
    Ok(())
}

/// A remote user changed nick.
pub fn nick(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <nick> <nick TS>
    if msg.params.len() < 2 {
        super::need_more_params(d, conn, "NICK");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(user) = d.world.users.get(&Uid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown user (NICK)"));
    };
    let uid = user.uid.clone();
    let old_nick = user.nick.clone();
    let old_uhost = user.uhost();
    let username = user.username.clone();
    let hostname = user.hostname.clone();

    let new_nick = msg.params[0].clone();
    let Ok(nick_ts) = msg.params[1].parse::<i64>() else {
        return Err(HandlerError::violation("Invalid TS (NICK)"));
    };
    if !is_valid_nick(d.config.server.max_nick_length, &new_nick) {
        return Err(HandlerError::violation("Invalid nick (NICK)"));
    }

    // Changing only the case of one's own nick is not a collision.
    if canonicalize_nick(&new_nick) != canonicalize_nick(&old_nick)
        && !collision::handle_collision(
            d, conn, &uid, &new_nick, &username, &hostname, nick_ts, "NICK",
        )
    {
        return Ok(());
    }

    // Local sharers hear it once each, from the old identity.
    let change = Message::with_prefix(old_uhost, "NICK", vec![new_nick.clone()]);
    for sharer in d.world.local_users_sharing_channel(&uid) {
        d.send_to_conn(sharer, change.clone());
    }

    d.world.nicks.remove(&canonicalize_nick(&old_nick));
    d.world
        .nicks
        .insert(canonicalize_nick(&new_nick), uid.clone());
    if let Some(user) = d.world.users.get_mut(&uid) {
        user.nick = new_nick;
        user.nick_ts = nick_ts;
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// A remote user is gone.
pub fn quit(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(user) = d.world.users.get(&Uid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown user (QUIT)"));
    };
    let uid = user.uid.clone();
    let reason = msg.param(0).unwrap_or("").to_string();

    d.quit_remote_user(&uid, &reason);
    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// A user was forcefully removed, locally or elsewhere.
pub fn kill(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <target UID> <source-path (reason)>
    if msg.params.len() < 2 {
        super::need_more_params(d, conn, "KILL");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("").to_string();
    let source = d
        .world
        .users
        .get(&Uid::new(prefix.clone()))
        .map(|u| u.nick.clone())
        .or_else(|| {
            d.world
                .servers
                .get(&Sid::new(prefix.clone()))
                .map(|s| s.name.clone())
        });
    let Some(source) = source else {
        let text = format!("Received KILL for {} from unknown source {}", msg.params[0], prefix);
        d.notice_opers(&text);
        return Ok(());
    };

    let Some(target) = d.world.users.get(&Uid::new(msg.params[0].clone())) else {
        let text = format!("Received KILL for unknown user {} (from {})", msg.params[0], source);
        d.notice_opers(&text);
        return Ok(());
    };
    let target_uid = target.uid.clone();
    let target_nick = target.nick.clone();
    let target_local = target.is_local();

    // The second parameter reads `<path> (<reason>)`.
    let path_and_reason = &msg.params[1];
    let Some(space) = path_and_reason.find(' ') else {
        return Err(HandlerError::violation("Malformed kill reason"));
    };
    let path = &path_and_reason[..space];
    let rest = &path_and_reason[space..];
    let (Some(lparen), Some(rparen)) = (rest.find('('), rest.rfind(')')) else {
        return Err(HandlerError::violation("Malformed KILL reason"));
    };
    if lparen > rparen {
        return Err(HandlerError::violation("Malformed KILL reason"));
    }
    let reason = rest[lparen + 1..rparen].to_string();

    let text = format!(
        "Received KILL message for {}. From {} Path: {} ({})",
        target_nick, source, path, reason
    );
    d.notice_opers(&text);

    let quit_reason = format!("Killed ({} ({}))", source, reason);
    if target_local {
        let text = format!("Killing local user {}", target_nick);
        d.notice_opers(&text);
        d.quit_local_user_opts(&target_uid, &quit_reason, false);
    } else {
        d.quit_remote_user(&target_uid, &quit_reason);
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// A user went away or came back.
pub fn away(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(user) = d.world.users.get_mut(&Uid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown user (AWAY)"));
    };

    let reason = msg.param(0).unwrap_or("");
    if reason.is_empty() {
        // Unaway for somebody already present is noise; drop it.
        if user.away.is_empty() {
            return Ok(());
        }
        user.away.clear();
    } else {
        user.away = reason.to_string();
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// A remote user changed their own user modes.
pub fn mode(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <target UID> <changes>
    if msg.params.len() < 2 {
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    if !d.world.users.contains_key(&Uid::new(prefix)) {
        return Err(HandlerError::violation("Unknown prefix (MODE)"));
    }

    let target_uid = Uid::new(msg.params[0].clone());
    let Some(target) = d.world.users.get(&target_uid) else {
        // Channel modes travel as TMODE; nothing to do here.
        debug!(target = %msg.params[0], "MODE for non-user target, ignoring");
        return Ok(());
    };
    if target.uid.as_str() != prefix {
        return Err(HandlerError::violation(
            "Invalid MODE: User changing another's mode",
        ));
    }
    let nick = target.nick.clone();
    let server = target.server.clone();

    let mut became_oper = false;
    let mut action = '+';
    if let Some(user) = d.world.users.get_mut(&target_uid) {
        for c in msg.params[1].chars() {
            match c {
                '+' | '-' => action = c,
                'i' | 'o' | 'C' => {
                    if action == '+' {
                        if user.modes.insert(c) && c == 'o' {
                            became_oper = true;
                        }
                    } else if user.modes.remove(&c) && c == 'o' {
                        // Losing o loses C with it.
                        user.modes.remove(&'C');
                    }
                }
                _ => {}
            }
        }
    }

    // Rebuild the operator index from the final mode set.
    let is_oper = d
        .world
        .users
        .get(&target_uid)
        .is_some_and(|u| u.is_oper());
    if is_oper {
        d.world.opers.insert(target_uid.clone());
    } else {
        d.world.opers.remove(&target_uid);
    }

    if became_oper {
        let server_name = d
            .world
            .servers
            .get(&server)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| server.as_str().to_string());
        d.notice_opers(&format!("{}@{} became an operator.", nick, server_name));
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}
