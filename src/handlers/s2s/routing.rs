//! Commands that mostly route: pings, messages, numerics, WHOIS.

use petrel_proto::Message;
use tracing::debug;

use crate::dispatcher::session::Session;
use crate::dispatcher::Dispatcher;
use crate::error::{HandlerError, HandlerResult};
use crate::event::ConnId;
use crate::state::ident::{canonicalize_channel, is_valid_uid};
use crate::state::uid::{Sid, Uid};

/// PING from a peer: answer when it is for us (and track end-of-burst),
/// route it onward otherwise.
pub fn ping(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <origin name> [destination SID]; the prefix is authoritative for
    // the origin.
    if msg.params.is_empty() {
        super::need_more_params(d, conn, "PING");
        return Ok(());
    }

    let source_sid = Sid::new(msg.prefix.as_deref().unwrap_or(""));
    if !d.world.servers.contains_key(&source_sid) {
        let reply = Message::with_prefix(
            d.sid.as_str(),
            "402",
            vec![source_sid.as_str().to_string(), "No such server".into()],
        );
        d.send_to_conn(conn, reply);
        return Ok(());
    }

    let destination = msg
        .param(1)
        .map(Sid::new)
        .unwrap_or_else(|| d.sid.clone());

    if destination == d.sid {
        let pong = Message::with_prefix(
            d.sid.as_str(),
            "PONG",
            vec![
                d.server_name().to_string(),
                source_sid.as_str().to_string(),
            ],
        );
        d.send_to_conn(conn, pong);

        // During a burst their PING marks the end of their half.
        let done = match d.sessions.get_mut(&conn).and_then(Session::as_peer_mut) {
            Some(peer) if peer.bursting && source_sid == peer.sid => {
                peer.got_ping = true;
                if peer.got_pong {
                    peer.bursting = false;
                    Some(peer.name.clone())
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(name) = done {
            d.notice_opers(&format!("Burst with {} over.", name));
        }
        return Ok(());
    }

    route_to_server(d, conn, &destination, msg);
    Ok(())
}

/// PONG needs no reply; it either completes our half of the burst or is
/// on its way somewhere else.
pub fn pong(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <remote server name> <destination SID>
    if msg.params.len() < 2 {
        super::need_more_params(d, conn, "PONG");
        return Ok(());
    }

    let source_sid = Sid::new(msg.prefix.as_deref().unwrap_or(""));
    if !d.world.servers.contains_key(&source_sid) {
        return Err(HandlerError::violation("Unknown source server (PONG)"));
    }

    let destination = Sid::new(msg.params[1].clone());
    if destination == d.sid {
        let done = match d.sessions.get_mut(&conn).and_then(Session::as_peer_mut) {
            Some(peer) => {
                peer.got_pong = true;
                if peer.bursting && peer.got_ping {
                    peer.bursting = false;
                    Some(peer.name.clone())
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(name) = done {
            d.notice_opers(&format!("Burst with {} over.", name));
        }
        return Ok(());
    }

    if !d.world.servers.contains_key(&destination) {
        return Err(HandlerError::violation("Unknown destination server (PONG)"));
    }
    route_to_server(d, conn, &destination, msg);
    Ok(())
}

fn route_to_server(d: &mut Dispatcher, conn: ConnId, sid: &Sid, msg: &Message) {
    let Some(server) = d.world.servers.get(sid) else {
        let reply = Message::with_prefix(
            d.sid.as_str(),
            "402",
            vec![sid.as_str().to_string(), "No such server".into()],
        );
        d.send_to_conn(conn, reply);
        return;
    };
    if let Some(target) = server.conn.or(server.via) {
        d.send_to_conn(target, msg.clone());
    }
}

/// PRIVMSG/NOTICE from the mesh: deliver to a local user, a channel's
/// local members, or keep routing.
pub fn privmsg(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    if msg.params.is_empty() {
        d.reply_peer(
            conn,
            "411",
            vec![format!("No recipient given ({})", msg.command)],
        );
        return Ok(());
    }
    if msg.params.len() < 2 {
        d.reply_peer(conn, "412", vec!["No text to send".into()]);
        return Ok(());
    }

    // Servers may NOTICE us directly; otherwise the source is a user.
    let prefix = msg.prefix.as_deref().unwrap_or("").to_string();
    let mut source = None;
    if msg.command == "NOTICE" {
        source = d
            .world
            .servers
            .get(&Sid::new(prefix.clone()))
            .map(|s| s.name.clone());
    }
    if source.is_none() {
        source = d
            .world
            .users
            .get(&Uid::new(prefix.clone()))
            .map(|u| u.uhost());
    }
    let Some(source) = source else {
        return Err(HandlerError::violation(format!(
            "Unknown source ({})",
            msg.command
        )));
    };

    // A UID target is a user, delivered or forwarded.
    if is_valid_uid(&msg.params[0]) {
        let target_uid = Uid::new(msg.params[0].clone());
        if let Some(target) = d.world.users.get(&target_uid) {
            if target.is_local() {
                let delivery = Message::with_prefix(
                    source,
                    msg.command.clone(),
                    vec![target.nick.clone(), msg.params[1].clone()],
                );
                let target_uid = target.uid.clone();
                d.route_to_user(&target_uid, delivery);
            } else {
                d.route_to_user(&target_uid, msg.clone());
            }
            return Ok(());
        }
        // Unknown UID: fall through and try it as a channel name.
    }

    let name = canonicalize_channel(&msg.params[0]);
    let Some(channel) = d.world.channels.get(&name) else {
        debug!(target = %msg.params[0], "message for unknown target");
        return Ok(());
    };

    // One copy to each peer with members behind it, never back the way
    // it came.
    let mut peers: Vec<ConnId> = Vec::new();
    for member in &channel.members {
        if let Some(via) = d.world.users.get(member).and_then(|u| u.via) {
            if via != conn && !peers.contains(&via) {
                peers.push(via);
            }
        }
    }

    let delivery = Message::with_prefix(
        source,
        msg.command.clone(),
        vec![name.clone(), msg.params[1].clone()],
    );
    d.deliver_to_channel_members(&name, &delivery, None);

    for peer in peers {
        d.send_to_conn(peer, msg.clone());
    }
    Ok(())
}

/// Numeric replies route by their first parameter, a UID. Local delivery
/// rewrites only that parameter to the display nick.
pub fn numeric(d: &mut Dispatcher, _conn: ConnId, msg: &Message) -> HandlerResult {
    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(source) = d.world.servers.get(&Sid::new(prefix)) else {
        debug!(command = %msg.command, prefix, "numeric from unknown server");
        return Ok(());
    };
    let source_name = source.name.clone();

    let Some(first) = msg.param(0) else {
        debug!(command = %msg.command, "numeric with no parameters");
        return Ok(());
    };

    let Some(target) = d.world.users.get(&Uid::new(first)) else {
        debug!(command = %msg.command, target = first, "numeric for unknown user");
        return Ok(());
    };
    let target_uid = target.uid.clone();

    if target.is_local() {
        let mut params = vec![target.nick.clone()];
        params.extend(msg.params.iter().skip(1).cloned());
        let delivery = Message::with_prefix(source_name, msg.command.clone(), params);
        d.route_to_user(&target_uid, delivery);
        return Ok(());
    }

    d.route_to_user(&target_uid, msg.clone());
    Ok(())
}

/// WHOIS routed across the mesh: answer for our users, forward for
/// others.
pub fn whois(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <target UID> <target nick>
    if msg.params.len() < 2 {
        super::need_more_params(d, conn, "WHOIS");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(requester) = d.world.users.get(&Uid::new(prefix)) else {
        debug!(prefix, "WHOIS from unknown user");
        return Ok(());
    };
    let requester_uid = requester.uid.clone();

    let Some(target) = d.world.users.get(&Uid::new(msg.params[0].clone())) else {
        let reply = Message::with_prefix(
            d.server_name(),
            "401",
            vec![
                requester_uid.as_str().to_string(),
                msg.params[0].clone(),
                "No such nick/channel".into(),
            ],
        );
        d.route_to_user(&requester_uid, reply);
        return Ok(());
    };
    let target_uid = target.uid.clone();

    if target.is_local() {
        remote_whois_response(d, &requester_uid, &target_uid);
        return Ok(());
    }

    d.route_to_user(&target_uid, msg.clone());
    Ok(())
}

/// The WHOIS numerics for one of our users, addressed to a remote
/// requester's UID; the requester's server rewrites it to their nick.
fn remote_whois_response(d: &mut Dispatcher, requester: &Uid, target: &Uid) {
    let Some(user) = d.world.users.get(target) else {
        return;
    };
    let nick = user.nick.clone();
    let replies = vec![
        (
            "311",
            vec![
                nick.clone(),
                user.username.clone(),
                user.hostname.clone(),
                "*".into(),
                user.realname.clone(),
            ],
        ),
        (
            "312",
            vec![
                nick.clone(),
                d.server_name().to_string(),
                d.config.server.description.clone(),
            ],
        ),
        ("318", vec![nick, "End of /WHOIS list".into()]),
    ];

    for (code, params) in replies {
        let mut full = vec![requester.as_str().to_string()];
        full.extend(params);
        let reply = Message::with_prefix(d.server_name(), code, full);
        d.route_to_user(requester, reply);
    }
}

/// WALLOPS/OPERWALL goes to every local operator and onward.
pub fn wallops(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    if msg.params.is_empty() {
        return Err(HandlerError::violation("Invalid parameters (WALLOPS)"));
    }
    let text = msg.params[0].clone();

    let prefix = msg.prefix.as_deref().unwrap_or("").to_string();
    let origin = d
        .world
        .users
        .get(&Uid::new(prefix.clone()))
        .map(|u| u.uhost())
        .or_else(|| {
            d.world
                .servers
                .get(&Sid::new(prefix.clone()))
                .map(|s| s.name.clone())
        })
        .or_else(|| d.world.server_by_name(&prefix).map(|s| s.name.clone()));
    let Some(origin) = origin else {
        return Err(HandlerError::violation("Unknown origin (WALLOPS)"));
    };

    let notice = Message::with_prefix(origin, "WALLOPS", vec![text]);
    let opers: Vec<Uid> = d
        .world
        .opers
        .iter()
        .filter(|o| d.world.users.get(o).is_some_and(|u| u.is_local()))
        .cloned()
        .collect();
    for oper in opers {
        d.route_to_user(&oper, notice.clone());
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}
