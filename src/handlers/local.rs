//! Commands from registered local users.

use std::collections::BTreeSet;

use petrel_proto::Message;

use crate::dispatcher::session::Session;
use crate::dispatcher::Dispatcher;
use crate::error::HandlerResult;
use crate::event::ConnId;
use crate::state::channel::Channel;
use crate::state::ident::{
    self, canonicalize_channel, canonicalize_nick, is_valid_channel, is_valid_host_mask,
    is_valid_nick, is_valid_user_mask,
};
use crate::state::kline::KLine;
use crate::state::uid::Uid;

pub fn handle(d: &mut Dispatcher, conn: ConnId, msg: Message) -> HandlerResult {
    let Some(Session::User(session)) = d.sessions.get(&conn) else {
        return Ok(());
    };
    let uid = session.uid.clone();

    match msg.command.as_str() {
        "NICK" => nick(d, &uid, &msg),
        "JOIN" => join(d, &uid, &msg),
        "PART" => part(d, &uid, &msg),
        "PRIVMSG" | "NOTICE" => privmsg(d, &uid, &msg),
        "QUIT" => {
            let reason = match msg.param(0) {
                Some(text) if !text.is_empty() => format!("Quit: {}", text),
                _ => "Client quit".to_string(),
            };
            d.quit_local_user(&uid, &reason);
            Ok(())
        }
        "MODE" => mode(d, &uid, &msg),
        "TOPIC" => topic(d, &uid, &msg),
        "AWAY" => away(d, &uid, &msg),
        "PING" => {
            let token = msg.param(0).unwrap_or("").to_string();
            let reply = Message::with_prefix(
                d.server_name(),
                "PONG",
                vec![d.server_name().to_string(), token],
            );
            d.route_to_user(&uid, reply);
            Ok(())
        }
        "PONG" => Ok(()),
        "OPER" => oper(d, &uid, &msg),
        "KILL" => kill(d, &uid, &msg),
        "SQUIT" => squit(d, &uid, &msg),
        "KLINE" => kline(d, &uid, &msg),
        "UNKLINE" => unkline(d, &uid, &msg),
        "WALLOPS" | "OPERWALL" => wallops(d, &uid, &msg),
        "WHOIS" => whois(d, &uid, &msg),
        "INVITE" => invite(d, &uid, &msg),
        "LUSERS" => {
            lusers_view(d, &uid);
            Ok(())
        }
        "MOTD" => {
            motd_view(d, &uid);
            Ok(())
        }
        "CAP" => Ok(()),
        _ => {
            d.reply_user(
                &uid,
                "421",
                vec![msg.command.clone(), "Unknown command".into()],
            );
            Ok(())
        }
    }
}

fn need_more_params(d: &mut Dispatcher, uid: &Uid, command: &str) {
    d.reply_user(
        uid,
        "461",
        vec![command.to_string(), "Not enough parameters".into()],
    );
}

/// Oper-only commands answer with a notice rather than an unsupported
/// numeric when the sender lacks +o.
fn require_oper(d: &mut Dispatcher, uid: &Uid) -> bool {
    let is_oper = d.world.users.get(uid).is_some_and(|u| u.is_oper());
    if !is_oper {
        d.server_notice(uid, "You are not an IRC operator".into());
    }
    is_oper
}

fn nick(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    let Some(raw) = msg.param(0) else {
        d.reply_user(uid, "431", vec!["No nickname given".into()]);
        return Ok(());
    };

    let max = d.config.server.max_nick_length;
    let nick: String = {
        let mut cut = raw.len().min(max);
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        raw[..cut].to_string()
    };
    if !is_valid_nick(max, &nick) {
        d.reply_user(uid, "432", vec![nick, "Erroneous nickname".into()]);
        return Ok(());
    }

    let Some(user) = d.world.users.get(uid) else {
        return Ok(());
    };
    let old_canonical = canonicalize_nick(&user.nick);
    let new_canonical = canonicalize_nick(&nick);
    let uhost = user.uhost();

    // A change in case only is always allowed; otherwise the nick must be
    // free.
    if new_canonical != old_canonical && d.world.nicks.contains_key(&new_canonical) {
        d.reply_user(
            uid,
            "433",
            vec![nick, "Nickname is already in use".into()],
        );
        return Ok(());
    }

    // Everyone sharing a channel hears it once, from the old identity;
    // so does the user themselves.
    let change = Message::with_prefix(uhost, "NICK", vec![nick.clone()]);
    for sharer in d.world.local_users_sharing_channel(uid) {
        d.send_to_conn(sharer, change.clone());
    }
    d.route_to_user(uid, change);

    let now = d.now();
    d.world.nicks.remove(&old_canonical);
    d.world.nicks.insert(new_canonical, uid.clone());
    if let Some(user) = d.world.users.get_mut(uid) {
        user.nick = nick.clone();
        user.nick_ts = now;
    }

    let wire = Message::with_prefix(
        uid.as_str(),
        "NICK",
        vec![nick, now.to_string()],
    );
    d.forward_to_peers_except(None, &wire);
    Ok(())
}

fn join(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    let Some(list) = msg.param(0) else {
        need_more_params(d, uid, "JOIN");
        return Ok(());
    };

    // JOIN 0 parts everything.
    if list == "0" {
        let channels: Vec<String> = d
            .world
            .users
            .get(uid)
            .map(|u| u.channels.iter().cloned().collect())
            .unwrap_or_default();
        for name in channels {
            part_channel(d, uid, &name, "");
        }
        let wire = Message::with_prefix(uid.as_str(), "JOIN", vec!["0".into()]);
        d.forward_to_peers_except(None, &wire);
        return Ok(());
    }

    for raw in list.split(',') {
        let name = canonicalize_channel(raw.trim());
        if name.is_empty() {
            continue;
        }
        if !is_valid_channel(&name) {
            d.reply_user(uid, "403", vec![name, "Invalid channel name".into()]);
            continue;
        }
        join_channel(d, uid, &name);
    }
    Ok(())
}

fn join_channel(d: &mut Dispatcher, uid: &Uid, name: &str) {
    let already = d
        .world
        .users
        .get(uid)
        .is_some_and(|u| u.channels.contains(name));
    if already {
        return;
    }

    let now = d.now();
    let created = !d.world.channels.contains_key(name);
    let channel = d
        .world
        .channels
        .entry(name.to_string())
        .or_insert_with(|| {
            let mut channel = Channel::new(name.to_string(), now);
            channel.modes.insert('n');
            channel.modes.insert('s');
            channel
        });
    channel.members.insert(uid.clone());
    if created {
        // The creator starts with ops.
        channel.grant_ops(uid.clone());
    }
    let ts = channel.ts;

    let (uhost, nick) = match d.world.users.get_mut(uid) {
        Some(user) => {
            user.channels.insert(name.to_string());
            (user.uhost(), user.nick.clone())
        }
        None => return,
    };

    let echo = Message::with_prefix(uhost, "JOIN", vec![name.to_string()]);
    d.deliver_to_channel_members(name, &echo, None);

    if created {
        let mode = Message::with_prefix(
            d.server_name(),
            "MODE",
            vec![name.to_string(), "+o".into(), nick],
        );
        d.deliver_to_channel_members(name, &mode, None);
    }

    d.reply_user(uid, "329", vec![name.to_string(), ts.to_string()]);
    names_view(d, uid, name);

    // Channel creation travels as SJOIN; joining an existing channel as
    // a plain JOIN.
    let wire = if created {
        Message::with_prefix(
            d.sid.as_str(),
            "SJOIN",
            vec![
                ts.to_string(),
                name.to_string(),
                "+ns".into(),
                format!("@{}", uid),
            ],
        )
    } else {
        Message::with_prefix(
            uid.as_str(),
            "JOIN",
            vec![ts.to_string(), name.to_string(), "+".into()],
        )
    };
    d.forward_to_peers_except(None, &wire);
}

/// Remove a local user from one channel and tell the local members.
/// Does not propagate.
fn part_channel(d: &mut Dispatcher, uid: &Uid, name: &str, reason: &str) {
    let Some(user) = d.world.users.get(uid) else {
        return;
    };
    if !user.channels.contains(name) {
        return;
    }
    let uhost = user.uhost();

    let mut params = vec![name.to_string()];
    if !reason.is_empty() {
        params.push(reason.to_string());
    }
    let echo = Message::with_prefix(uhost, "PART", params);
    d.deliver_to_channel_members(name, &echo, None);

    if let Some(user) = d.world.users.get_mut(uid) {
        user.channels.remove(name);
    }
    let emptied = match d.world.channels.get_mut(name) {
        Some(channel) => {
            channel.remove_member(uid);
            channel.members.is_empty()
        }
        None => false,
    };
    if emptied {
        d.world.channels.remove(name);
    }
}

fn part(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    let Some(list) = msg.param(0) else {
        need_more_params(d, uid, "PART");
        return Ok(());
    };
    let reason = msg.param(1).unwrap_or("").to_string();

    for name in ident::comma_channels(list) {
        let on_channel = d
            .world
            .users
            .get(uid)
            .is_some_and(|u| u.channels.contains(&name));
        if !on_channel {
            d.reply_user(uid, "403", vec![name, "No such channel".into()]);
            continue;
        }
        part_channel(d, uid, &name, &reason);
    }

    let wire = Message::with_prefix(uid.as_str(), "PART", msg.params.clone());
    d.forward_to_peers_except(None, &wire);
    Ok(())
}

fn privmsg(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    if msg.params.is_empty() {
        d.reply_user(
            uid,
            "411",
            vec![format!("No recipient given ({})", msg.command)],
        );
        return Ok(());
    }
    if msg.params.len() < 2 || msg.params[1].is_empty() {
        d.reply_user(uid, "412", vec!["No text to send".into()]);
        return Ok(());
    }

    let target = msg.params[0].clone();
    let text = msg.params[1].clone();
    let Some(sender) = d.world.users.get(uid) else {
        return Ok(());
    };
    let uhost = sender.uhost();

    if !target.starts_with('#') {
        // A user target.
        let Some(recipient) = d.world.user_by_nick(&target) else {
            d.reply_user(uid, "401", vec![target, "No such nick/channel".into()]);
            return Ok(());
        };
        let recipient_uid = recipient.uid.clone();
        let recipient_nick = recipient.nick.clone();

        if recipient.is_local() {
            let delivery = Message::with_prefix(
                uhost,
                msg.command.clone(),
                vec![recipient_nick, text],
            );
            d.route_to_user(&recipient_uid, delivery);
        } else {
            let wire = Message::with_prefix(
                uid.as_str(),
                msg.command.clone(),
                vec![recipient_uid.as_str().to_string(), text],
            );
            d.route_to_user(&recipient_uid, wire);
        }
        return Ok(());
    }

    let name = canonicalize_channel(&target);
    let Some(channel) = d.world.channels.get(&name) else {
        d.reply_user(uid, "401", vec![target, "No such nick/channel".into()]);
        return Ok(());
    };

    // Local members hear it directly; each peer with members behind it
    // gets one copy.
    let mut peers: Vec<ConnId> = Vec::new();
    for member in &channel.members {
        if let Some(via) = d.world.users.get(member).and_then(|u| u.via) {
            if !peers.contains(&via) {
                peers.push(via);
            }
        }
    }

    let delivery = Message::with_prefix(
        uhost,
        msg.command.clone(),
        vec![name.clone(), text.clone()],
    );
    d.deliver_to_channel_members(&name, &delivery, Some(uid));

    let wire = Message::with_prefix(uid.as_str(), msg.command.clone(), vec![name, text]);
    for peer in peers {
        d.send_to_conn(peer, wire.clone());
    }
    Ok(())
}

fn mode(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    let Some(target) = msg.param(0) else {
        need_more_params(d, uid, "MODE");
        return Ok(());
    };

    if target.starts_with('#') {
        return channel_mode(d, uid, msg);
    }

    let Some(user) = d.world.users.get(uid) else {
        return Ok(());
    };
    if canonicalize_nick(target) != canonicalize_nick(&user.nick) {
        d.reply_user(
            uid,
            "401",
            vec![target.to_string(), "No such nick/channel".into()],
        );
        return Ok(());
    }

    let Some(changes) = msg.param(1) else {
        let modes = user.modes_string();
        d.reply_user(uid, "221", vec![modes]);
        return Ok(());
    };
    let changes = changes.to_string();

    let mut modes = user.modes.clone();
    let (set, unset, _unknown) = resolve_umode_changes(&changes, &mut modes);
    if set.is_empty() && unset.is_empty() {
        return Ok(());
    }

    if let Some(user) = d.world.users.get_mut(uid) {
        user.modes = modes;
    }
    if unset.contains(&'o') {
        d.world.opers.remove(uid);
    }

    let mut applied = String::new();
    if !set.is_empty() {
        applied.push('+');
        applied.extend(set.iter());
    }
    if !unset.is_empty() {
        applied.push('-');
        applied.extend(unset.iter());
    }

    let (uhost, nick) = match d.world.users.get(uid) {
        Some(user) => (user.uhost(), user.nick.clone()),
        None => return Ok(()),
    };
    let echo = Message::with_prefix(uhost, "MODE", vec![nick, applied.clone()]);
    d.route_to_user(uid, echo);

    let wire = Message::with_prefix(
        uid.as_str(),
        "MODE",
        vec![uid.as_str().to_string(), applied],
    );
    d.forward_to_peers_except(None, &wire);
    Ok(())
}

fn channel_mode(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    let name = canonicalize_channel(msg.param(0).unwrap_or(""));
    let Some(channel) = d.world.channels.get(&name) else {
        d.reply_user(uid, "403", vec![name, "No such channel".into()]);
        return Ok(());
    };
    let ts = channel.ts;

    let Some(changes) = msg.param(1) else {
        d.reply_user(uid, "329", vec![name, ts.to_string()]);
        return Ok(());
    };

    if !channel.has_ops(uid) {
        d.server_notice(uid, format!("You're not an operator on {}", name));
        return Ok(());
    }

    // Only op grants and removals exist here; one nick parameter each.
    let mut action = '+';
    let mut param_idx = 2;
    let mut applied = String::new();
    let mut applied_action = ' ';
    let mut applied_nicks: Vec<String> = Vec::new();
    let mut applied_uids: Vec<Uid> = Vec::new();

    let changes = changes.to_string();
    for c in changes.chars() {
        match c {
            '+' | '-' => action = c,
            'o' => {
                let Some(target_nick) = msg.param(param_idx) else {
                    break;
                };
                param_idx += 1;
                let Some(target) = d.world.user_by_nick(target_nick) else {
                    continue;
                };
                let target_uid = target.uid.clone();
                let target_nick = target.nick.clone();

                let Some(channel) = d.world.channels.get_mut(&name) else {
                    break;
                };
                if !channel.has_member(&target_uid) {
                    continue;
                }
                if action == '+' {
                    if channel.has_ops(&target_uid) {
                        continue;
                    }
                    channel.grant_ops(target_uid.clone());
                } else {
                    if !channel.has_ops(&target_uid) {
                        continue;
                    }
                    channel.remove_ops(&target_uid);
                }

                if applied_action != action {
                    applied_action = action;
                    applied.push(action);
                }
                applied.push('o');
                applied_nicks.push(target_nick);
                applied_uids.push(target_uid);
            }
            _ => {}
        }
    }

    if applied.is_empty() {
        return Ok(());
    }

    let uhost = match d.world.users.get(uid) {
        Some(user) => user.uhost(),
        None => return Ok(()),
    };
    let mut echo_params = vec![name.clone(), applied.clone()];
    echo_params.extend(applied_nicks);
    let echo = Message::with_prefix(uhost, "MODE", echo_params);
    d.deliver_to_channel_members(&name, &echo, None);

    let mut wire_params = vec![ts.to_string(), name, applied];
    wire_params.extend(applied_uids.iter().map(|u| u.as_str().to_string()));
    let wire = Message::with_prefix(uid.as_str(), "TMODE", wire_params);
    d.forward_to_peers_except(None, &wire);
    Ok(())
}

fn topic(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    let Some(raw) = msg.param(0) else {
        need_more_params(d, uid, "TOPIC");
        return Ok(());
    };
    let name = canonicalize_channel(raw);
    let Some(channel) = d.world.channels.get(&name) else {
        d.reply_user(uid, "403", vec![name, "No such channel".into()]);
        return Ok(());
    };

    let Some(text) = msg.param(1) else {
        // Query.
        if channel.topic.is_empty() {
            d.reply_user(uid, "331", vec![name, "No topic is set".into()]);
        } else {
            let topic = channel.topic.clone();
            d.reply_user(uid, "332", vec![name, topic]);
        }
        return Ok(());
    };

    let mut text = text.to_string();
    if text.len() > ident::MAX_TOPIC_LEN {
        let mut cut = ident::MAX_TOPIC_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }

    let (uhost, now) = match d.world.users.get(uid) {
        Some(user) => (user.uhost(), d.now()),
        None => return Ok(()),
    };
    if let Some(channel) = d.world.channels.get_mut(&name) {
        channel.topic = text.clone();
        channel.topic_ts = now;
        channel.topic_setter = uhost.clone();
    }

    let mut params = vec![name.clone()];
    if !text.is_empty() {
        params.push(text.clone());
    }
    let echo = Message::with_prefix(uhost, "TOPIC", params);
    d.deliver_to_channel_members(&name, &echo, None);

    let wire = Message::with_prefix(uid.as_str(), "TOPIC", vec![name, text]);
    d.forward_to_peers_except(None, &wire);
    Ok(())
}

fn away(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    let reason = msg.param(0).unwrap_or("").to_string();

    if let Some(user) = d.world.users.get_mut(uid) {
        user.away = reason.clone();
    }

    if reason.is_empty() {
        d.reply_user(uid, "305", vec!["You are no longer marked as being away".into()]);
        let wire = Message::with_prefix(uid.as_str(), "AWAY", vec![]);
        d.forward_to_peers_except(None, &wire);
    } else {
        d.reply_user(uid, "306", vec!["You have been marked as being away".into()]);
        let wire = Message::with_prefix(uid.as_str(), "AWAY", vec![reason]);
        d.forward_to_peers_except(None, &wire);
    }
    Ok(())
}

fn oper(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    if msg.params.len() < 2 {
        need_more_params(d, uid, "OPER");
        return Ok(());
    }

    let matched = d
        .config
        .opers
        .iter()
        .any(|o| o.name == msg.params[0] && o.password == msg.params[1]);
    if !matched {
        d.reply_user(uid, "464", vec!["Password incorrect".into()]);
        return Ok(());
    }

    let (uhost, nick) = match d.world.users.get_mut(uid) {
        Some(user) => {
            if user.is_oper() {
                return Ok(());
            }
            user.modes.insert('o');
            (user.uhost(), user.nick.clone())
        }
        None => return Ok(()),
    };
    d.world.opers.insert(uid.clone());

    d.reply_user(uid, "381", vec!["You are now an IRC operator".into()]);
    let echo = Message::with_prefix(uhost, "MODE", vec![nick.clone(), "+o".into()]);
    d.route_to_user(uid, echo);

    let wire = Message::with_prefix(
        uid.as_str(),
        "MODE",
        vec![uid.as_str().to_string(), "+o".into()],
    );
    d.forward_to_peers_except(None, &wire);

    let server = d.server_name().to_string();
    d.notice_opers(&format!("{}@{} became an operator.", nick, server));
    Ok(())
}

fn kill(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    if !require_oper(d, uid) {
        return Ok(());
    }
    if msg.params.len() < 2 {
        need_more_params(d, uid, "KILL");
        return Ok(());
    }

    let Some(target) = d.world.user_by_nick(&msg.params[0]) else {
        d.reply_user(
            uid,
            "401",
            vec![msg.params[0].clone(), "No such nick/channel".into()],
        );
        return Ok(());
    };
    let target_uid = target.uid.clone();
    let target_local = target.is_local();
    let reason = msg.params[1].clone();

    let Some(killer) = d.world.users.get(uid) else {
        return Ok(());
    };
    let killer_nick = killer.nick.clone();
    // The path names who issued the kill: server, host, user, nick.
    let path = format!(
        "{}!{}!{}!{}",
        d.server_name(),
        killer.hostname,
        killer.username,
        killer.nick
    );

    let wire = Message::with_prefix(
        uid.as_str(),
        "KILL",
        vec![
            target_uid.as_str().to_string(),
            format!("{} ({})", path, reason),
        ],
    );
    d.forward_to_peers_except(None, &wire);

    let quit_reason = format!("Killed ({} ({}))", killer_nick, reason);
    if target_local {
        d.quit_local_user_opts(&target_uid, &quit_reason, false);
    } else {
        d.quit_remote_user(&target_uid, &quit_reason);
    }

    let text = format!("{} killed {}: {}", killer_nick, msg.params[0], reason);
    d.notice_opers(&text);
    Ok(())
}

fn squit(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    if !require_oper(d, uid) {
        return Ok(());
    }
    if msg.params.is_empty() {
        need_more_params(d, uid, "SQUIT");
        return Ok(());
    }
    let reason = msg
        .param(1)
        .unwrap_or("Operator requested disconnect")
        .to_string();

    let Some(server) = d.world.server_by_name(&msg.params[0]) else {
        d.reply_user(
            uid,
            "402",
            vec![msg.params[0].clone(), "No such server".into()],
        );
        return Ok(());
    };
    let sid = server.sid.clone();
    let local_conn = server.conn;
    let via = server.via;

    if let Some(conn) = local_conn {
        let nick = d
            .world
            .users
            .get(uid)
            .map(|u| u.nick.clone())
            .unwrap_or_default();
        d.peer_delink(conn, &format!("{} issued SQUIT: {}", nick, reason));
        return Ok(());
    }

    // Remote target: send the SQUIT on its way; the delinking server
    // will tell the rest of the network.
    if let Some(via) = via {
        let wire = Message::with_prefix(
            uid.as_str(),
            "SQUIT",
            vec![sid.as_str().to_string(), reason],
        );
        d.send_to_conn(via, wire);
    }
    Ok(())
}

/// Parse `user@host` into its two mask halves.
fn split_userhost_mask(s: &str) -> Option<(String, String)> {
    let (user, host) = s.split_once('@')?;
    if !is_valid_user_mask(user) || !is_valid_host_mask(host) {
        return None;
    }
    Some((user.to_string(), host.to_string()))
}

fn kline(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    if !require_oper(d, uid) {
        return Ok(());
    }
    let Some(mask) = msg.param(0) else {
        need_more_params(d, uid, "KLINE");
        return Ok(());
    };
    let Some((user_mask, host_mask)) = split_userhost_mask(mask) else {
        d.server_notice(uid, format!("Invalid ban mask: {}", mask));
        return Ok(());
    };
    let reason = msg
        .param(1)
        .filter(|r| !r.is_empty())
        .unwrap_or("<No reason given>")
        .to_string();

    let source = d
        .world
        .users
        .get(uid)
        .map(|u| u.nick.clone())
        .unwrap_or_default();
    d.add_and_apply_kline(
        KLine {
            user_mask: user_mask.clone(),
            host_mask: host_mask.clone(),
            reason: reason.clone(),
        },
        &source,
    );

    // K-lines travel encapsulated; the duration field is carried but
    // every ban is for the life of the process.
    let wire = Message::with_prefix(
        uid.as_str(),
        "ENCAP",
        vec!["*".into(), "KLINE".into(), "0".into(), user_mask, host_mask, reason],
    );
    d.forward_to_peers_except(None, &wire);
    Ok(())
}

fn unkline(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    if !require_oper(d, uid) {
        return Ok(());
    }
    let Some(mask) = msg.param(0) else {
        need_more_params(d, uid, "UNKLINE");
        return Ok(());
    };
    let Some((user_mask, host_mask)) = split_userhost_mask(mask) else {
        d.server_notice(uid, format!("Invalid ban mask: {}", mask));
        return Ok(());
    };

    let source = d
        .world
        .users
        .get(uid)
        .map(|u| u.nick.clone())
        .unwrap_or_default();
    d.remove_kline(&user_mask, &host_mask, &source);

    let wire = Message::with_prefix(
        uid.as_str(),
        "ENCAP",
        vec!["*".into(), "UNKLINE".into(), user_mask, host_mask],
    );
    d.forward_to_peers_except(None, &wire);
    Ok(())
}

fn wallops(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    if !require_oper(d, uid) {
        return Ok(());
    }
    let Some(text) = msg.param(0) else {
        need_more_params(d, uid, &msg.command);
        return Ok(());
    };

    let uhost = match d.world.users.get(uid) {
        Some(user) => user.uhost(),
        None => return Ok(()),
    };
    let notice = Message::with_prefix(uhost, "WALLOPS", vec![text.to_string()]);
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

    let wire = Message::with_prefix(uid.as_str(), msg.command.clone(), vec![text.to_string()]);
    d.forward_to_peers_except(None, &wire);
    Ok(())
}

fn whois(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    let Some(nick) = msg.param(0) else {
        need_more_params(d, uid, "WHOIS");
        return Ok(());
    };

    let Some(target) = d.world.user_by_nick(nick) else {
        d.reply_user(
            uid,
            "401",
            vec![nick.to_string(), "No such nick/channel".into()],
        );
        return Ok(());
    };
    let target_uid = target.uid.clone();
    let target_nick = target.nick.clone();

    if target.is_local() {
        whois_view(d, uid, &target_uid);
        return Ok(());
    }

    // Route toward the target's server; the answer comes back as
    // numerics addressed to our UID.
    let wire = Message::with_prefix(
        uid.as_str(),
        "WHOIS",
        vec![target_uid.as_str().to_string(), target_nick],
    );
    d.route_to_user(&target_uid, wire);
    Ok(())
}

fn invite(d: &mut Dispatcher, uid: &Uid, msg: &Message) -> HandlerResult {
    if msg.params.len() < 2 {
        need_more_params(d, uid, "INVITE");
        return Ok(());
    }

    let Some(target) = d.world.user_by_nick(&msg.params[0]) else {
        d.reply_user(
            uid,
            "401",
            vec![msg.params[0].clone(), "No such nick/channel".into()],
        );
        return Ok(());
    };
    let target_uid = target.uid.clone();
    let target_nick = target.nick.clone();
    let target_local = target.is_local();

    let name = canonicalize_channel(&msg.params[1]);
    let Some(channel) = d.world.channels.get(&name) else {
        d.reply_user(uid, "403", vec![name, "No such channel".into()]);
        return Ok(());
    };
    let ts = channel.ts;

    if target_local {
        let uhost = match d.world.users.get(uid) {
            Some(user) => user.uhost(),
            None => return Ok(()),
        };
        let delivery = Message::with_prefix(uhost, "INVITE", vec![target_nick, name]);
        d.route_to_user(&target_uid, delivery);
    } else {
        let wire = Message::with_prefix(
            uid.as_str(),
            "INVITE",
            vec![target_uid.as_str().to_string(), name, ts.to_string()],
        );
        d.route_to_user(&target_uid, wire);
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Views
// ----------------------------------------------------------------------

pub(crate) fn lusers_view(d: &mut Dispatcher, uid: &Uid) {
    let total = d.world.users.len();
    let invisible = d
        .world
        .users
        .values()
        .filter(|u| u.modes.contains(&'i'))
        .count();
    let servers = d.world.servers.len() + 1;
    let opers = d.world.opers.len();
    let channels = d.world.channels.len();
    let local_users = d
        .sessions
        .values()
        .filter(|s| matches!(s, Session::User(_)))
        .count();
    let local_peers = d
        .sessions
        .values()
        .filter(|s| matches!(s, Session::Peer(_)))
        .count();

    d.reply_user(
        uid,
        "251",
        vec![format!(
            "There are {} users and {} invisible on {} servers",
            total - invisible,
            invisible,
            servers
        )],
    );
    d.reply_user(
        uid,
        "252",
        vec![opers.to_string(), "operator(s) online".into()],
    );
    d.reply_user(
        uid,
        "254",
        vec![channels.to_string(), "channels formed".into()],
    );
    d.reply_user(
        uid,
        "255",
        vec![format!(
            "I have {} clients and {} servers",
            local_users, local_peers
        )],
    );
}

pub(crate) fn motd_view(d: &mut Dispatcher, uid: &Uid) {
    let Some(motd) = d.config.motd_text() else {
        d.reply_user(uid, "422", vec!["MOTD File is missing".into()]);
        return;
    };

    d.reply_user(
        uid,
        "375",
        vec![format!("- {} Message of the day - ", d.server_name())],
    );
    for line in motd.lines() {
        d.reply_user(uid, "372", vec![format!("- {}", line)]);
    }
    d.reply_user(uid, "376", vec!["End of /MOTD command".into()]);
}

fn names_view(d: &mut Dispatcher, uid: &Uid, name: &str) {
    let Some(channel) = d.world.channels.get(name) else {
        return;
    };
    let mut entries: Vec<String> = channel
        .members
        .iter()
        .filter_map(|member| {
            let user = d.world.users.get(member)?;
            let mut entry = String::new();
            if channel.has_ops(member) {
                entry.push('@');
            }
            entry.push_str(&user.nick);
            Some(entry)
        })
        .collect();
    entries.sort_unstable();

    d.reply_user(
        uid,
        "353",
        vec!["=".into(), name.to_string(), entries.join(" ")],
    );
    d.reply_user(
        uid,
        "366",
        vec![name.to_string(), "End of /NAMES list".into()],
    );
}

/// The WHOIS reply for a locally known target, delivered to a local
/// requester.
pub(crate) fn whois_view(d: &mut Dispatcher, requester: &Uid, target: &Uid) {
    let Some(user) = d.world.users.get(target) else {
        return;
    };
    let nick = user.nick.clone();
    let username = user.username.clone();
    let hostname = user.hostname.clone();
    let realname = user.realname.clone();
    let away = user.away.clone();
    let server = if user.server == d.sid {
        (d.server_name().to_string(), d.config.server.description.clone())
    } else {
        d.world
            .servers
            .get(&user.server)
            .map(|s| (s.name.clone(), s.description.clone()))
            .unwrap_or_default()
    };

    d.reply_user(
        requester,
        "311",
        vec![nick.clone(), username, hostname, "*".into(), realname],
    );
    d.reply_user(requester, "312", vec![nick.clone(), server.0, server.1]);
    if !away.is_empty() {
        d.reply_user(requester, "301", vec![nick.clone(), away]);
    }
    d.reply_user(requester, "318", vec![nick, "End of /WHOIS list".into()]);
}

/// Parse a requested user-mode change against the current mode set and
/// apply what is legal. Returns the modes set, unset, and unrecognized.
///
/// `+o` by request is always dropped (only the operator login grants
/// it), `+C` requires `o`, and `-o` drags `C` down with it.
pub(crate) fn resolve_umode_changes(
    changes: &str,
    current: &mut BTreeSet<char>,
) -> (BTreeSet<char>, BTreeSet<char>, BTreeSet<char>) {
    let mut want_set = BTreeSet::new();
    let mut want_unset = BTreeSet::new();
    let mut unknown = BTreeSet::new();

    let mut action = '+';
    for c in changes.chars() {
        match c {
            '+' | '-' => action = c,
            'i' | 'o' | 'C' => {
                if action == '+' {
                    want_set.insert(c);
                } else {
                    want_unset.insert(c);
                }
            }
            other => {
                unknown.insert(other);
            }
        }
    }

    // Dropping o drops C, and blocks any request to set it.
    if want_unset.contains(&'o') {
        want_unset.insert('C');
        want_set.remove(&'C');
    }

    // Both set and unset is ambiguous; forget those.
    let ambiguous: Vec<char> = want_set.intersection(&want_unset).copied().collect();
    for c in ambiguous {
        want_set.remove(&c);
        want_unset.remove(&c);
    }

    let mut set = BTreeSet::new();
    let mut unset = BTreeSet::new();

    for c in want_unset {
        if current.remove(&c) {
            unset.insert(c);
        }
    }

    for c in want_set {
        if current.contains(&c) {
            continue;
        }
        match c {
            'o' => {}
            'C' => {
                if current.contains(&'o') {
                    current.insert(c);
                    set.insert(c);
                }
            }
            'i' => {
                current.insert(c);
                set.insert(c);
            }
            _ => {}
        }
    }

    (set, unset, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes(s: &str) -> BTreeSet<char> {
        s.chars().collect()
    }

    #[test]
    fn plain_set_defaults_to_plus() {
        let mut current = BTreeSet::new();
        let (set, unset, unknown) = resolve_umode_changes("i", &mut current);
        assert_eq!(set, modes("i"));
        assert!(unset.is_empty());
        assert!(unknown.is_empty());
        assert_eq!(current, modes("i"));
    }

    #[test]
    fn self_op_is_dropped() {
        let mut current = BTreeSet::new();
        let (set, _, _) = resolve_umode_changes("+o", &mut current);
        assert!(set.is_empty());
        assert!(current.is_empty());
    }

    #[test]
    fn c_requires_oper() {
        let mut current = BTreeSet::new();
        let (set, _, _) = resolve_umode_changes("+C", &mut current);
        assert!(set.is_empty());

        let mut current = modes("o");
        let (set, _, _) = resolve_umode_changes("+C", &mut current);
        assert_eq!(set, modes("C"));
        assert_eq!(current, modes("Co"));
    }

    #[test]
    fn dropping_o_drops_c() {
        let mut current = modes("Cio");
        let (set, unset, _) = resolve_umode_changes("-o", &mut current);
        assert!(set.is_empty());
        assert_eq!(unset, modes("Co"));
        assert_eq!(current, modes("i"));
    }

    #[test]
    fn set_and_unset_together_is_ignored() {
        let mut current = BTreeSet::new();
        let (set, unset, _) = resolve_umode_changes("+i-i", &mut current);
        assert!(set.is_empty());
        assert!(unset.is_empty());
    }

    #[test]
    fn unknown_modes_reported() {
        let mut current = BTreeSet::new();
        let (_, _, unknown) = resolve_umode_changes("+ix", &mut current);
        assert_eq!(unknown, modes("x"));
    }

    #[test]
    fn unset_missing_mode_is_no_change() {
        let mut current = BTreeSet::new();
        let (set, unset, _) = resolve_umode_changes("-i", &mut current);
        assert!(set.is_empty());
        assert!(unset.is_empty());
    }

    #[test]
    fn userhost_mask_split() {
        assert_eq!(
            split_userhost_mask("*@10.0.0.*"),
            Some(("*".to_string(), "10.0.0.*".to_string()))
        );
        assert!(split_userhost_mask("no-at-sign").is_none());
        assert!(split_userhost_mask("bad space@host").is_none());
    }
}
