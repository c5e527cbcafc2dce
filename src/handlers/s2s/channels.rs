//! Channel commands from peers: burst joins, single joins, parts, modes,
//! topics, invites. Channel timestamps arbitrate every conflict.

use petrel_proto::Message;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::error::{HandlerError, HandlerResult};
use crate::event::ConnId;
use crate::state::channel::Channel;
use crate::state::ident::{
    self, canonicalize_channel, comma_channels, is_valid_channel,
};
use crate::state::uid::{Sid, Uid};

/// SJOIN arrives during bursts and whenever a channel is created.
///
/// TS arbitration: a newer incoming TS keeps our modes and strips their
/// prefixes; an older incoming TS wipes our modes and ops and adopts
/// their TS; equal applies both sides additively.
pub fn sjoin(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <channel TS> <channel> <modes> [mode params] <prefixed UIDs>
    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(source) = d.world.servers.get(&Sid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown server (SJOIN)"));
    };
    let source_name = source.name.clone();

    if msg.params.len() < 4 {
        super::need_more_params(d, conn, "SJOIN");
        return Ok(());
    }

    let Ok(channel_ts) = msg.params[0].parse::<i64>() else {
        return Err(HandlerError::violation(format!(
            "Invalid channel TS: {}",
            msg.params[0]
        )));
    };

    let name = canonicalize_channel(&msg.params[1]);
    if !is_valid_channel(&name) {
        // Stay lenient about what channels exist elsewhere.
        d.reply_peer(conn, "403", vec![name, "Invalid channel name".into()]);
        return Ok(());
    }

    let existed = d.world.channels.contains_key(&name);
    let channel = d
        .world
        .channels
        .entry(name.clone())
        .or_insert_with(|| Channel::new(name.clone(), channel_ts));

    let accept_modes = channel_ts <= channel.ts;
    if channel_ts < channel.ts {
        channel.clear_modes();
        channel.ts = channel_ts;
    }

    let mut set_modes = String::new();
    if accept_modes {
        for c in msg.params[2].chars() {
            if matches!(c, 'n' | 's') && channel.modes.insert(c) {
                set_modes.push(c);
            }
        }
    }
    if !set_modes.is_empty() {
        let mode = Message::with_prefix(
            source_name.clone(),
            "MODE",
            vec![name.clone(), format!("+{}", set_modes)],
        );
        d.deliver_to_channel_members(&name, &mode, None);
    }

    // The member list is always the final parameter.
    let member_list = msg.params[msg.params.len() - 1].clone();
    for entry in member_list.split_whitespace() {
        let opped = accept_modes && entry.starts_with('@');
        let raw_uid = entry.trim_start_matches(['@', '+']);

        let Some(member) = d.world.users.get_mut(&Uid::new(raw_uid)) else {
            // A collision can have removed the user between their server
            // sending this and us reading it.
            debug!(uid = raw_uid, channel = %name, "SJOIN for unknown user, skipping");
            continue;
        };
        let uid = member.uid.clone();
        let uhost = member.uhost();
        member.channels.insert(name.clone());

        let Some(channel) = d.world.channels.get_mut(&name) else {
            break;
        };
        channel.members.insert(uid.clone());
        if opped {
            channel.grant_ops(uid.clone());
        }

        let join = Message::with_prefix(uhost, "JOIN", vec![name.clone()]);
        d.deliver_to_channel_members(&name, &join, None);
        if opped {
            let nick = d
                .world
                .users
                .get(&uid)
                .map(|u| u.nick.clone())
                .unwrap_or_default();
            let mode = Message::with_prefix(
                source_name.clone(),
                "MODE",
                vec![name.clone(), "+o".into(), nick],
            );
            d.deliver_to_channel_members(&name, &mode, None);
        }
    }

    // A channel created just now for members we ended up skipping must
    // not linger empty.
    if !existed {
        let empty = d
            .world
            .channels
            .get(&name)
            .is_some_and(|c| c.members.is_empty());
        if empty {
            d.world.channels.remove(&name);
        }
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// Post-burst single-user join, or `JOIN 0` to part everything.
pub fn join(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    if msg.params.is_empty() {
        super::need_more_params(d, conn, "JOIN");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(user) = d.world.users.get(&Uid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown UID (JOIN)"));
    };
    let uid = user.uid.clone();

    if msg.params[0] == "0" {
        let channels: Vec<String> = d
            .world
            .users
            .get(&uid)
            .map(|u| u.channels.iter().cloned().collect())
            .unwrap_or_default();
        for name in channels {
            part_member(d, &uid, &name, "");
        }
        d.forward_to_peers_except(Some(conn), msg);
        return Ok(());
    }

    // <channel TS> <channel> +
    if msg.params.len() < 3 {
        super::need_more_params(d, conn, "JOIN");
        return Ok(());
    }

    let Ok(channel_ts) = msg.params[0].parse::<i64>() else {
        return Err(HandlerError::violation("Invalid TS (JOIN)"));
    };

    let name = canonicalize_channel(&msg.params[1]);
    if !is_valid_channel(&name) {
        d.reply_peer(conn, "403", vec![name, "Invalid channel name".into()]);
        return Ok(());
    }

    if msg.params[2] != "+" {
        return Err(HandlerError::violation("Invalid JOIN command. No +"));
    }

    let channel = d
        .world
        .channels
        .entry(name.clone())
        .or_insert_with(|| Channel::new(name.clone(), channel_ts));

    // An older TS on their side wipes our modes and statuses; local
    // users are not told, peers work it out themselves.
    if channel_ts < channel.ts {
        channel.clear_modes();
        channel.ts = channel_ts;
    }
    channel.members.insert(uid.clone());

    let uhost = match d.world.users.get_mut(&uid) {
        Some(user) => {
            user.channels.insert(name.clone());
            user.uhost()
        }
        None => return Ok(()),
    };

    let join = Message::with_prefix(uhost, "JOIN", vec![name.clone()]);
    d.deliver_to_channel_members(&name, &join, None);

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// Remove a member from one channel, tell local members, drop the
/// channel when it empties. No propagation.
fn part_member(d: &mut Dispatcher, uid: &Uid, name: &str, reason: &str) {
    let Some(user) = d.world.users.get(uid) else {
        return;
    };
    let uhost = user.uhost();

    let mut params = vec![name.to_string()];
    if !reason.is_empty() {
        params.push(reason.to_string());
    }
    let part = Message::with_prefix(uhost, "PART", params);
    d.deliver_to_channel_members(name, &part, None);

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

pub fn part(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <comma separated channels> [message]
    if msg.params.is_empty() {
        super::need_more_params(d, conn, "PART");
        return Ok(());
    }
    let reason = msg.param(1).unwrap_or("").to_string();

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(user) = d.world.users.get(&Uid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown user (PART)"));
    };
    let uid = user.uid.clone();

    for name in comma_channels(&msg.params[0]) {
        if !d.world.channels.contains_key(&name) {
            return Err(HandlerError::violation("Unknown channel (PART)"));
        }
        part_member(d, &uid, &name, &reason);
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// TMODE propagates a channel mode change, guarded by the channel TS.
/// Only op grants and removals exist here; each consumes one parameter.
pub fn tmode(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <channel TS> <channel> <changes> [params...]
    if msg.params.len() < 3 {
        super::need_more_params(d, conn, "TMODE");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let origin = d
        .world
        .users
        .get(&Uid::new(prefix))
        .map(|u| u.uhost())
        .or_else(|| {
            d.world
                .servers
                .get(&Sid::new(prefix))
                .map(|s| s.name.clone())
        });
    let Some(origin) = origin else {
        return Err(HandlerError::violation("Unknown origin (TMODE)"));
    };

    let Ok(channel_ts) = msg.params[0].parse::<i64>() else {
        return Err(HandlerError::violation(format!(
            "Invalid channel TS: {}",
            msg.params[0]
        )));
    };

    let name = canonicalize_channel(&msg.params[1]);
    let Some(channel) = d.world.channels.get(&name) else {
        return Err(HandlerError::violation("Unknown channel (TMODE)"));
    };

    if channel_ts > channel.ts {
        debug!(channel = %name, "TMODE with newer TS, ignoring");
        return Ok(());
    }

    let mut action = '+';
    let mut param_idx = 3;
    let mut applied = String::new();
    let mut applied_action = ' ';
    let mut applied_nicks: Vec<String> = Vec::new();

    let changes = msg.params[2].clone();
    for c in changes.chars() {
        match c {
            '+' | '-' => action = c,
            'o' => {
                let Some(raw_uid) = msg.params.get(param_idx) else {
                    break;
                };
                param_idx += 1;

                let Some(target) = d.world.users.get(&Uid::new(raw_uid.clone())) else {
                    break;
                };
                let target_uid = target.uid.clone();
                let target_nick = target.nick.clone();
                if !target.channels.contains(&name) {
                    break;
                }

                let Some(channel) = d.world.channels.get_mut(&name) else {
                    break;
                };
                if action == '+' {
                    if channel.has_ops(&target_uid) {
                        continue;
                    }
                    channel.grant_ops(target_uid);
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
            }
            _ => {}
        }
    }

    if !applied.is_empty() {
        let mut params = vec![name.clone(), applied];
        params.extend(applied_nicks);
        let mode = Message::with_prefix(origin, "MODE", params);
        d.deliver_to_channel_members(&name, &mode, None);
    }

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// A topic change by a remote user.
pub fn topic(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <channel> [topic]
    if msg.params.is_empty() {
        super::need_more_params(d, conn, "TOPIC");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(user) = d.world.users.get(&Uid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown source user (TOPIC)"));
    };
    let uhost = user.uhost();

    let name = canonicalize_channel(&msg.params[0]);
    if !d.world.channels.contains_key(&name) {
        d.reply_peer(conn, "403", vec![name, "No such channel".into()]);
        return Ok(());
    }

    let mut text = msg.param(1).unwrap_or("").to_string();
    if text.len() > ident::MAX_TOPIC_LEN {
        let mut cut = ident::MAX_TOPIC_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }

    let now = d.now();
    if let Some(channel) = d.world.channels.get_mut(&name) {
        channel.topic = text.clone();
        channel.topic_ts = now;
        channel.topic_setter = uhost.clone();
    }

    let mut params = vec![name.clone()];
    if !text.is_empty() {
        params.push(text);
    }
    let echo = Message::with_prefix(uhost, "TOPIC", params);
    d.deliver_to_channel_members(&name, &echo, None);

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// TB bursts a topic. It is taken only when we have no topic, or when
/// the incoming one is older than ours.
pub fn tb(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <channel> <topic TS> [setter] <topic>
    if msg.params.len() < 3 {
        super::need_more_params(d, conn, "TB");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(server) = d.world.servers.get(&Sid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown server (TB)"));
    };
    let server_name = server.name.clone();

    let name = canonicalize_channel(&msg.params[0]);
    if !d.world.channels.contains_key(&name) {
        return Err(HandlerError::violation("Unknown channel (TB)"));
    }

    let Ok(topic_ts) = msg.params[1].parse::<i64>() else {
        return Err(HandlerError::violation("Invalid topic TS (TB)"));
    };

    let setter = if msg.params.len() >= 4 {
        msg.params[2].clone()
    } else {
        server_name
    };
    let mut text = if msg.params.len() >= 4 {
        msg.params[3].clone()
    } else {
        msg.params[2].clone()
    };
    if text.len() > ident::MAX_TOPIC_LEN {
        let mut cut = ident::MAX_TOPIC_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }

    {
        let Some(channel) = d.world.channels.get_mut(&name) else {
            return Ok(());
        };
        if text == channel.topic {
            return Ok(());
        }
        // Ours stands unless it is unset or strictly newer than theirs.
        let accept = channel.topic.is_empty() || topic_ts < channel.topic_ts;
        if !accept {
            return Ok(());
        }
        channel.topic = text.clone();
        channel.topic_setter = setter.clone();
        channel.topic_ts = topic_ts;
    }

    let echo = Message::with_prefix(setter, "TOPIC", vec![name.clone(), text]);
    d.deliver_to_channel_members(&name, &echo, None);

    d.forward_to_peers_except(Some(conn), msg);
    Ok(())
}

/// INVITE routed toward its target. An optional trailing channel TS is
/// honored: a newer incoming TS means their channel is not ours.
pub fn invite(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <target UID> <channel> [channel TS]
    if msg.params.len() < 2 {
        super::need_more_params(d, conn, "INVITE");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(source) = d.world.users.get(&Uid::new(prefix)) else {
        return Err(HandlerError::violation("Unknown source user (INVITE)"));
    };
    let source_nick = source.nick.clone();
    let source_uhost = source.uhost();

    let Some(target) = d.world.users.get(&Uid::new(msg.params[0].clone())) else {
        return Err(HandlerError::violation("Unknown target user (INVITE)"));
    };
    let target_uid = target.uid.clone();
    let target_nick = target.nick.clone();
    let target_local = target.is_local();

    let name = canonicalize_channel(&msg.params[1]);
    let Some(channel) = d.world.channels.get(&name) else {
        return Err(HandlerError::violation("Unknown channel (INVITE)"));
    };
    let our_ts = channel.ts;

    if let Some(raw_ts) = msg.param(2) {
        let Ok(channel_ts) = raw_ts.parse::<i64>() else {
            return Err(HandlerError::violation(format!(
                "Invalid channel TS: {}",
                raw_ts
            )));
        };
        if channel_ts > our_ts {
            let text = format!(
                "INVITE from {} to {} for {} has newer TS",
                source_nick, target_nick, name
            );
            d.notice_opers(&text);
            return Ok(());
        }
    }

    if target_local {
        let delivery =
            Message::with_prefix(source_uhost, "INVITE", vec![target_nick, name]);
        d.route_to_user(&target_uid, delivery);
        return Ok(());
    }

    d.route_to_user(&target_uid, msg.clone());
    Ok(())
}
