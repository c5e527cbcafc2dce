//! State burst for a newly linked peer.
//!
//! Right after the handshake completes we dump our view of the network:
//! every server (ancestors before descendants), every user, every
//! channel, and topics if the peer speaks TB. The peer does the same in
//! the other direction; PING/PONG exchanges mark the ends.

use petrel_proto::Message;

use crate::dispatcher::Dispatcher;
use crate::event::ConnId;

/// An IP literal that would read as a trailing sigil on the wire gets a
/// `0` prepended (`::1` -> `0::1`).
pub fn encode_ip(ip: &str) -> String {
    if ip.starts_with(':') {
        format!("0{}", ip)
    } else {
        ip.to_string()
    }
}

/// Send the full burst to a newly registered peer.
pub fn send_burst(d: &mut Dispatcher, conn: ConnId) {
    let mut out: Vec<Message> = Vec::new();
    let our_sid = d.sid.as_str().to_string();

    // Servers, ascending by hop count so every server's uplink has been
    // introduced before the server itself. The new peer is not told about
    // itself.
    for server in d.world.servers_by_hop_count() {
        if server.conn == Some(conn) {
            continue;
        }
        out.push(Message::with_prefix(
            server.linked_to.as_str(),
            "SID",
            vec![
                server.name.clone(),
                (server.hop_count + 1).to_string(),
                server.sid.as_str().to_string(),
                server.description.clone(),
            ],
        ));
        let capabs = server.capabs_string();
        if !capabs.is_empty() {
            out.push(Message::with_prefix(
                server.sid.as_str(),
                "ENCAP",
                vec!["*".to_string(), "GCAP".to_string(), capabs],
            ));
        }
    }

    // Users. The prefix names the server each user is on; hop counts grow
    // by one on the wire.
    for user in d.world.users.values() {
        out.push(Message::with_prefix(
            user.server.as_str(),
            "UID",
            vec![
                user.nick.clone(),
                (user.hop_count + 1).to_string(),
                user.nick_ts.to_string(),
                user.modes_string(),
                user.username.clone(),
                user.hostname.clone(),
                encode_ip(&user.ip),
                user.uid.as_str().to_string(),
                user.realname.clone(),
            ],
        ));
        if !user.away.is_empty() {
            out.push(Message::with_prefix(
                user.uid.as_str(),
                "AWAY",
                vec![user.away.clone()],
            ));
        }
    }

    // Channels: one or more SJOINs each, packing as many members as fit
    // under the line limit.
    let peer_has_tb = d
        .sessions
        .get(&conn)
        .and_then(crate::dispatcher::session::Session::as_peer)
        .map(|peer| peer.sid.clone())
        .and_then(|sid| d.world.servers.get(&sid))
        .is_some_and(|server| server.has_capab("TB"));

    let mut unencodable: Option<String> = None;
    for channel in d.world.channels.values() {
        let base = Message::with_prefix(
            our_sid.clone(),
            "SJOIN",
            vec![
                channel.ts.to_string(),
                channel.name.clone(),
                channel.modes_string(),
                String::new(),
            ],
        );
        let Ok(encoded) = base.encode() else {
            unencodable = Some(channel.name.clone());
            break;
        };
        let base_size = encoded.len();

        let mut uids = String::new();
        for member in &channel.members {
            let mut entry = String::new();
            if channel.has_ops(member) {
                entry.push('@');
            }
            entry.push_str(member.as_str());

            if uids.is_empty() {
                uids = entry;
                continue;
            }
            if base_size + uids.len() + 1 + entry.len() > petrel_proto::MAX_LINE_LEN {
                let mut msg = base.clone();
                msg.params[3] = std::mem::take(&mut uids);
                out.push(msg);
                uids = entry;
                continue;
            }
            uids.push(' ');
            uids.push_str(&entry);
        }
        if !uids.is_empty() {
            let mut msg = base.clone();
            msg.params[3] = uids;
            out.push(msg);
        }

        if peer_has_tb && !channel.topic.is_empty() {
            out.push(Message::with_prefix(
                our_sid.clone(),
                "TB",
                vec![
                    channel.name.clone(),
                    channel.topic_ts.to_string(),
                    channel.topic_setter.clone(),
                    channel.topic.clone(),
                ],
            ));
        }
    }

    // A channel whose SJOIN skeleton cannot be represented means the
    // peer's view would diverge from ours; give up on the link instead.
    if let Some(name) = unencodable {
        d.peer_delink(conn, &format!("Unable to encode SJOIN for {}", name));
        return;
    }

    for msg in out {
        d.send_to_conn(conn, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literals_never_start_with_a_sigil() {
        assert_eq!(encode_ip("::1"), "0::1");
        assert_eq!(encode_ip("10.1.2.3"), "10.1.2.3");
        assert_eq!(encode_ip("0"), "0");
        assert_eq!(encode_ip("2001:db8::2"), "2001:db8::2");
    }
}
