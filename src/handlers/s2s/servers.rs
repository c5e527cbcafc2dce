//! Server topology commands: SID introductions, SQUIT delinks, ERROR.

use petrel_proto::Message;

use crate::dispatcher::Dispatcher;
use crate::error::{HandlerError, HandlerResult};
use crate::event::ConnId;
use crate::state::ident::is_valid_sid;
use crate::state::server::Server;
use crate::state::uid::{Sid, Uid};

/// SID introduces a server somewhere behind the peer.
pub fn sid(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <server name> <hop count> <SID> <description>
    if msg.params.len() < 4 {
        super::need_more_params(d, conn, "SID");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("");
    let Some(linked_to) = d.world.servers.get(&Sid::new(prefix)) else {
        return Err(HandlerError::violation(format!(
            "Unknown origin (SID) {}",
            prefix
        )));
    };
    let linked_to_sid = linked_to.sid.clone();

    let name = msg.params[0].clone();
    let Ok(hop_count) = msg.params[1].parse::<u32>() else {
        return Err(HandlerError::violation("Invalid hop count"));
    };
    if !is_valid_sid(&msg.params[2]) {
        return Err(HandlerError::violation("Invalid SID"));
    }
    let new_sid = Sid::new(msg.params[2].clone());
    let description = msg.params[3].clone();

    // Hearing about a server we already know (or ourselves) means two
    // sides linked it at the "same" time; delink rather than guess.
    if let Some(known) = d.world.servers.get(&new_sid) {
        return Err(HandlerError::violation(format!(
            "I was sent SID for {}, but I already know it!",
            known.name
        )));
    }
    if new_sid == d.sid {
        return Err(HandlerError::violation("I was sent SID with my own SID!"));
    }

    d.world.servers.insert(
        new_sid.clone(),
        Server {
            sid: new_sid,
            name: name.clone(),
            description,
            hop_count,
            capabs: None,
            conn: None,
            via: Some(conn),
            linked_to: linked_to_sid,
        },
    );

    // Peers beyond us see it one hop further.
    let mut wire = msg.clone();
    wire.params[1] = (hop_count + 1).to_string();
    d.forward_to_peers_except(Some(conn), &wire);

    let introducer = d
        .sessions
        .get(&conn)
        .and_then(crate::dispatcher::session::Session::as_peer)
        .map(|p| p.name.clone())
        .unwrap_or_default();
    d.notice_opers(&format!("{} is introducing server {}", introducer, name));
    Ok(())
}

/// SQUIT: an operator or a server is taking a server off the network.
pub fn squit(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // <target SID> <reason>
    if msg.params.len() < 2 {
        super::need_more_params(d, conn, "SQUIT");
        return Ok(());
    }

    let prefix = msg.prefix.as_deref().unwrap_or("").to_string();
    let reason = msg.params[1].clone();

    let Some(target) = d.world.servers.get(&Sid::new(msg.params[0].clone())) else {
        return Err(HandlerError::violation(format!(
            "{} issued SQUIT for unknown server {}",
            prefix, msg.params[0]
        )));
    };
    let target_sid = target.sid.clone();
    let target_name = target.name.clone();
    let target_conn = target.conn;
    let target_via = target.via;
    let target_upstream = target.linked_to.clone();

    // An operator's SQUIT for one of our peers delinks it here; for a
    // remote target we pass it toward the server that can.
    if let Some(source) = d.world.users.get(&Uid::new(prefix.clone())) {
        let source_nick = source.nick.clone();
        if !d.world.opers.contains(&source.uid) {
            return Err(HandlerError::violation(format!(
                "SQUIT for {} from non-operator {}",
                target_name, source_nick
            )));
        }
        if source.is_local() {
            // Local operators speak to us directly, not via a peer.
            return Err(HandlerError::violation(format!(
                "SQUIT for {} from local operator {}",
                target_name, source_nick
            )));
        }

        if let Some(target_conn) = target_conn {
            d.peer_delink(
                target_conn,
                &format!("{} issued SQUIT: {}", source_nick, reason),
            );
            return Ok(());
        }

        if let Some(via) = target_via {
            d.send_to_conn(via, msg.clone());
        }
        return Ok(());
    }

    // Otherwise the source must be a server telling us about a delink
    // somewhere behind it.
    if !d.world.servers.contains_key(&Sid::new(prefix.clone())) {
        return Err(HandlerError::violation(format!(
            "SQUIT from unknown server: {}",
            prefix
        )));
    }
    if target_conn.is_some() {
        // A local peer delink reaches us as an ERROR from the peer, not
        // as a remote SQUIT.
        return Err(HandlerError::violation(format!(
            "I was asked to SQUIT local server {}",
            target_name
        )));
    }

    let upstream_name = d
        .world
        .servers
        .get(&target_upstream)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| d.server_name().to_string());

    crate::sync::split::server_split_cleanup(d, &target_sid);

    d.forward_to_peers_except(Some(conn), msg);

    d.notice_opers(&format!(
        "{} delinked from {}: {}",
        target_name, upstream_name, reason
    ));
    Ok(())
}

/// ERROR from a peer ends the link; the text is theirs.
pub fn error(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    let name = d
        .sessions
        .get(&conn)
        .and_then(crate::dispatcher::session::Session::as_peer)
        .map(|p| p.name.clone())
        .unwrap_or_default();

    if msg.params.len() != 1 {
        return Err(HandlerError::violation(format!(
            "ERROR from {} with invalid number of parameters: {}",
            name,
            msg.params.len()
        )));
    }
    Err(HandlerError::violation(format!(
        "ERROR from {}: {}",
        name, msg.params[0]
    )))
}
