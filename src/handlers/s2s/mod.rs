//! Commands arriving from linked peer servers.
//!
//! A handler applies the change locally when it is news, then forwards
//! the original message to every other peer; hop counts are bumped by
//! one on the wire where they appear. Peers apply the same rules, so
//! forwarded messages need no further modification unless stated.

mod channels;
mod encap;
mod routing;
mod servers;
mod users;

use petrel_proto::Message;

use crate::dispatcher::session::Session;
use crate::dispatcher::Dispatcher;
use crate::error::HandlerResult;
use crate::event::ConnId;

pub fn handle(d: &mut Dispatcher, conn: ConnId, mut msg: Message) -> HandlerResult {
    let Some(peer) = d.sessions.get(&conn).and_then(Session::as_peer) else {
        return Ok(());
    };

    // A missing prefix means the directly linked peer itself; fill it in
    // so handlers need not care.
    if msg.prefix.is_none() {
        msg.prefix = Some(peer.sid.as_str().to_string());
    }

    match msg.command.as_str() {
        "PING" => routing::ping(d, conn, &msg),
        "PONG" => routing::pong(d, conn, &msg),
        "ERROR" => servers::error(d, conn, &msg),
        "UID" => users::uid(d, conn, &msg),
        "NICK" => users::nick(d, conn, &msg),
        "QUIT" => users::quit(d, conn, &msg),
        "KILL" => users::kill(d, conn, &msg),
        "AWAY" => users::away(d, conn, &msg),
        "MODE" => users::mode(d, conn, &msg),
        "SID" => servers::sid(d, conn, &msg),
        "SQUIT" => servers::squit(d, conn, &msg),
        "SJOIN" => channels::sjoin(d, conn, &msg),
        "JOIN" => channels::join(d, conn, &msg),
        "PART" => channels::part(d, conn, &msg),
        "TMODE" => channels::tmode(d, conn, &msg),
        "TOPIC" => channels::topic(d, conn, &msg),
        "TB" => channels::tb(d, conn, &msg),
        "INVITE" => channels::invite(d, conn, &msg),
        "PRIVMSG" | "NOTICE" => routing::privmsg(d, conn, &msg),
        "ENCAP" => encap::encap(d, conn, &msg),
        "WHOIS" => routing::whois(d, conn, &msg),
        "WALLOPS" | "OPERWALL" => routing::wallops(d, conn, &msg),
        "CLICONN" => {
            d.forward_to_peers_except(Some(conn), &msg);
            Ok(())
        }
        _ if msg.is_numeric() => routing::numeric(d, conn, &msg),
        _ => {
            d.reply_peer(
                conn,
                "421",
                vec![msg.command.clone(), "Unknown command".into()],
            );
            Ok(())
        }
    }
}

/// Shorthand for the 461 reply to a peer.
pub(crate) fn need_more_params(d: &mut Dispatcher, conn: ConnId, command: &str) {
    d.reply_peer(
        conn,
        "461",
        vec![command.to_string(), "Not enough parameters".into()],
    );
}
