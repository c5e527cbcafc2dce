//! Pre-registration handling.
//!
//! A fresh connection becomes a user via NICK + USER, or a peer server
//! via the TS6 handshake: PASS, CAPAB, SERVER, SVINFO (with our own
//! PASS/CAPAB/SERVER going out up front when we dialed, or in reply to
//! theirs when they did). Registration completes at SVINFO.

use std::collections::BTreeSet;
use std::collections::HashSet;

use petrel_proto::Message;
use tracing::info;

use crate::dispatcher::session::{LocalPeer, Pending, Session};
use crate::dispatcher::{Dispatcher, FLOOD_CREDIT};
use crate::error::{HandlerError, HandlerResult};
use crate::event::ConnId;
use crate::state::ident::{
    self, canonicalize_nick, is_valid_nick, is_valid_sid, is_valid_username,
};
use crate::state::server::Server;
use crate::state::uid::Sid;
use crate::state::user::User;
use crate::sync::burst;

/// Our capabilities, advertised in CAPAB. QS and ENCAP are the TS6
/// baseline; TB lets peers burst topics at us.
const OUR_CAPABS: &str = "QS ENCAP TB";

/// Maximum clock skew tolerated at SVINFO, in seconds.
const MAX_CLOCK_SKEW: i64 = 60;

pub fn handle(d: &mut Dispatcher, conn: ConnId, msg: Message) -> HandlerResult {
    // Clients should not send a prefix before they are anyone.
    if msg.prefix.is_some() {
        return Err(HandlerError::violation("No prefix permitted"));
    }

    match msg.command.as_str() {
        // Widely sent by clients; harmless to ignore here.
        "CAP" => Ok(()),
        // Servers we dial may NOTICE us before the handshake.
        "NOTICE" => Ok(()),
        "NICK" => nick(d, conn, &msg),
        "USER" => user(d, conn, &msg),
        "PASS" => pass(d, conn, &msg),
        "CAPAB" => capab(d, conn, &msg),
        "SERVER" => server(d, conn, &msg),
        "SVINFO" => svinfo(d, conn, &msg),
        "ERROR" => Err(HandlerError::violation("Bye")),
        "QUIT" => {
            d.terminate_pending(conn, "Client quit");
            Ok(())
        }
        _ => {
            d.reply_pending(conn, "451", vec!["You have not registered".into()]);
            Ok(())
        }
    }
}

fn pending_mut<'a>(d: &'a mut Dispatcher, conn: ConnId) -> Option<&'a mut Pending> {
    match d.sessions.get_mut(&conn) {
        Some(Session::Pending(pending)) => Some(pending),
        _ => None,
    }
}

/// Truncate to at most `len` bytes on a char boundary.
fn truncate(s: &str, len: usize) -> &str {
    if s.len() <= len {
        return s;
    }
    let mut cut = len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

fn nick(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    let Some(raw) = msg.param(0) else {
        d.reply_pending(conn, "431", vec!["No nickname given".into()]);
        return Ok(());
    };

    let max = d.config.server.max_nick_length;
    let nick = truncate(raw, max).to_string();

    if !is_valid_nick(max, &nick) {
        d.reply_pending(conn, "432", vec![nick, "Erroneous nickname".into()]);
        return Ok(());
    }

    if d.world.nicks.contains_key(&canonicalize_nick(&nick)) {
        d.reply_pending(
            conn,
            "433",
            vec![nick, "Nickname is already in use".into()],
        );
        return Ok(());
    }

    // The nick is not reserved until registration completes; a clash at
    // that point is caught again.
    let Some(pending) = pending_mut(d, conn) else {
        return Ok(());
    };
    pending.nick = Some(nick);

    if pending.username.is_some() {
        return register_user(d, conn);
    }
    Ok(())
}

fn user(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    if msg.params.len() != 4 {
        d.reply_pending(
            conn,
            "461",
            vec!["USER".into(), "Not enough parameters".into()],
        );
        return Ok(());
    }

    let username = format!("~{}", msg.params[0]);
    let username = truncate(&username, ident::MAX_USERNAME_LEN).to_string();
    if !is_valid_username(&username) {
        d.reply_pending(conn, "ERROR", vec!["Invalid username".into()]);
        return Ok(());
    }

    let realname = &msg.params[3];
    if realname.len() > 64 {
        d.reply_pending(conn, "ERROR", vec!["Invalid realname".into()]);
        return Ok(());
    }
    let realname = truncate(realname, ident::MAX_REALNAME_LEN).to_string();

    let Some(pending) = pending_mut(d, conn) else {
        return Ok(());
    };
    pending.username = Some(username);
    pending.realname = Some(realname);

    if pending.nick.is_some() {
        return register_user(d, conn);
    }
    Ok(())
}

/// NICK and USER are both in: promote the connection to a local user.
fn register_user(d: &mut Dispatcher, conn: ConnId) -> HandlerResult {
    let Some(pending) = pending_mut(d, conn) else {
        return Ok(());
    };
    let Some(nick) = pending.nick.clone() else {
        return Ok(());
    };

    // The nick was never reserved; somebody may have taken it meanwhile.
    if d.world.nicks.contains_key(&canonicalize_nick(&nick)) {
        d.reply_pending(
            conn,
            "433",
            vec![nick, "Nickname is already in use".into()],
        );
        return Ok(());
    }

    let uid = d.uid_gen.next_uid()?;

    let Some(Session::Pending(pending)) = d.sessions.remove(&conn) else {
        return Ok(());
    };
    let ip = pending.conn.ip();
    let hostname = pending.hostname.clone().unwrap_or_else(|| ip.clone());
    let now = d.now();

    let mut user = User {
        nick: nick.clone(),
        hop_count: 0,
        nick_ts: now,
        modes: BTreeSet::new(),
        username: pending.username.clone().unwrap_or_default(),
        hostname,
        ip,
        uid: uid.clone(),
        realname: pending.realname.clone().unwrap_or_default(),
        away: String::new(),
        channels: HashSet::new(),
        flood_exempt: false,
        conn: Some(conn),
        via: None,
        server: d.sid.clone(),
    };

    // First matching user rule wins; it may spoof the host and grant
    // flood exemption.
    for rule in &d.config.users {
        if user.matches_mask(&rule.user_mask, &rule.host_mask) {
            if let Some(spoof) = &rule.spoof_host {
                user.hostname = spoof.clone();
            }
            user.flood_exempt = rule.flood_exempt;
            break;
        }
    }

    // K-lines apply before the user exists anywhere.
    if let Some(kline) = d.world.klines.iter().find(|k| k.matches(&user)) {
        let reason = kline.reason.clone();
        let mut session = Session::Pending(pending);
        session.conn_mut().send(Message::with_prefix(
            d.server_name(),
            "465",
            vec![
                nick,
                format!("You are banned from this server- {}", reason),
            ],
        ));
        session
            .conn_mut()
            .send(Message::new("ERROR", vec![format!("Closing Link: {}", reason)]));
        return Ok(());
    }

    info!(nick = %user.nick, uid = %uid, "user registered");

    let uhost = user.uhost();
    d.sessions.insert(
        conn,
        Session::User(crate::dispatcher::session::LocalUser {
            conn: pending.conn,
            uid: uid.clone(),
            last_activity: now,
            ping_sent: false,
            flood_credit: FLOOD_CREDIT,
        }),
    );
    d.world.insert_user(user);

    d.reply_user(
        &uid,
        "001",
        vec![format!(
            "Welcome to the Internet Relay Network {}",
            uhost
        )],
    );
    d.reply_user(
        &uid,
        "002",
        vec![format!(
            "Your host is {}, running version {}",
            d.server_name(),
            d.info.version
        )],
    );
    d.reply_user(
        &uid,
        "003",
        vec![format!("This server was created {}", d.info.created)],
    );
    d.reply_user(
        &uid,
        "004",
        vec![
            d.server_name().to_string(),
            d.info.version.clone(),
            "ioC".into(),
            "ns".into(),
        ],
    );

    crate::handlers::local::lusers_view(d, &uid);
    crate::handlers::local::motd_view(d, &uid);

    // Everyone starts invisible.
    if let Some(user) = d.world.users.get_mut(&uid) {
        user.modes.insert('i');
    }
    let mode_echo = Message::with_prefix(uhost, "MODE", vec![nick_of(d, &uid), "+i".into()]);
    d.send_to_conn(conn, mode_echo);

    // Introduce the new user to the mesh.
    let (wire, cliconn) = {
        let user = &d.world.users[&uid];
        (
            Message::with_prefix(
                d.sid.as_str(),
                "UID",
                vec![
                    user.nick.clone(),
                    "1".into(),
                    user.nick_ts.to_string(),
                    user.modes_string(),
                    user.username.clone(),
                    user.hostname.clone(),
                    burst::encode_ip(&user.ip),
                    uid.as_str().to_string(),
                    user.realname.clone(),
                ],
            ),
            format!(
                "CLICONN {} {} {} {} {} ({})",
                user.nick,
                user.username,
                user.hostname,
                user.ip,
                user.realname,
                d.server_name()
            ),
        )
    };
    d.forward_to_peers_except(None, &wire);

    let cliconn_wire = Message::with_prefix(
        d.sid.as_str(),
        "CLICONN",
        vec![cliconn.clone()],
    );
    d.forward_to_peers_except(None, &cliconn_wire);
    d.notice_opers_with_mode(Some('C'), &cliconn);

    Ok(())
}

fn nick_of(d: &Dispatcher, uid: &crate::state::uid::Uid) -> String {
    d.world
        .users
        .get(uid)
        .map(|u| u.nick.clone())
        .unwrap_or_default()
}

// ----------------------------------------------------------------------
// TS6 link handshake
// ----------------------------------------------------------------------

/// Send our PASS/CAPAB/SERVER. Used up front on outbound connects and in
/// reply to an inbound SERVER.
pub(crate) fn send_link_intro(d: &Dispatcher, pending: &mut Pending, password: &str) {
    pending.conn.send(Message::new(
        "PASS",
        vec![
            password.to_string(),
            "TS".into(),
            "6".into(),
            d.sid.as_str().to_string(),
        ],
    ));
    pending.sent_pass = true;

    pending
        .conn
        .send(Message::new("CAPAB", vec![OUR_CAPABS.to_string()]));
    pending.sent_capab = true;

    pending.conn.send(Message::new(
        "SERVER",
        vec![
            d.config.server.name.clone(),
            "1".into(),
            d.config.server.description.clone(),
        ],
    ));
    pending.sent_server = true;
}

fn send_svinfo(pending: &mut Pending) {
    let epoch = chrono::Utc::now().timestamp();
    pending.conn.send(Message::new(
        "SVINFO",
        vec!["6".into(), "6".into(), "0".into(), epoch.to_string()],
    ));
    pending.sent_svinfo = true;
}

fn pass(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // PASS <password> TS <version> <SID>
    if msg.params.len() < 4 {
        d.reply_pending(
            conn,
            "461",
            vec!["PASS".into(), "Not enough parameters".into()],
        );
        return Ok(());
    }

    let our_sid = d.sid.clone();
    let sid_known = is_valid_sid(&msg.params[3])
        && d.world.servers.contains_key(&Sid::new(msg.params[3].clone()));

    let Some(pending) = pending_mut(d, conn) else {
        return Ok(());
    };
    if pending.got_pass {
        return Err(HandlerError::violation("Double PASS"));
    }
    if msg.params[1] != "TS" {
        return Err(HandlerError::violation("Unexpected PASS format: TS"));
    }
    if msg.params[2].parse::<i64>() != Ok(6) {
        return Err(HandlerError::violation("Unsupported TS version"));
    }
    if !is_valid_sid(&msg.params[3]) {
        return Err(HandlerError::violation("Malformed SID"));
    }
    if msg.params[3] == our_sid.as_str() {
        return Err(HandlerError::violation("That's my SID"));
    }
    if sid_known {
        return Err(HandlerError::violation("SID already in use"));
    }

    pending.pass = Some(msg.params[0].clone());
    pending.claimed_sid = Some(Sid::new(msg.params[3].clone()));
    pending.got_pass = true;
    Ok(())
}

fn capab(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    let Some(list) = msg.param(0) else {
        d.reply_pending(
            conn,
            "461",
            vec!["CAPAB".into(), "Not enough parameters".into()],
        );
        return Ok(());
    };
    let capabs = ident::parse_capabs(list);

    let Some(pending) = pending_mut(d, conn) else {
        return Ok(());
    };
    if !pending.got_pass {
        return Err(HandlerError::violation("PASS first"));
    }
    if pending.got_capab {
        return Err(HandlerError::violation("Double CAPAB"));
    }

    pending.capabs.extend(capabs);

    if !pending.capabs.contains("QS") {
        return Err(HandlerError::violation("Missing QS"));
    }
    if !pending.capabs.contains("ENCAP") {
        return Err(HandlerError::violation("Missing ENCAP"));
    }

    pending.got_capab = true;
    Ok(())
}

fn server(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // SERVER <name> <hopcount> <description>
    if msg.params.len() != 3 {
        d.reply_pending(
            conn,
            "461",
            vec!["SERVER".into(), "Not enough parameters".into()],
        );
        return Ok(());
    }

    let name = msg.params[0].clone();
    // The peer table is authoritative: the name must be configured and
    // the PASS password must match that entry.
    let Some(link) = d.config.link(&name).cloned() else {
        return Err(HandlerError::violation("I don't know you"));
    };
    let already_linked = d.world.server_by_name(&name).is_some();

    let Some(pending) = pending_mut(d, conn) else {
        return Ok(());
    };
    if !pending.got_capab {
        return Err(HandlerError::violation("CAPAB first"));
    }
    if pending.got_server {
        return Err(HandlerError::violation("Double SERVER"));
    }
    if pending.pass.as_deref() != Some(link.password.as_str()) {
        return Err(HandlerError::violation("Bad password"));
    }
    if msg.params[1] != "1" {
        return Err(HandlerError::violation("Bad hopcount"));
    }
    if already_linked {
        return Err(HandlerError::violation("Already linked"));
    }

    pending.server_name = Some(name);
    pending.server_desc = Some(msg.params[2].clone());
    pending.got_server = true;

    // If they initiated we still owe our own credentials; if we did, our
    // side went out at connect time and SVINFO is next.
    let owe_intro = !pending.sent_server;
    if let Some(Session::Pending(mut pending)) = d.sessions.remove(&conn) {
        if owe_intro {
            send_link_intro(d, &mut pending, &link.password);
        } else {
            send_svinfo(&mut pending);
        }
        d.sessions.insert(conn, Session::Pending(pending));
    }
    Ok(())
}

fn svinfo(d: &mut Dispatcher, conn: ConnId, msg: &Message) -> HandlerResult {
    // SVINFO <TS version> <min TS version> 0 <current time>
    if msg.params.len() < 4 {
        d.reply_pending(
            conn,
            "461",
            vec!["SVINFO".into(), "Not enough parameters".into()],
        );
        return Ok(());
    }

    let now = d.now();
    let Some(pending) = pending_mut(d, conn) else {
        return Ok(());
    };
    if !pending.got_server || !pending.sent_server {
        return Err(HandlerError::violation("SERVER first"));
    }
    if msg.params[0] != "6" || msg.params[1] != "6" {
        return Err(HandlerError::violation("Unsupported TS version"));
    }
    if msg.params[2] != "0" {
        return Err(HandlerError::violation("Malformed third parameter"));
    }
    let Ok(their_epoch) = msg.params[3].parse::<i64>() else {
        return Err(HandlerError::violation("Malformed time"));
    };
    if (now - their_epoch).abs() > MAX_CLOCK_SKEW {
        return Err(HandlerError::violation("Time insanity"));
    }

    // If we initiated, our SVINFO already went out in reply to their
    // SERVER; otherwise this is the moment.
    if !pending.sent_svinfo {
        send_svinfo(pending);
    }

    register_server(d, conn)
}

/// Registration completes: the session becomes a linked peer in the
/// bursting state, and our burst plus the end-of-burst PING go out.
fn register_server(d: &mut Dispatcher, conn: ConnId) -> HandlerResult {
    let Some(Session::Pending(pending)) = d.sessions.remove(&conn) else {
        return Ok(());
    };
    let (Some(sid), Some(name), Some(desc)) = (
        pending.claimed_sid.clone(),
        pending.server_name.clone(),
        pending.server_desc.clone(),
    ) else {
        return Err(HandlerError::violation("Incomplete handshake"));
    };

    d.world.servers.insert(
        sid.clone(),
        Server {
            sid: sid.clone(),
            name: name.clone(),
            description: desc,
            hop_count: 1,
            capabs: Some(pending.capabs.clone()),
            conn: Some(conn),
            via: Some(conn),
            linked_to: d.sid.clone(),
        },
    );

    d.sessions.insert(
        conn,
        Session::Peer(LocalPeer {
            conn: pending.conn,
            sid: sid.clone(),
            name: name.clone(),
            bursting: true,
            got_ping: false,
            got_pong: false,
            last_activity: d.now(),
            ping_sent: false,
        }),
    );

    info!(peer = %name, %sid, "server link established");
    d.notice_opers(&format!("Established link to {}.", name));

    // Introduce the new peer to the rest of the mesh; it is one hop
    // further for them.
    let (intro, gcap) = {
        let server = &d.world.servers[&sid];
        (
            Message::with_prefix(
                d.sid.as_str(),
                "SID",
                vec![
                    server.name.clone(),
                    "2".into(),
                    sid.as_str().to_string(),
                    server.description.clone(),
                ],
            ),
            Message::with_prefix(
                sid.as_str(),
                "ENCAP",
                vec!["*".into(), "GCAP".into(), server.capabs_string()],
            ),
        )
    };
    d.forward_to_peers_except(Some(conn), &intro);
    d.forward_to_peers_except(Some(conn), &gcap);

    burst::send_burst(d, conn);

    let ping = Message::with_prefix(
        d.sid.as_str(),
        "PING",
        vec![d.sid.as_str().to_string()],
    );
    d.send_to_conn(conn, ping);

    Ok(())
}
