//! Local session bookkeeping.
//!
//! Every accepted socket starts as a pending session carrying handshake
//! scratch space. Registration promotes it to a user or peer session and
//! the scratch is dropped.

use std::collections::HashSet;
use std::net::SocketAddr;

use petrel_proto::Message;
use tokio::sync::mpsc;

use crate::event::ConnId;
use crate::state::uid::{Sid, Uid};

/// A handle to one connection's outbound queue.
///
/// Enqueueing never blocks: a full queue sets the sticky overflow flag
/// and drops the message, and the dispatcher terminates the session at
/// its next opportunity.
#[derive(Debug)]
pub struct ConnHandle {
    pub id: ConnId,
    pub addr: SocketAddr,
    pub tls: bool,
    tx: mpsc::Sender<Message>,
    overflow: bool,
}

impl ConnHandle {
    pub fn new(id: ConnId, addr: SocketAddr, tls: bool, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            addr,
            tls,
            tx,
            overflow: false,
        }
    }

    /// The IP literal for this connection.
    pub fn ip(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn send(&mut self, msg: Message) {
        if self.overflow {
            return;
        }
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => self.overflow = true,
            // Writer already gone; a DeadClient event is on its way.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }
}

/// Scratch space for a connection that has not registered yet.
#[derive(Debug)]
pub struct Pending {
    pub conn: ConnHandle,
    /// When the connection was accepted (Unix seconds).
    pub since: i64,
    /// Messages received before registration, for the flood cutoff.
    pub msg_count: u32,
    /// Forward-confirmed hostname, once resolved.
    pub hostname: Option<String>,

    // NICK / USER
    pub nick: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,

    // PASS / CAPAB / SERVER
    pub pass: Option<String>,
    pub claimed_sid: Option<Sid>,
    pub capabs: HashSet<String>,
    pub server_name: Option<String>,
    pub server_desc: Option<String>,

    // Handshake progress.
    pub got_pass: bool,
    pub got_capab: bool,
    pub got_server: bool,
    pub sent_pass: bool,
    pub sent_capab: bool,
    pub sent_server: bool,
    pub sent_svinfo: bool,

    /// Set when we dialed this connection: the link name we dialed.
    pub outbound_link: Option<String>,
}

impl Pending {
    pub fn new(conn: ConnHandle, since: i64) -> Self {
        Self {
            conn,
            since,
            msg_count: 0,
            hostname: None,
            nick: None,
            username: None,
            realname: None,
            pass: None,
            claimed_sid: None,
            capabs: HashSet::new(),
            server_name: None,
            server_desc: None,
            got_pass: false,
            got_capab: false,
            got_server: false,
            sent_pass: false,
            sent_capab: false,
            sent_server: false,
            sent_svinfo: false,
            outbound_link: None,
        }
    }
}

/// A registered local user's session.
#[derive(Debug)]
pub struct LocalUser {
    pub conn: ConnHandle,
    pub uid: Uid,
    pub last_activity: i64,
    /// Whether we have PINGed since the last activity.
    pub ping_sent: bool,
    /// Message allowance within the current flood window; refilled on
    /// ticks, ignored for flood-exempt users.
    pub flood_credit: i32,
}

/// A linked peer server's session.
#[derive(Debug)]
pub struct LocalPeer {
    pub conn: ConnHandle,
    pub sid: Sid,
    pub name: String,
    /// Still exchanging burst; cleared once our PING was answered and
    /// theirs was seen.
    pub bursting: bool,
    pub got_ping: bool,
    pub got_pong: bool,
    pub last_activity: i64,
    pub ping_sent: bool,
}

/// The lifecycle of a local connection.
#[derive(Debug)]
pub enum Session {
    Pending(Pending),
    User(LocalUser),
    Peer(LocalPeer),
}

impl Session {
    pub fn conn(&self) -> &ConnHandle {
        match self {
            Session::Pending(p) => &p.conn,
            Session::User(u) => &u.conn,
            Session::Peer(s) => &s.conn,
        }
    }

    pub fn conn_mut(&mut self) -> &mut ConnHandle {
        match self {
            Session::Pending(p) => &mut p.conn,
            Session::User(u) => &mut u.conn,
            Session::Peer(s) => &mut s.conn,
        }
    }

    pub fn as_peer(&self) -> Option<&LocalPeer> {
        match self {
            Session::Peer(peer) => Some(peer),
            _ => None,
        }
    }

    pub fn as_peer_mut(&mut self) -> Option<&mut LocalPeer> {
        match self {
            Session::Peer(peer) => Some(peer),
            _ => None,
        }
    }
}
