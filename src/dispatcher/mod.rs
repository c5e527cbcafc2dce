//! The core engine: a single task owning all shared state.
//!
//! Every mutation of the model happens here, driven by the event queue.
//! I/O workers, resolvers, timers, and signal tasks only produce events;
//! the dispatcher consumes them one at a time, to completion, and
//! synthesizes outbound messages onto per-connection writer queues.

pub mod session;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use petrel_proto::Message;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::HandlerError;
use crate::event::{ConnId, Event};
use crate::network::listener::IoContext;
use crate::network::tls;
use crate::state::uid::{Sid, Uid};
use crate::state::{UidGenerator, World};
use session::{ConnHandle, Pending, Session};

/// Static identity facts, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: String,
    pub created: String,
}

impl ServerInfo {
    pub fn now() -> Self {
        Self {
            version: format!("petreld-{}", env!("CARGO_PKG_VERSION")),
            created: Utc::now().to_rfc2822(),
        }
    }
}

/// Messages a registered local user may send per flood window before
/// being disconnected. Flood-exempt users skip the check.
pub(crate) const FLOOD_CREDIT: i32 = 50;

pub struct Dispatcher {
    pub(crate) config: Config,
    pub(crate) config_path: PathBuf,
    pub(crate) info: ServerInfo,
    pub(crate) sid: Sid,
    pub(crate) world: World,
    pub(crate) sessions: HashMap<ConnId, Session>,
    pub(crate) uid_gen: UidGenerator,
    /// Handles for spawning outbound connects and refreshing TLS; absent
    /// under test where no I/O exists.
    pub(crate) io: Option<IoContext>,
    /// Link name -> last outbound attempt (Unix seconds).
    pub(crate) last_connect: HashMap<String, i64>,
    shutting_down: bool,
}

impl Dispatcher {
    pub fn new(config: Config, config_path: PathBuf, io: Option<IoContext>) -> Self {
        let sid = Sid::new(config.server.sid.clone());
        Self {
            uid_gen: UidGenerator::new(sid.clone()),
            sid,
            config,
            config_path,
            info: ServerInfo::now(),
            world: World::new(),
            sessions: HashMap::new(),
            io,
            last_connect: HashMap::new(),
            shutting_down: false,
        }
    }

    pub(crate) fn server_name(&self) -> &str {
        &self.config.server.name
    }

    pub(crate) fn now(&self) -> i64 {
        Utc::now().timestamp()
    }

    /// Run until shutdown. One event at a time; a handler never blocks.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        info!(
            server = %self.server_name(),
            sid = %self.sid,
            "dispatcher running"
        );
        while let Some(event) = events.recv().await {
            self.handle_event(event);
            if self.shutting_down {
                // Drain whatever is already queued, then stop.
                while let Ok(event) = events.try_recv() {
                    self.handle_event(event);
                }
                break;
            }
        }
        info!("dispatcher stopped");
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::NewConnection {
                conn,
                addr,
                tx,
                tls,
                outbound_link,
            } => {
                let handle = ConnHandle::new(conn, addr, tls, tx);
                self.handle_new_connection(handle, outbound_link);
            }
            Event::MessageFromClient { conn, msg } => self.handle_message(conn, msg),
            Event::DeadClient { conn } => self.handle_dead(conn),
            Event::HostnameResolved { conn, hostname } => {
                if let Some(Session::Pending(pending)) = self.sessions.get_mut(&conn) {
                    pending.hostname = hostname;
                }
            }
            Event::Tick => self.handle_tick(),
            Event::SignalReload => self.handle_reload(),
            Event::Shutdown => self.handle_shutdown(),
        }
        self.sweep_overflowed();
    }

    fn handle_new_connection(&mut self, handle: ConnHandle, outbound_link: Option<String>) {
        let conn = handle.id;
        debug!(%conn, addr = %handle.addr, "new connection");
        let mut pending = Pending::new(handle, self.now());

        if let Some(link_name) = outbound_link {
            pending.outbound_link = Some(link_name.clone());
            // We initiated: lead with our own credentials.
            match self.config.link(&link_name) {
                Some(link) => {
                    let password = link.password.clone();
                    crate::handlers::client::send_link_intro(self, &mut pending, &password);
                }
                None => {
                    // Link vanished from config between dial and accept.
                    warn!(peer = %link_name, "no link block for outbound connection");
                }
            }
        }

        self.sessions.insert(conn, Session::Pending(pending));
    }

    fn handle_message(&mut self, conn: ConnId, msg: Message) {
        enum Route {
            Pending,
            PendingFlood,
            User(Uid, bool),
            Peer,
        }

        let now = self.now();
        let route = match self.sessions.get_mut(&conn) {
            None => return,
            Some(Session::Pending(pending)) => {
                pending.msg_count += 1;
                if pending.msg_count >= 10 {
                    Route::PendingFlood
                } else {
                    Route::Pending
                }
            }
            Some(Session::User(user)) => {
                user.last_activity = now;
                user.ping_sent = false;
                user.flood_credit -= 1;
                Route::User(user.uid.clone(), user.flood_credit < 0)
            }
            Some(Session::Peer(peer)) => {
                peer.last_activity = now;
                peer.ping_sent = false;
                Route::Peer
            }
        };

        let result = match route {
            Route::PendingFlood => {
                self.terminate_pending(conn, "Too many messages");
                return;
            }
            Route::Pending => crate::handlers::client::handle(self, conn, msg),
            Route::User(uid, over_budget) => {
                let exempt = self
                    .world
                    .users
                    .get(&uid)
                    .is_some_and(|u| u.is_flood_exempt());
                if over_budget && !exempt {
                    self.quit_local_user(&uid, "Excess flood");
                    return;
                }
                crate::handlers::local::handle(self, conn, msg)
            }
            Route::Peer => crate::handlers::s2s::handle(self, conn, msg),
        };

        if let Err(e) = result {
            let reason = match e {
                HandlerError::Violation(reason) => reason,
                HandlerError::UidOverflow(_) => {
                    error!(%conn, "TS6 ID space exhausted");
                    "TS6 ID overflow".to_string()
                }
            };
            self.terminate_session(conn, &reason);
        }
    }

    fn handle_dead(&mut self, conn: ConnId) {
        match self.sessions.get(&conn) {
            None => {}
            Some(Session::Pending(_)) => {
                self.sessions.remove(&conn);
            }
            Some(Session::User(user)) => {
                let uid = user.uid.clone();
                self.quit_local_user(&uid, "Connection closed");
            }
            Some(Session::Peer(_)) => {
                self.peer_delink(conn, "Connection closed");
            }
        }
    }

    /// Terminate whatever kind of session `conn` currently is.
    pub(crate) fn terminate_session(&mut self, conn: ConnId, reason: &str) {
        match self.sessions.get(&conn) {
            None => {}
            Some(Session::Pending(_)) => self.terminate_pending(conn, reason),
            Some(Session::User(user)) => {
                let uid = user.uid.clone();
                self.quit_local_user(&uid, reason);
            }
            Some(Session::Peer(_)) => self.peer_delink(conn, reason),
        }
    }

    pub(crate) fn terminate_pending(&mut self, conn: ConnId, reason: &str) {
        if let Some(mut session) = self.sessions.remove(&conn) {
            debug!(%conn, reason, "dropping unregistered connection");
            session
                .conn_mut()
                .send(Message::new("ERROR", vec![reason.to_string()]));
        }
    }

    /// A local user leaves: tell sharers, tell the mesh, drop the session.
    pub(crate) fn quit_local_user(&mut self, uid: &Uid, reason: &str) {
        self.quit_local_user_opts(uid, reason, true);
    }

    /// As [`Self::quit_local_user`]; `propagate` is false when the mesh
    /// was already informed another way (a KILL).
    pub(crate) fn quit_local_user_opts(&mut self, uid: &Uid, reason: &str, propagate: bool) {
        let Some(user) = self.world.users.get(uid) else {
            return;
        };
        let uhost = user.uhost();
        let conn = user.conn;

        let quit = Message::with_prefix(uhost, "QUIT", vec![reason.to_string()]);
        for sharer in self.world.local_users_sharing_channel(uid) {
            self.send_to_conn(sharer, quit.clone());
        }

        if propagate {
            let wire = Message::with_prefix(uid.as_str(), "QUIT", vec![reason.to_string()]);
            self.forward_to_peers_except(None, &wire);
        }

        if let Some(conn) = conn {
            if let Some(mut session) = self.sessions.remove(&conn) {
                session.conn_mut().send(Message::new(
                    "ERROR",
                    vec![format!("Closing Link: {}", reason)],
                ));
            }
        }

        self.world.remove_user(uid);
    }

    /// A remote user is gone (QUIT, KILL, netsplit): tell local sharers
    /// and drop them from the model. Propagation is the caller's business.
    pub(crate) fn quit_remote_user(&mut self, uid: &Uid, reason: &str) {
        let Some(user) = self.world.users.get(uid) else {
            return;
        };
        let quit = Message::with_prefix(user.uhost(), "QUIT", vec![reason.to_string()]);
        for sharer in self.world.local_users_sharing_channel(uid) {
            self.send_to_conn(sharer, quit.clone());
        }
        self.world.remove_user(uid);
    }

    /// Delink a directly connected peer: ERROR to it, netsplit cleanup,
    /// SQUIT to the remaining peers.
    pub(crate) fn peer_delink(&mut self, conn: ConnId, reason: &str) {
        let Some(mut session) = self.sessions.remove(&conn) else {
            return;
        };
        let Session::Peer(peer) = &mut session else {
            // Not a peer after all; nothing network-wide to do.
            return;
        };
        let sid = peer.sid.clone();
        let name = peer.name.clone();
        info!(peer = %name, %sid, reason, "delinking");

        peer.conn
            .send(Message::new("ERROR", vec![reason.to_string()]));
        drop(session);

        crate::sync::split::server_split_cleanup(self, &sid);

        let squit = Message::with_prefix(
            self.sid.as_str(),
            "SQUIT",
            vec![sid.as_str().to_string(), reason.to_string()],
        );
        self.forward_to_peers_except(None, &squit);

        self.notice_opers(&format!("Server {} delinked: {}", name, reason));
    }

    // ------------------------------------------------------------------
    // Delivery helpers
    // ------------------------------------------------------------------

    pub(crate) fn send_to_conn(&mut self, conn: ConnId, msg: Message) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.conn_mut().send(msg);
        }
    }

    /// ConnIds of every fully registered peer session.
    pub(crate) fn peer_conns(&self) -> Vec<ConnId> {
        self.sessions
            .iter()
            .filter(|(_, s)| matches!(s, Session::Peer(_)))
            .map(|(conn, _)| *conn)
            .collect()
    }

    /// The near-universal propagation pattern: every peer but the one the
    /// message came in on.
    pub(crate) fn forward_to_peers_except(&mut self, except: Option<ConnId>, msg: &Message) {
        for conn in self.peer_conns() {
            if Some(conn) != except {
                self.send_to_conn(conn, msg.clone());
            }
        }
    }

    /// Deliver to every local member of a channel, optionally skipping one
    /// user.
    pub(crate) fn deliver_to_channel_members(
        &mut self,
        channel: &str,
        msg: &Message,
        skip: Option<&Uid>,
    ) {
        let Some(channel) = self.world.channels.get(channel) else {
            return;
        };
        let conns: Vec<ConnId> = channel
            .members
            .iter()
            .filter(|uid| skip != Some(*uid))
            .filter_map(|uid| self.world.users.get(uid).and_then(|u| u.conn))
            .collect();
        for conn in conns {
            self.send_to_conn(conn, msg.clone());
        }
    }

    /// Numeric or named reply to a not-yet-registered connection. For
    /// numerics the target nick is prepended, `*` when none yet.
    pub(crate) fn reply_pending(&mut self, conn: ConnId, command: &str, params: Vec<String>) {
        let mut msg = Message::with_prefix(self.server_name(), command, params);
        if msg.is_numeric() {
            let nick = match self.sessions.get(&conn) {
                Some(Session::Pending(p)) => p.nick.clone().unwrap_or_else(|| "*".to_string()),
                _ => "*".to_string(),
            };
            msg.params.insert(0, nick);
        }
        self.send_to_conn(conn, msg);
    }

    /// Numeric or named reply from us to a local user.
    pub(crate) fn reply_user(&mut self, uid: &Uid, command: &str, params: Vec<String>) {
        let Some(user) = self.world.users.get(uid) else {
            return;
        };
        let Some(conn) = user.conn else { return };
        let mut msg = Message::with_prefix(self.server_name(), command, params);
        if msg.is_numeric() {
            msg.params.insert(0, user.nick.clone());
        }
        self.send_to_conn(conn, msg);
    }

    /// Numeric reply to a peer session; the target is its SID.
    pub(crate) fn reply_peer(&mut self, conn: ConnId, command: &str, params: Vec<String>) {
        let Some(peer) = self.sessions.get(&conn).and_then(Session::as_peer) else {
            return;
        };
        let mut msg = Message::with_prefix(self.sid.as_str(), command, params);
        if msg.is_numeric() {
            msg.params.insert(0, peer.sid.as_str().to_string());
        }
        self.send_to_conn(conn, msg);
    }

    /// NOTICE from the server to a local user.
    pub(crate) fn server_notice(&mut self, uid: &Uid, text: String) {
        let Some(user) = self.world.users.get(uid) else {
            return;
        };
        let Some(conn) = user.conn else { return };
        let msg = Message::with_prefix(
            self.server_name(),
            "NOTICE",
            vec![user.nick.clone(), text],
        );
        self.send_to_conn(conn, msg);
    }

    /// NOTICE every local operator.
    pub(crate) fn notice_opers(&mut self, text: &str) {
        self.notice_opers_with_mode(None, text);
    }

    /// NOTICE local operators, optionally only those with an extra mode.
    pub(crate) fn notice_opers_with_mode(&mut self, mode: Option<char>, text: &str) {
        let uids: Vec<Uid> = self
            .world
            .opers
            .iter()
            .filter(|uid| {
                self.world.users.get(uid).is_some_and(|u| {
                    u.is_local() && mode.map_or(true, |m| u.modes.contains(&m))
                })
            })
            .cloned()
            .collect();
        for uid in uids {
            self.server_notice(&uid, format!("*** Notice --- {}", text));
        }
    }

    /// Route a message toward a user: deliver locally or hand it to the
    /// peer the user is reached through.
    pub(crate) fn route_to_user(&mut self, uid: &Uid, msg: Message) {
        let Some(user) = self.world.users.get(uid) else {
            return;
        };
        if let Some(conn) = user.conn {
            self.send_to_conn(conn, msg);
        } else if let Some(via) = user.via {
            self.send_to_conn(via, msg);
        }
    }

    // ------------------------------------------------------------------
    // K-lines
    // ------------------------------------------------------------------

    /// Record a K-line and disconnect every matching local user.
    pub(crate) fn add_and_apply_kline(&mut self, kline: crate::state::KLine, source: &str) {
        if self
            .world
            .klines
            .iter()
            .any(|k| k.user_mask == kline.user_mask && k.host_mask == kline.host_mask)
        {
            return;
        }

        self.notice_opers(&format!(
            "{} added KLINE for {}@{} ({})",
            source, kline.user_mask, kline.host_mask, kline.reason
        ));

        let banned: Vec<Uid> = self
            .world
            .users
            .values()
            .filter(|user| user.is_local() && kline.matches(user))
            .map(|user| user.uid.clone())
            .collect();

        let reason = kline.reason.clone();
        self.world.klines.push(kline);

        for uid in banned {
            self.reply_user(
                &uid,
                "465",
                vec![format!("You are banned from this server- {}", reason)],
            );
            self.quit_local_user(&uid, &reason);
        }
    }

    pub(crate) fn remove_kline(&mut self, user_mask: &str, host_mask: &str, source: &str) {
        let before = self.world.klines.len();
        self.world
            .klines
            .retain(|k| !(k.user_mask == user_mask && k.host_mask == host_mask));
        if self.world.klines.len() != before {
            self.notice_opers(&format!(
                "{} removed KLINE for {}@{}",
                source, user_mask, host_mask
            ));
        }
    }

    // ------------------------------------------------------------------
    // Timers, overflow, reload, shutdown
    // ------------------------------------------------------------------

    fn handle_tick(&mut self) {
        let now = self.now();
        let ping_after = self.config.timeouts.ping_time as i64;
        let dead_after = self.config.timeouts.dead_time as i64;

        enum Action {
            PingUser(ConnId),
            PingPeer(ConnId, Sid),
            Dead(ConnId),
            StalePending(ConnId),
        }

        let mut actions = Vec::new();
        for (conn, session) in &mut self.sessions {
            match session {
                Session::Pending(pending) => {
                    if now - pending.since >= dead_after {
                        actions.push(Action::StalePending(*conn));
                    }
                }
                Session::User(user) => {
                    let idle = now - user.last_activity;
                    if idle >= dead_after {
                        actions.push(Action::Dead(*conn));
                    } else if idle >= ping_after && !user.ping_sent {
                        user.ping_sent = true;
                        user.flood_credit = FLOOD_CREDIT;
                        actions.push(Action::PingUser(*conn));
                    } else {
                        user.flood_credit = FLOOD_CREDIT;
                    }
                }
                Session::Peer(peer) => {
                    let idle = now - peer.last_activity;
                    if idle >= dead_after {
                        actions.push(Action::Dead(*conn));
                    } else if idle >= ping_after && !peer.ping_sent {
                        peer.ping_sent = true;
                        actions.push(Action::PingPeer(*conn, peer.sid.clone()));
                    }
                }
            }
        }

        for action in actions {
            match action {
                Action::PingUser(conn) => {
                    let msg = Message::new("PING", vec![self.server_name().to_string()]);
                    self.send_to_conn(conn, msg);
                }
                Action::PingPeer(conn, peer_sid) => {
                    let msg = Message::with_prefix(
                        self.sid.as_str(),
                        "PING",
                        vec![
                            self.sid.as_str().to_string(),
                            peer_sid.as_str().to_string(),
                        ],
                    );
                    self.send_to_conn(conn, msg);
                }
                Action::Dead(conn) => {
                    let reason = format!("Ping timeout: {} seconds", dead_after);
                    self.terminate_session(conn, &reason);
                }
                Action::StalePending(conn) => {
                    self.terminate_pending(conn, "Registration timeout");
                }
            }
        }

        self.attempt_connects(now);
    }

    /// Dial configured peers we are not linked to, rate limited by
    /// `connect_attempt_time`.
    fn attempt_connects(&mut self, now: i64) {
        let Some(io) = self.io.clone() else { return };
        let interval = self.config.timeouts.connect_attempt_time as i64;

        let linked: Vec<String> = self
            .sessions
            .values()
            .filter_map(|s| match s {
                Session::Peer(peer) => Some(peer.name.clone()),
                Session::Pending(p) => p.outbound_link.clone(),
                _ => None,
            })
            .collect();

        for link in self.config.links.clone() {
            if linked.contains(&link.name) {
                continue;
            }
            let last = self.last_connect.get(&link.name).copied().unwrap_or(0);
            if now - last < interval {
                continue;
            }
            self.last_connect.insert(link.name.clone(), now);
            crate::network::listener::connect_outbound(link, io.clone());
        }
    }

    /// Terminate any session whose outbound queue overflowed.
    fn sweep_overflowed(&mut self) {
        let overflowed: Vec<ConnId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.conn().overflowed())
            .map(|(conn, _)| *conn)
            .collect();
        for conn in overflowed {
            warn!(%conn, "send queue exceeded");
            self.terminate_session(conn, "SendQ exceeded");
        }
    }

    fn handle_reload(&mut self) {
        info!(path = %self.config_path.display(), "reloading configuration");
        match Config::load(&self.config_path) {
            Ok(config) => {
                self.config = config;
                self.refresh_tls();
                self.notice_opers("Configuration reloaded");
            }
            Err(e) => {
                error!(error = %e, "reload failed, keeping previous configuration");
            }
        }
    }

    fn refresh_tls(&mut self) {
        let Some(io) = &self.io else { return };
        let (Some(cert), Some(key)) = (
            self.config.listen.certificate_file.clone(),
            self.config.listen.key_file.clone(),
        ) else {
            return;
        };
        match tls::acceptor(&cert, &key) {
            Ok(acceptor) => {
                if let Ok(mut guard) = io.tls_acceptor.write() {
                    *guard = Some(acceptor);
                }
            }
            Err(e) => error!(error = %e, "tls refresh failed"),
        }
    }

    fn handle_shutdown(&mut self) {
        info!("shutting down");
        self.shutting_down = true;
        let conns: Vec<ConnId> = self.sessions.keys().copied().collect();
        for conn in conns {
            if let Some(mut session) = self.sessions.remove(&conn) {
                session
                    .conn_mut()
                    .send(Message::new("ERROR", vec!["Server shutting down".into()]));
            }
        }
        if let Some(io) = &self.io {
            let _ = io.shutdown.send(());
        }
    }
}
