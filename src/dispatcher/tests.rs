//! Dispatcher-level protocol tests.
//!
//! These drive the dispatcher as a pure state machine: in-memory queues
//! stand in for sockets, events go in, and the tests assert on emitted
//! wire lines and on the resulting model.

use std::path::PathBuf;

use petrel_proto::Message;
use tokio::sync::mpsc;

use crate::config::{Config, LinkBlock, ListenConfig, ServerConfig, TimeoutsConfig};
use crate::dispatcher::session::Session;
use crate::dispatcher::Dispatcher;
use crate::event::{ConnId, Event};
use crate::state::uid::{Sid, Uid};

fn test_config() -> Config {
    Config {
        server: ServerConfig {
            name: "irc.example.org".into(),
            description: "Test server".into(),
            sid: "001".into(),
            motd: Some("hello".into()),
            motd_file: None,
            max_nick_length: 9,
        },
        listen: ListenConfig {
            host: "127.0.0.1".into(),
            port: 6667,
            tls_port: None,
            certificate_file: None,
            key_file: None,
        },
        timeouts: TimeoutsConfig::default(),
        opers: vec![crate::config::OperBlock {
            name: "root".into(),
            password: "operpass".into(),
        }],
        links: vec![
            LinkBlock {
                name: "irc2.example.org".into(),
                host: "127.0.0.1".into(),
                port: 6668,
                password: "linkpass".into(),
                tls: false,
            },
            LinkBlock {
                name: "irc3.example.org".into(),
                host: "127.0.0.1".into(),
                port: 6669,
                password: "linkpass".into(),
                tls: false,
            },
        ],
        users: vec![],
    }
}

struct Harness {
    d: Dispatcher,
    next_conn: u64,
}

impl Harness {
    fn new() -> Self {
        Self {
            d: Dispatcher::new(test_config(), PathBuf::from("petreld.toml"), None),
            next_conn: 1,
        }
    }

    /// Accept a connection; returns its id and the far end of its
    /// outbound queue.
    fn connect(&mut self) -> (ConnId, mpsc::Receiver<Message>) {
        self.connect_with_capacity(4096)
    }

    fn connect_with_capacity(&mut self, capacity: usize) -> (ConnId, mpsc::Receiver<Message>) {
        let conn = ConnId(self.next_conn);
        self.next_conn += 1;
        let (tx, rx) = mpsc::channel(capacity);
        self.d.handle_event(Event::NewConnection {
            conn,
            addr: format!("10.0.0.{}:50000", conn.0).parse().unwrap(),
            tx,
            tls: false,
            outbound_link: None,
        });
        (conn, rx)
    }

    fn send(&mut self, conn: ConnId, line: &str) {
        let msg: Message = line.parse().expect("test line parses");
        self.d.handle_event(Event::MessageFromClient { conn, msg });
    }

    /// Link a peer through the full inbound handshake. Returns the
    /// connection and its drained queue receiver.
    fn link_peer(&mut self, name: &str, sid: &str) -> (ConnId, mpsc::Receiver<Message>) {
        let (conn, mut rx) = self.connect();
        self.send(conn, &format!("PASS linkpass TS 6 {}", sid));
        self.send(conn, "CAPAB :QS ENCAP TB");
        self.send(conn, &format!("SERVER {} 1 :A peer", name));
        let epoch = chrono::Utc::now().timestamp();
        self.send(conn, &format!("SVINFO 6 6 0 {}", epoch));
        drain(&mut rx);
        (conn, rx)
    }

    /// Register a local user. Returns the connection and drained queue.
    fn register_user(&mut self, nick: &str) -> (ConnId, mpsc::Receiver<Message>) {
        let (conn, mut rx) = self.connect();
        self.send(conn, &format!("NICK {}", nick));
        self.send(conn, &format!("USER {} 0 * :Real Name", nick));
        drain(&mut rx);
        (conn, rx)
    }

    fn uid_of(&self, nick: &str) -> Uid {
        self.d
            .world
            .user_by_nick(nick)
            .map(|u| u.uid.clone())
            .expect("user exists")
    }
}

fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn lines(msgs: &[Message]) -> Vec<String> {
    msgs.iter().map(|m| m.to_string()).collect()
}

// ----------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------

#[test]
fn nick_and_user_register_in_either_order() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.connect();

    h.send(conn, "USER alice 0 * :Alice");
    h.send(conn, "NICK alice");

    let out = lines(&drain(&mut rx));
    assert!(
        out.iter().any(|l| l.contains(" 001 alice ")),
        "welcome numeric missing: {:?}",
        out
    );
    assert!(out.iter().any(|l| l.contains("MODE alice :+i") || l.contains("MODE alice +i")));

    let user = h.d.world.user_by_nick("alice").expect("registered");
    assert_eq!(user.uid.as_str(), "001AAAAAA");
    assert_eq!(user.username, "~alice");
    assert!(user.modes.contains(&'i'));
    h.d.world.check_invariants();
}

#[test]
fn duplicate_nick_rejected_with_433() {
    let mut h = Harness::new();
    h.register_user("alice");

    let (conn, mut rx) = h.connect();
    h.send(conn, "NICK ALICE");
    let out = lines(&drain(&mut rx));
    assert!(out.iter().any(|l| l.contains(" 433 ")), "{:?}", out);
}

#[test]
fn erroneous_nick_rejected_with_432() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.send(conn, "NICK 1bad");
    let out = lines(&drain(&mut rx));
    assert!(out.iter().any(|l| l.contains(" 432 ")), "{:?}", out);
}

#[test]
fn nine_preregistration_messages_are_fine_ten_are_not() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.connect();

    for _ in 0..9 {
        h.send(conn, "CAP LS");
    }
    assert!(h.d.sessions.contains_key(&conn), "nine messages survive");

    h.send(conn, "CAP LS");
    assert!(!h.d.sessions.contains_key(&conn), "ten terminate");
    let out = lines(&drain(&mut rx));
    assert!(out.iter().any(|l| l.contains("Too many messages")), "{:?}", out);
}

#[test]
fn kline_applies_at_registration() {
    let mut h = Harness::new();
    h.d.world.klines.push(crate::state::KLine {
        user_mask: "*".into(),
        host_mask: "10.0.0.*".into(),
        reason: "banned".into(),
    });

    let (conn, mut rx) = h.connect();
    h.send(conn, "NICK alice");
    h.send(conn, "USER alice 0 * :Alice");

    assert!(h.d.world.user_by_nick("alice").is_none());
    assert!(!h.d.sessions.contains_key(&conn));
    let out = lines(&drain(&mut rx));
    assert!(out.iter().any(|l| l.contains(" 465 ")), "{:?}", out);
}

// ----------------------------------------------------------------------
// Link handshake and burst (S1, B4)
// ----------------------------------------------------------------------

#[test]
fn inbound_handshake_replies_and_pings() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.connect();

    h.send(conn, "PASS linkpass TS 6 002");
    h.send(conn, "CAPAB :QS ENCAP TB");
    h.send(conn, "SERVER irc2.example.org 1 :Peer two");
    let epoch = chrono::Utc::now().timestamp();
    h.send(conn, &format!("SVINFO 6 6 0 {}", epoch));

    let out = lines(&drain(&mut rx));
    assert!(out.iter().any(|l| l.starts_with("PASS linkpass TS 6 001")), "{:?}", out);
    assert!(out.iter().any(|l| l.starts_with("CAPAB ")), "{:?}", out);
    assert!(
        out.iter().any(|l| l.starts_with("SERVER irc.example.org 1 ")),
        "{:?}",
        out
    );
    assert!(out.iter().any(|l| l.starts_with("SVINFO 6 6 0 ")), "{:?}", out);
    assert_eq!(out.last().map(String::as_str), Some(":001 PING 001"));

    let peer = h.d.sessions.get(&conn).and_then(Session::as_peer).unwrap();
    assert!(peer.bursting);
    assert!(h.d.world.servers.contains_key(&Sid::new("002")));
}

#[test]
fn burst_ends_only_after_both_ping_and_pong() {
    let mut h = Harness::new();
    let (conn, _rx) = h.link_peer("irc2.example.org", "002");

    h.send(conn, ":002 PONG irc2.example.org 001");
    let peer = h.d.sessions.get(&conn).and_then(Session::as_peer).unwrap();
    assert!(peer.bursting, "PONG alone does not finish the burst");
    assert!(peer.got_pong);

    h.send(conn, ":002 PING irc2.example.org");
    let peer = h.d.sessions.get(&conn).and_then(Session::as_peer).unwrap();
    assert!(!peer.bursting, "PING + PONG finish the burst");
}

#[test]
fn ping_for_us_answered_with_pong() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.link_peer("irc2.example.org", "002");

    h.send(conn, ":002 PING irc2.example.org");
    let out = lines(&drain(&mut rx));
    assert!(
        out.contains(&":001 PONG irc.example.org 002".to_string()),
        "{:?}",
        out
    );
}

#[test]
fn clock_skew_of_sixty_is_fine_sixty_one_is_not() {
    // The passing skew is in the future and the failing one in the past
    // so that wall-clock movement between here and the handler cannot
    // flip either outcome.
    for (skew, survives) in [(60, true), (-61, false)] {
        let mut h = Harness::new();
        let (conn, mut rx) = h.connect();
        h.send(conn, "PASS linkpass TS 6 002");
        h.send(conn, "CAPAB :QS ENCAP");
        h.send(conn, "SERVER irc2.example.org 1 :Peer two");
        let epoch = chrono::Utc::now().timestamp() + skew;
        h.send(conn, &format!("SVINFO 6 6 0 {}", epoch));

        assert_eq!(
            h.d.sessions.contains_key(&conn),
            survives,
            "skew {}",
            skew
        );
        if !survives {
            let out = lines(&drain(&mut rx));
            assert!(out.iter().any(|l| l.contains("Time insanity")), "{:?}", out);
        }
    }
}

#[test]
fn wrong_link_password_is_refused() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.send(conn, "PASS wrong TS 6 002");
    h.send(conn, "CAPAB :QS ENCAP");
    h.send(conn, "SERVER irc2.example.org 1 :Peer two");

    assert!(!h.d.sessions.contains_key(&conn));
    let out = lines(&drain(&mut rx));
    assert!(out.iter().any(|l| l.contains("Bad password")), "{:?}", out);
}

#[test]
fn burst_carries_users_servers_and_channels() {
    let mut h = Harness::new();
    h.register_user("alice");
    // alice joins a channel and sets a topic before the peer links.
    let alice_conn = h.d.world.user_by_nick("alice").unwrap().conn.unwrap();
    h.send(alice_conn, "JOIN #test");
    h.send(alice_conn, "TOPIC #test :hello world");

    let (conn, mut rx) = h.connect();
    h.send(conn, "PASS linkpass TS 6 002");
    h.send(conn, "CAPAB :QS ENCAP TB");
    h.send(conn, "SERVER irc2.example.org 1 :Peer two");
    let epoch = chrono::Utc::now().timestamp();
    h.send(conn, &format!("SVINFO 6 6 0 {}", epoch));

    let out = lines(&drain(&mut rx));
    let uid = h.uid_of("alice");
    assert!(
        out.iter().any(|l| l.starts_with(":001 UID alice 1 ") && l.contains(uid.as_str())),
        "{:?}",
        out
    );
    let sjoin = out
        .iter()
        .find(|l| l.starts_with(":001 SJOIN "))
        .expect("sjoin in burst");
    assert!(sjoin.contains("#test"));
    assert!(sjoin.contains(&format!("@{}", uid)), "creator is opped: {}", sjoin);
    assert!(
        out.iter().any(|l| l.starts_with(":001 TB #test ") && l.ends_with(":hello world")),
        "{:?}",
        out
    );
}

// ----------------------------------------------------------------------
// Remote users and collisions (S2)
// ----------------------------------------------------------------------

#[test]
fn remote_uid_inserts_user_and_forwards_with_bumped_hop() {
    let mut h = Harness::new();
    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    let (_conn3, mut rx3) = h.link_peer("irc3.example.org", "003");

    h.send(
        conn2,
        ":002 UID bob 1 1475024621 +i ~bob host2.example.org 10.0.0.2 002AAAAAB :Bob",
    );

    let bob = h.d.world.user_by_nick("bob").expect("bob known");
    assert_eq!(bob.server, Sid::new("002"));
    assert_eq!(bob.hop_count, 1);
    assert!(bob.is_remote());

    let out = lines(&drain(&mut rx3));
    assert!(
        out.iter().any(|l| l.starts_with(":002 UID bob 2 ")),
        "hop bumped on forward: {:?}",
        out
    );
    h.d.world.check_invariants();
}

#[test]
fn equal_ts_collision_kills_both_and_frees_the_nick() {
    let mut h = Harness::new();
    h.register_user("alice");
    let uid_local = h.uid_of("alice");
    if let Some(user) = h.d.world.users.get_mut(&uid_local) {
        user.nick_ts = 100;
    }

    let (conn2, mut rx2) = h.link_peer("irc2.example.org", "002");
    h.send(
        conn2,
        ":002 UID alice 1 100 +i ~other host2.example.org 10.0.0.2 002AAAAAC :Other",
    );

    assert!(h.d.world.user_by_nick("alice").is_none(), "nick is free");
    assert!(!h.d.world.users.contains_key(&uid_local));
    assert!(!h.d.world.users.contains_key(&Uid::new("002AAAAAC")));

    let out = lines(&drain(&mut rx2));
    let kills: Vec<&String> = out.iter().filter(|l| l.contains(" KILL ")).collect();
    assert_eq!(kills.len(), 2, "two KILLs propagate: {:?}", out);
    assert!(kills.iter().any(|l| l.contains(uid_local.as_str())));
    assert!(kills.iter().any(|l| l.contains("002AAAAAC")));
    h.d.world.check_invariants();
}

#[test]
fn older_incoming_nick_wins_collision() {
    let mut h = Harness::new();
    h.register_user("alice");
    let uid_local = h.uid_of("alice");
    if let Some(user) = h.d.world.users.get_mut(&uid_local) {
        user.nick_ts = 200;
        // Same user@host, so the timestamps decide.
        user.username = "~alice".into();
        user.hostname = "shared.example.org".into();
    }

    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    h.send(
        conn2,
        ":002 UID alice 1 100 +i ~alice shared.example.org 10.0.0.2 002AAAAAC :Alice",
    );

    let survivor = h.d.world.user_by_nick("alice").expect("one alice left");
    assert_eq!(survivor.uid.as_str(), "002AAAAAC");
    assert!(!h.d.world.users.contains_key(&uid_local));
    h.d.world.check_invariants();
}

#[test]
fn newer_incoming_nick_loses_collision() {
    let mut h = Harness::new();
    h.register_user("alice");
    let uid_local = h.uid_of("alice");
    if let Some(user) = h.d.world.users.get_mut(&uid_local) {
        user.nick_ts = 100;
        user.username = "~alice".into();
        user.hostname = "shared.example.org".into();
    }

    let (conn2, mut rx2) = h.link_peer("irc2.example.org", "002");
    h.send(
        conn2,
        ":002 UID alice 1 200 +i ~alice shared.example.org 10.0.0.2 002AAAAAC :Alice",
    );

    let survivor = h.d.world.user_by_nick("alice").expect("ours survives");
    assert_eq!(survivor.uid, uid_local);
    assert!(!h.d.world.users.contains_key(&Uid::new("002AAAAAC")));

    let out = lines(&drain(&mut rx2));
    assert!(
        out.iter().any(|l| l.contains(" KILL 002AAAAAC ")),
        "kill sent back toward origin: {:?}",
        out
    );
}

// ----------------------------------------------------------------------
// Channel TS arbitration (S3)
// ----------------------------------------------------------------------

#[test]
fn older_sjoin_wipes_modes_and_grants_ops() {
    let mut h = Harness::new();
    h.register_user("alice");
    let alice_conn = h.d.world.user_by_nick("alice").unwrap().conn.unwrap();
    h.send(alice_conn, "JOIN #test");
    {
        let channel = h.d.world.channels.get_mut("#test").unwrap();
        channel.ts = 200;
        channel.modes = ['n', 's'].into_iter().collect();
    }

    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    h.send(
        conn2,
        ":002 UID bob 1 50 +i ~bob host2.example.org 10.0.0.2 002AAAAAC :Bob",
    );
    h.send(conn2, ":002 SJOIN 150 #test +n :@002AAAAAC");

    let channel = h.d.world.channels.get("#test").unwrap();
    assert_eq!(channel.ts, 150, "older TS adopted");
    assert!(channel.modes.contains(&'n'));
    assert!(!channel.modes.contains(&'s'), "+s cleared");
    assert!(channel.has_ops(&Uid::new("002AAAAAC")), "prefix honored");
    h.d.world.check_invariants();
}

#[test]
fn newer_sjoin_keeps_modes_and_ignores_prefixes() {
    let mut h = Harness::new();
    h.register_user("alice");
    let alice_conn = h.d.world.user_by_nick("alice").unwrap().conn.unwrap();
    h.send(alice_conn, "JOIN #test");
    {
        let channel = h.d.world.channels.get_mut("#test").unwrap();
        channel.ts = 100;
        channel.modes = ['n', 's'].into_iter().collect();
    }

    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    h.send(
        conn2,
        ":002 UID bob 1 50 +i ~bob host2.example.org 10.0.0.2 002AAAAAC :Bob",
    );
    h.send(conn2, ":002 SJOIN 150 #test + :@002AAAAAC");

    let channel = h.d.world.channels.get("#test").unwrap();
    assert_eq!(channel.ts, 100, "our TS stands");
    assert!(channel.modes.contains(&'s'));
    assert!(channel.has_member(&Uid::new("002AAAAAC")), "user accepted");
    assert!(!channel.has_ops(&Uid::new("002AAAAAC")), "prefix ignored");
}

#[test]
fn sjoin_for_unknown_member_does_not_leave_an_empty_channel() {
    let mut h = Harness::new();
    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    h.send(conn2, ":002 SJOIN 150 #ghost +n :@002AAAAAZ");
    assert!(!h.d.world.channels.contains_key("#ghost"));
}

// ----------------------------------------------------------------------
// Topics (S4)
// ----------------------------------------------------------------------

#[test]
fn tb_respects_topic_ts() {
    let mut h = Harness::new();
    h.register_user("carol");
    let carol_conn = h.d.world.user_by_nick("carol").unwrap().conn.unwrap();
    h.send(carol_conn, "JOIN #test");
    {
        let channel = h.d.world.channels.get_mut("#test").unwrap();
        channel.topic = "prior".into();
        channel.topic_ts = 40;
    }

    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");

    // Newer than ours: ignored.
    h.send(conn2, ":002 TB #test 50 alice!a@h :hello");
    let channel = h.d.world.channels.get("#test").unwrap();
    assert_eq!(channel.topic, "prior");

    // Ours is newer than theirs: theirs wins.
    {
        let channel = h.d.world.channels.get_mut("#test").unwrap();
        channel.topic_ts = 60;
    }
    h.send(conn2, ":002 TB #test 50 alice!a@h :hello");
    let channel = h.d.world.channels.get("#test").unwrap();
    assert_eq!(channel.topic, "hello");
    assert_eq!(channel.topic_ts, 50);
    assert_eq!(channel.topic_setter, "alice!a@h");
}

#[test]
fn tb_accepted_when_no_topic_set() {
    let mut h = Harness::new();
    h.register_user("carol");
    let carol_conn = h.d.world.user_by_nick("carol").unwrap().conn.unwrap();
    h.send(carol_conn, "JOIN #test");

    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    h.send(conn2, ":002 TB #test 500 alice!a@h :fresh");
    assert_eq!(h.d.world.channels.get("#test").unwrap().topic, "fresh");
}

// ----------------------------------------------------------------------
// Netsplit (S5)
// ----------------------------------------------------------------------

#[test]
fn delink_quits_subtree_users_and_tells_other_peers() {
    let mut h = Harness::new();
    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    let (_conn3, mut rx3) = h.link_peer("irc3.example.org", "003");

    // A server behind peer two, with a user on it.
    h.send(conn2, ":002 SID irc4.example.org 2 004 :Leaf");
    h.send(
        conn2,
        ":002 UID bob 1 100 +i ~bob host2.example.org 10.0.0.2 002AAAAAB :Bob",
    );
    h.send(
        conn2,
        ":004 UID dave 2 100 +i ~dave host4.example.org 10.0.0.4 004AAAAAB :Dave",
    );

    // A local user shares a channel with bob.
    h.register_user("alice");
    let alice_conn = h.d.world.user_by_nick("alice").unwrap().conn.unwrap();
    h.send(alice_conn, "JOIN #shared");
    h.send(conn2, ":002AAAAAB JOIN 1000 #shared +");

    drain(&mut rx3);
    h.d.handle_event(Event::DeadClient { conn: conn2 });

    assert!(h.d.world.users.get(&Uid::new("002AAAAAB")).is_none());
    assert!(h.d.world.users.get(&Uid::new("004AAAAAB")).is_none());
    assert!(!h.d.world.servers.contains_key(&Sid::new("002")));
    assert!(!h.d.world.servers.contains_key(&Sid::new("004")));
    assert!(h.d.world.user_by_nick("alice").is_some(), "locals survive");

    let out = lines(&drain(&mut rx3));
    assert!(
        out.iter().any(|l| l.starts_with(":001 SQUIT 002 ")),
        "other peers told: {:?}",
        out
    );
    h.d.world.check_invariants();
}

#[test]
fn remote_squit_prunes_the_distant_subtree() {
    let mut h = Harness::new();
    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    h.send(conn2, ":002 SID irc4.example.org 2 004 :Leaf");
    h.send(
        conn2,
        ":004 UID dave 2 100 +i ~dave host4.example.org 10.0.0.4 004AAAAAB :Dave",
    );

    h.send(conn2, ":002 SQUIT 004 :gone");

    assert!(!h.d.world.servers.contains_key(&Sid::new("004")));
    assert!(h.d.world.servers.contains_key(&Sid::new("002")));
    assert!(h.d.world.users.get(&Uid::new("004AAAAAB")).is_none());
}

// ----------------------------------------------------------------------
// Overflow (S6)
// ----------------------------------------------------------------------

#[test]
fn send_queue_overflow_terminates_the_session() {
    let mut h = Harness::new();
    let (_peer_conn, mut peer_rx) = h.link_peer("irc2.example.org", "002");

    // A queue of one cannot hold the registration replies; the sticky
    // overflow flag trips during them.
    let (conn, _rx) = h.connect_with_capacity(1);
    h.send(conn, "NICK tiny");
    h.send(conn, "USER tiny 0 * :Tiny");

    assert!(!h.d.sessions.contains_key(&conn), "session swept");
    assert!(h.d.world.user_by_nick("tiny").is_none());

    let out = lines(&drain(&mut peer_rx));
    if out.iter().any(|l| l.contains(" UID tiny ")) {
        assert!(
            out.iter().any(|l| l.contains(" QUIT ")),
            "mesh told about the quit: {:?}",
            out
        );
    }
}

// ----------------------------------------------------------------------
// Local commands over the mesh
// ----------------------------------------------------------------------

#[test]
fn local_join_creates_channel_and_sjoins_peers() {
    let mut h = Harness::new();
    let (_conn2, mut rx2) = h.link_peer("irc2.example.org", "002");

    h.register_user("alice");
    let alice_conn = h.d.world.user_by_nick("alice").unwrap().conn.unwrap();
    h.send(alice_conn, "JOIN #test");

    let uid = h.uid_of("alice");
    let channel = h.d.world.channels.get("#test").expect("created");
    assert!(channel.has_member(&uid));
    assert!(channel.has_ops(&uid));
    assert!(channel.modes.contains(&'n') && channel.modes.contains(&'s'));

    let out = lines(&drain(&mut rx2));
    assert!(
        out.iter()
            .any(|l| l.contains(" SJOIN ") && l.contains("#test") && l.contains(&format!("@{}", uid))),
        "{:?}",
        out
    );
}

#[test]
fn privmsg_to_remote_user_routes_by_uid() {
    let mut h = Harness::new();
    let (conn2, mut rx2) = h.link_peer("irc2.example.org", "002");
    h.send(
        conn2,
        ":002 UID bob 1 100 +i ~bob host2.example.org 10.0.0.2 002AAAAAB :Bob",
    );
    drain(&mut rx2);

    h.register_user("alice");
    let alice_conn = h.d.world.user_by_nick("alice").unwrap().conn.unwrap();
    let alice_uid = h.uid_of("alice");
    h.send(alice_conn, "PRIVMSG bob :hi there");

    let out = lines(&drain(&mut rx2));
    assert!(
        out.contains(&format!(":{} PRIVMSG 002AAAAAB :hi there", alice_uid)),
        "{:?}",
        out
    );
}

#[test]
fn remote_nick_change_updates_index_and_forwards() {
    let mut h = Harness::new();
    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    let (_conn3, mut rx3) = h.link_peer("irc3.example.org", "003");
    h.send(
        conn2,
        ":002 UID bob 1 100 +i ~bob host2.example.org 10.0.0.2 002AAAAAB :Bob",
    );
    drain(&mut rx3);

    h.send(conn2, ":002AAAAAB NICK robert 150");

    assert!(h.d.world.user_by_nick("bob").is_none());
    let user = h.d.world.user_by_nick("robert").expect("renamed");
    assert_eq!(user.nick_ts, 150);

    let out = lines(&drain(&mut rx3));
    assert!(
        out.contains(&":002AAAAAB NICK robert 150".to_string()),
        "{:?}",
        out
    );
    h.d.world.check_invariants();
}

#[test]
fn encap_kline_disconnects_matching_local_users() {
    let mut h = Harness::new();
    h.register_user("victim");
    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");
    h.send(
        conn2,
        ":002 UID oper 1 100 +o ~oper host2.example.org 10.0.0.2 002AAAAAB :Oper",
    );

    h.send(conn2, ":002AAAAAB ENCAP * KLINE 0 * 10.0.0.* :bye bye");

    assert_eq!(h.d.world.klines.len(), 1);
    assert!(
        h.d.world.user_by_nick("victim").is_none(),
        "matching local user disconnected"
    );
}

#[test]
fn numeric_for_local_user_rewrites_only_first_param() {
    let mut h = Harness::new();
    h.register_user("alice");
    let alice_uid = h.uid_of("alice");
    let (conn2, _rx2) = h.link_peer("irc2.example.org", "002");

    // The second UID-shaped parameter must pass through untouched.
    h.send(
        conn2,
        &format!(":002 318 {} 002AAAAAB :End of /WHOIS list", alice_uid),
    );

    let alice = h.d.world.user_by_nick("alice").unwrap();
    assert!(alice.is_local());
    // Delivery went to alice's queue; the model is unchanged.
    h.d.world.check_invariants();
}

#[test]
fn oper_login_sets_mode_and_propagates() {
    let mut h = Harness::new();
    let (_conn2, mut rx2) = h.link_peer("irc2.example.org", "002");
    h.register_user("root");
    let conn = h.d.world.user_by_nick("root").unwrap().conn.unwrap();
    drain(&mut rx2);

    h.send(conn, "OPER root operpass");

    let user = h.d.world.user_by_nick("root").unwrap();
    assert!(user.is_oper());
    assert!(h.d.world.opers.contains(&user.uid));

    let out = lines(&drain(&mut rx2));
    assert!(
        out.iter().any(|l| l.contains(" MODE ") && l.contains("+o")),
        "{:?}",
        out
    );
    h.d.world.check_invariants();
}
