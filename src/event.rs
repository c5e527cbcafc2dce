//! Events flowing into the dispatcher.
//!
//! The event queue is the only way state changes enter the core: readers,
//! listeners, the resolver, the timer, and the signal task all produce
//! onto one bounded channel with the dispatcher as sole consumer.

use std::fmt;
use std::net::SocketAddr;

use petrel_proto::Message;
use tokio::sync::mpsc;

/// Locally unique connection identifier. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How many events may be pending before producers are backpressured.
pub const EVENT_QUEUE_LEN: usize = 4096;

/// A tagged event for the dispatcher.
#[derive(Debug)]
pub enum Event {
    /// A new socket was accepted (or an outbound connect completed).
    NewConnection {
        conn: ConnId,
        addr: SocketAddr,
        tx: mpsc::Sender<Message>,
        tls: bool,
        /// Set when we dialed this connection to a configured peer; the
        /// value is the peer's name in the link table.
        outbound_link: Option<String>,
    },
    /// A parsed message arrived from a connection.
    MessageFromClient { conn: ConnId, msg: Message },
    /// The connection's reader or writer died.
    DeadClient { conn: ConnId },
    /// Reverse DNS finished for a connection.
    HostnameResolved {
        conn: ConnId,
        hostname: Option<String>,
    },
    /// Periodic timer tick: idle pings, dead cutoffs, reconnects.
    Tick,
    /// SIGHUP: re-read configuration and TLS material.
    SignalReload,
    /// Graceful shutdown.
    Shutdown,
}

/// Create the bounded event queue.
pub fn queue() -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    mpsc::channel(EVENT_QUEUE_LEN)
}
