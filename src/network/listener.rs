//! Accept loops and outbound connects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::LinkBlock;
use crate::event::{ConnId, Event};
use crate::network::{connection, resolver, tls};

/// Shared handles the accept loops and dialers need.
#[derive(Clone)]
pub struct IoContext {
    pub events: mpsc::Sender<Event>,
    pub shutdown: broadcast::Sender<()>,
    next_id: Arc<AtomicU64>,
    pub dead_time: Duration,
    /// Acceptor for the TLS listener; swapped on reload.
    pub tls_acceptor: Arc<RwLock<Option<TlsAcceptor>>>,
}

impl IoContext {
    pub fn new(
        events: mpsc::Sender<Event>,
        shutdown: broadcast::Sender<()>,
        dead_time: Duration,
    ) -> Self {
        Self {
            events,
            shutdown,
            next_id: Arc::new(AtomicU64::new(1)),
            dead_time,
            tls_acceptor: Arc::new(RwLock::new(None)),
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Announce an established stream to the dispatcher and start its I/O
    /// workers. The announcement goes first so the dispatcher learns of
    /// the connection before any message from it.
    async fn launch<S>(
        &self,
        stream: S,
        addr: SocketAddr,
        tls: bool,
        outbound_link: Option<String>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let conn = self.next_conn_id();
        let (tx, rx) = connection::outbound_queue();

        if self
            .events
            .send(Event::NewConnection {
                conn,
                addr,
                tx,
                tls,
                outbound_link,
            })
            .await
            .is_err()
        {
            return;
        }

        connection::spawn(
            stream,
            conn,
            self.events.clone(),
            self.shutdown.subscribe(),
            self.dead_time,
            rx,
        );
        resolver::spawn(conn, addr.ip(), self.events.clone());
    }
}

/// Run a plaintext accept loop until shutdown.
pub async fn run_plain(listener: TcpListener, ctx: IoContext) {
    let mut shutdown = ctx.shutdown.subscribe();
    info!(addr = ?listener.local_addr().ok(), "listening");
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.recv() => break,
        };
        match accepted {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                ctx.launch(stream, addr, false, None).await;
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

/// Run a TLS accept loop until shutdown. The handshake happens in its
/// own task so a stalled client cannot block the loop.
pub async fn run_tls(listener: TcpListener, ctx: IoContext) {
    let mut shutdown = ctx.shutdown.subscribe();
    info!(addr = ?listener.local_addr().ok(), "listening (tls)");
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.recv() => break,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let acceptor = match ctx.tls_acceptor.read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(acceptor) = acceptor else {
            warn!(%addr, "tls connection but no tls material loaded");
            continue;
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            match acceptor.accept(stream).await {
                Ok(stream) => ctx.launch(stream, addr, true, None).await,
                Err(e) => warn!(%addr, error = %e, "tls handshake failed"),
            }
        });
    }
}

/// Dial a configured peer. The result (if any) arrives at the dispatcher
/// as a `NewConnection` tagged with the link name.
pub fn connect_outbound(link: LinkBlock, ctx: IoContext) {
    tokio::spawn(async move {
        let target = format!("{}:{}", link.host, link.port);
        info!(peer = %link.name, %target, "connecting");

        let stream = match TcpStream::connect(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %link.name, error = %e, "connect failed");
                return;
            }
        };
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %link.name, error = %e, "connect failed");
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        if link.tls {
            let server_name = match ServerName::try_from(link.host.clone()) {
                Ok(name) => name,
                Err(e) => {
                    warn!(peer = %link.name, error = %e, "bad tls server name");
                    return;
                }
            };
            match tls::link_connector().connect(server_name, stream).await {
                Ok(stream) => ctx.launch(stream, addr, true, Some(link.name)).await,
                Err(e) => warn!(peer = %link.name, error = %e, "tls connect failed"),
            }
        } else {
            ctx.launch(stream, addr, false, Some(link.name)).await;
        }
    });
}
