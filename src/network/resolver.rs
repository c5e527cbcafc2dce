//! Forward-confirmed reverse DNS.
//!
//! Run off the core thread, one task per new connection; the outcome is
//! delivered as a `HostnameResolved` event. A connection registers with
//! its IP literal if no confirmed name arrives.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::{ConnId, Event};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn the lookup for one connection.
pub fn spawn(conn: ConnId, ip: IpAddr, events: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let hostname = tokio::time::timeout(LOOKUP_TIMEOUT, lookup(ip))
            .await
            .unwrap_or(None);
        let _ = events.send(Event::HostnameResolved { conn, hostname }).await;
    });
}

/// Reverse-resolve `ip`, then forward-resolve each candidate name; a name
/// counts only if one of its addresses is the original IP.
async fn lookup(ip: IpAddr) -> Option<String> {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            debug!(error = %e, "resolver unavailable");
            return None;
        }
    };

    let names = match resolver.reverse_lookup(ip).await {
        Ok(names) => names,
        Err(_) => return None,
    };

    for ptr in names.iter() {
        let name = ptr.0.to_ascii();
        let Ok(addrs) = resolver.lookup_ip(name.as_str()).await else {
            continue;
        };
        if addrs.iter().any(|addr| addr == ip) {
            return Some(name.trim_end_matches('.').to_string());
        }
    }

    None
}
