//! petreld - a small IRC server with TS6 server-to-server linking.

mod config;
mod dispatcher;
mod error;
mod event;
mod handlers;
mod network;
mod state;
mod sync;

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::event::Event;
use crate::network::listener::{self, IoContext};
use crate::network::tls;

/// How often the dispatcher gets a timer tick for idle pings, dead
/// cutoffs, and reconnect attempts.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "petreld.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load config");
        e
    })?;

    info!(
        server = %config.server.name,
        sid = %config.server.sid,
        "starting petreld"
    );

    let (events_tx, events_rx) = event::queue();
    let (shutdown_tx, _) = broadcast::channel(1);
    let ctx = IoContext::new(
        events_tx.clone(),
        shutdown_tx.clone(),
        config.timeouts.dead(),
    );

    // TLS material, if configured. Refreshed on reload.
    if let (Some(cert), Some(key)) = (
        config.listen.certificate_file.as_ref(),
        config.listen.key_file.as_ref(),
    ) {
        let acceptor = tls::acceptor(cert, key)?;
        if let Ok(mut guard) = ctx.tls_acceptor.write() {
            *guard = Some(acceptor);
        }
    }

    let plain = TcpListener::bind((config.listen.host.as_str(), config.listen.port)).await?;
    tokio::spawn(listener::run_plain(plain, ctx.clone()));

    if let Some(tls_port) = config.listen.tls_port {
        let secured = TcpListener::bind((config.listen.host.as_str(), tls_port)).await?;
        tokio::spawn(listener::run_tls(secured, ctx.clone()));
    }

    // Timer ticks.
    {
        let events = events_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if events.send(Event::Tick).await.is_err() {
                    break;
                }
            }
        });
    }

    // Signals: SIGHUP reloads, SIGTERM/SIGINT shut down.
    {
        let events = events_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "unable to install SIGHUP handler");
                    return;
                }
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "unable to install SIGTERM handler");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        if events.send(Event::SignalReload).await.is_err() {
                            break;
                        }
                    }
                    _ = terminate.recv() => {
                        let _ = events.send(Event::Shutdown).await;
                        break;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        let _ = events.send(Event::Shutdown).await;
                        break;
                    }
                }
            }
        });
    }

    let dispatcher = Dispatcher::new(config, config_path.into(), Some(ctx));
    dispatcher.run(events_rx).await;

    info!("shutdown complete");
    Ok(())
}
