//! Watchlist price feed watcher
//!
//! Opens a session for `PRICEFEED_TOKEN`, subscribes to the tickers of the
//! watchlists in `PRICEFEED_PORTFOLIO` and logs price flashes and
//! connection changes until interrupted.

mod config;

use std::sync::Arc;

use pricefeed_services::{FlashEvent, Session};
use pricefeed_stream::{LifecycleEvent, WsConnector};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::WatchConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pricefeed_watch=debug")),
        )
        .init();

    let config = WatchConfig::from_env()?;
    info!("Starting price watcher against {}", config.session.stream.endpoint);

    let portfolio = config.load_portfolio()?;
    if portfolio.watchlists.is_empty() {
        warn!("No watchlists configured, nothing will be subscribed");
    }

    let session = Arc::new(Session::new(config.session.clone(), Arc::new(WsConnector)));
    session.load_portfolio(portfolio);

    tokio::spawn(log_flashes(Arc::clone(&session)));
    tokio::spawn(log_lifecycle(session.client().lifecycle()));

    match session.login(&config.token).await {
        Ok(()) => {}
        Err(e) if e.is_terminal() => return Err(e.into()),
        // The client keeps retrying in the background
        Err(e) => error!("Initial connect failed: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    session.logout().await;
    Ok(())
}

async fn log_flashes(session: Arc<Session>) {
    let mut events = session.flash_events();
    loop {
        match events.recv().await {
            Ok(FlashEvent::Started { id, direction }) => {
                let Some(entry) = session.entry(id) else {
                    continue;
                };
                let price = entry
                    .price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                info!("{:<6} {:>12} {}", entry.ticker, price, direction.css_class());
            }
            Ok(FlashEvent::Cleared { .. }) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} flash events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_lifecycle(mut lifecycle: tokio::sync::broadcast::Receiver<LifecycleEvent>) {
    loop {
        match lifecycle.recv().await {
            Ok(LifecycleEvent::StateChanged(state)) => info!("Connection {:?}", state),
            Ok(LifecycleEvent::ReconnectScheduled { attempt, delay }) => {
                info!("Reconnect attempt {} in {:?}", attempt, delay)
            }
            Ok(LifecycleEvent::RetriesExhausted { attempts }) => {
                error!("Gave up after {} reconnect attempts", attempts);
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
