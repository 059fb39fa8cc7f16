//! Session orchestration
//!
//! A [`Session`] is one authenticated user's view of the price stream. It
//! owns the stream client, the price and watchlist books and the flash
//! tracker, and keeps the server-side subscriptions equal to the tickers
//! of the user's watchlists across edits and reconnects.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pricefeed_core::{ConnectionState, Direction, FeedResult, Security, SecurityId};
use pricefeed_stream::{
    Connector, HandlerId, LifecycleEvent, ReconcileOutcome, StreamClient, StreamConfig,
};

use crate::flash::{FlashConfig, FlashEvent, FlashTracker};
use crate::price_book::{PriceBook, PriceEntry};
use crate::price_feed::PriceFeed;
use crate::watchlists::{InterestSet, Portfolio, WatchlistBook, WatchlistInterest};

/// Configuration for a [`Session`]
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub stream: StreamConfig,
    pub flash: FlashConfig,
}

impl SessionConfig {
    /// Stream settings from the environment, default flash duration
    pub fn from_env() -> FeedResult<Self> {
        Ok(Self {
            stream: StreamConfig::from_env()?,
            flash: FlashConfig::default(),
        })
    }
}

#[derive(Default)]
struct SessionState {
    feed_handler: Option<HandlerId>,
    resync: Option<JoinHandle<()>>,
}

/// One user's live price session
pub struct Session {
    client: StreamClient,
    prices: Arc<RwLock<PriceBook>>,
    watchlists: Arc<RwLock<WatchlistBook>>,
    flashes: FlashTracker,
    interest: Arc<dyn InterestSet>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create a logged-out session; spawns the stream actor, so call from a runtime
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let prices = Arc::new(RwLock::new(PriceBook::new()));
        let watchlists = Arc::new(RwLock::new(WatchlistBook::new()));
        let interest = Arc::new(WatchlistInterest::new(
            Arc::clone(&watchlists),
            Arc::clone(&prices),
        ));

        Self {
            client: StreamClient::spawn(config.stream, connector),
            prices,
            watchlists,
            flashes: FlashTracker::new(config.flash),
            interest,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Load securities and watchlists fetched from the REST side
    pub fn load_portfolio(&self, portfolio: Portfolio) {
        self.prices.write().load(portfolio.securities);
        self.watchlists.write().load(portfolio.watchlists);
        info!(
            "[Session] Loaded {} securities, {} watchlists",
            self.prices.read().len(),
            self.watchlists.read().len()
        );
    }

    /// Register the price feed, connect with `identity` and subscribe to
    /// every watchlist ticker.
    ///
    /// Tickers are queued before the connect, so the first open sends one
    /// subscribe frame. After any later reconnect the subscriptions are
    /// re-derived and re-sent.
    pub async fn login(&self, identity: &str) -> FeedResult<()> {
        {
            let mut state = self.state.lock();
            if state.feed_handler.is_none() {
                let feed = PriceFeed::new(Arc::clone(&self.prices), self.flashes.clone());
                state.feed_handler = Some(self.client.add_global_handler(Arc::new(feed)));
            }
            if state.resync.is_none() {
                state.resync = Some(tokio::spawn(resync_on_connect(
                    self.client.clone(),
                    self.client.lifecycle(),
                    Arc::clone(&self.interest),
                )));
            }
        }

        info!("[Session] Logging in");
        self.sync_subscriptions().await?;
        self.client.connect(identity).await
    }

    /// Disconnect, unregister the price feed and drop all flashes
    pub async fn logout(&self) {
        let (handler, resync) = {
            let mut state = self.state.lock();
            (state.feed_handler.take(), state.resync.take())
        };
        if let Some(task) = resync {
            task.abort();
        }

        self.client.disconnect().await;

        if let Some(id) = handler {
            self.client.remove_global_handler(id);
        }
        self.flashes.clear();
        info!("[Session] Logged out");
    }

    /// Reconcile the stream against the current watchlist tickers
    pub async fn sync_subscriptions(&self) -> FeedResult<ReconcileOutcome> {
        let desired = self.interest.desired_tickers();
        let outcome = self.client.reconcile(desired).await?;
        if !outcome.is_noop() {
            debug!(
                "[Session] Subscriptions synced (+{:?} -{:?})",
                outcome.subscribed, outcome.unsubscribed
            );
        }
        Ok(outcome)
    }

    /// Edit the watchlists, then resync the subscriptions
    pub async fn update_watchlists<F, R>(&self, edit: F) -> FeedResult<R>
    where
        F: FnOnce(&mut WatchlistBook) -> R,
    {
        let result = {
            let mut watchlists = self.watchlists.write();
            edit(&mut watchlists)
        };
        self.sync_subscriptions().await?;
        Ok(result)
    }

    /// Add or replace one security in the price book, then resync
    pub async fn upsert_security(&self, security: Security) -> FeedResult<ReconcileOutcome> {
        self.prices.write().upsert(security);
        self.sync_subscriptions().await
    }

    pub fn price(&self, id: SecurityId) -> Option<Decimal> {
        self.prices.read().price(id)
    }

    pub fn entry(&self, id: SecurityId) -> Option<PriceEntry> {
        self.prices.read().entry(id).cloned()
    }

    pub fn entry_by_ticker(&self, ticker: &str) -> Option<PriceEntry> {
        self.prices.read().by_ticker(ticker).cloned()
    }

    pub fn flash_direction(&self, id: SecurityId) -> Option<Direction> {
        self.flashes.direction(id)
    }

    pub fn flash_class(&self, id: SecurityId) -> Option<&'static str> {
        self.flashes.css_class(id)
    }

    pub fn flash_events(&self) -> broadcast::Receiver<FlashEvent> {
        self.flashes.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn client(&self) -> &StreamClient {
        &self.client
    }

    pub fn prices(&self) -> &Arc<RwLock<PriceBook>> {
        &self.prices
    }

    pub fn watchlists(&self) -> &Arc<RwLock<WatchlistBook>> {
        &self.watchlists
    }

    pub fn flashes(&self) -> &FlashTracker {
        &self.flashes
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().resync.take() {
            task.abort();
        }
        self.flashes.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client)
            .field("securities", &self.prices.read().len())
            .field("watchlists", &self.watchlists.read().len())
            .finish()
    }
}

/// Re-send the full interest set every time the stream (re)connects
async fn resync_on_connect(
    client: StreamClient,
    mut lifecycle: broadcast::Receiver<LifecycleEvent>,
    interest: Arc<dyn InterestSet>,
) {
    loop {
        match lifecycle.recv().await {
            Ok(LifecycleEvent::StateChanged(ConnectionState::Connected)) => {
                match client.reconcile(interest.desired_tickers()).await {
                    Ok(outcome) if !outcome.is_noop() => {
                        info!("[Session] Resubscribed {:?}", outcome.subscribed);
                    }
                    Ok(_) => {}
                    Err(e) => error!("[Session] Resync failed: {}", e),
                }
            }
            Ok(LifecycleEvent::RetriesExhausted { attempts }) => {
                warn!(
                    "[Session] Stream gave up after {} attempts, login again to resume",
                    attempts
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("[Session] Lifecycle receiver lagged by {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
