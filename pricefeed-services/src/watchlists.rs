//! Watchlists and the interest set derived from them

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pricefeed_core::{FeedError, FeedResult, Security, SecurityId, Watchlist};

use crate::price_book::PriceBook;

/// Securities listing plus the user's watchlists, as served by the REST side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    #[serde(default)]
    pub securities: Vec<Security>,
    #[serde(default)]
    pub watchlists: Vec<Watchlist>,
}

impl Portfolio {
    /// Parse a portfolio document; anything but a JSON object is rejected
    pub fn from_json(text: &str) -> FeedResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| FeedError::config(format!("invalid portfolio: {}", e)))?;
        if !value.is_object() {
            return Err(FeedError::config("portfolio must be a JSON object"));
        }
        serde_json::from_value(value)
            .map_err(|e| FeedError::config(format!("invalid portfolio: {}", e)))
    }
}

/// Source of the tickers the stream should be subscribed to
pub trait InterestSet: Send + Sync {
    fn desired_tickers(&self) -> BTreeSet<String>;
}

/// All watchlists of the current user, keyed by watchlist id
#[derive(Debug, Default)]
pub struct WatchlistBook {
    watchlists: BTreeMap<u64, Watchlist>,
}

impl WatchlistBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every watchlist
    pub fn load(&mut self, watchlists: impl IntoIterator<Item = Watchlist>) {
        self.watchlists = watchlists.into_iter().map(|w| (w.id, w)).collect();
        debug!("[Watchlists] Loaded {} watchlists", self.watchlists.len());
    }

    pub fn upsert(&mut self, watchlist: Watchlist) {
        self.watchlists.insert(watchlist.id, watchlist);
    }

    pub fn remove(&mut self, id: u64) -> Option<Watchlist> {
        self.watchlists.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Watchlist> {
        self.watchlists.get(&id)
    }

    /// Returns false when the watchlist is unknown or already holds the security
    pub fn add_security(&mut self, watchlist_id: u64, security: SecurityId) -> bool {
        let Some(watchlist) = self.watchlists.get_mut(&watchlist_id) else {
            return false;
        };
        if watchlist.securities.contains(&security) {
            return false;
        }
        watchlist.securities.push(security);
        watchlist.updated_at = Some(Utc::now());
        true
    }

    /// Returns false when nothing was removed
    pub fn remove_security(&mut self, watchlist_id: u64, security: SecurityId) -> bool {
        let Some(watchlist) = self.watchlists.get_mut(&watchlist_id) else {
            return false;
        };
        let before = watchlist.securities.len();
        watchlist.securities.retain(|id| *id != security);
        if watchlist.securities.len() == before {
            return false;
        }
        watchlist.updated_at = Some(Utc::now());
        true
    }

    /// Union of the securities of every watchlist
    pub fn security_ids(&self) -> BTreeSet<SecurityId> {
        self.watchlists
            .values()
            .flat_map(|w| w.securities.iter().copied())
            .collect()
    }

    pub fn watchlists(&self) -> impl Iterator<Item = &Watchlist> {
        self.watchlists.values()
    }

    pub fn len(&self) -> usize {
        self.watchlists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchlists.is_empty()
    }
}

/// Interest set over the shared watchlist and price books.
///
/// Security ids resolve to tickers through the price book; ids the book
/// does not know are skipped.
#[derive(Debug, Clone)]
pub struct WatchlistInterest {
    watchlists: Arc<RwLock<WatchlistBook>>,
    prices: Arc<RwLock<PriceBook>>,
}

impl WatchlistInterest {
    pub fn new(watchlists: Arc<RwLock<WatchlistBook>>, prices: Arc<RwLock<PriceBook>>) -> Self {
        Self { watchlists, prices }
    }
}

impl InterestSet for WatchlistInterest {
    fn desired_tickers(&self) -> BTreeSet<String> {
        let ids = self.watchlists.read().security_ids();
        let prices = self.prices.read();

        let mut tickers = BTreeSet::new();
        for id in ids {
            match prices.ticker_of(id) {
                Some(ticker) => {
                    tickers.insert(ticker.to_string());
                }
                None => debug!("[Watchlists] {} has no known ticker", id),
            }
        }
        tickers
    }
}
