//! Price book
//!
//! Authoritative last known price per security. Entries come from the
//! securities endpoint; stream updates only ever change the price of a
//! security that is already known.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use pricefeed_core::{Direction, PriceUpdate, Security, SecurityId};

/// One security's price state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceEntry {
    pub id: SecurityId,
    pub ticker: String,
    pub name: String,
    /// `None` until the first price is observed
    pub price: Option<Decimal>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl From<Security> for PriceEntry {
    fn from(security: Security) -> Self {
        Self {
            id: security.id,
            ticker: security.ticker,
            name: security.name,
            price: security.last_price,
            last_updated: None,
        }
    }
}

/// What applying one update did to the book
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceChange {
    /// No security with that ticker; nothing was created
    UnknownTicker,
    /// Same price, only the timestamp moved
    Unchanged { id: SecurityId },
    /// First price for a security that had none
    FirstObserved { id: SecurityId, price: Decimal },
    Changed {
        id: SecurityId,
        previous: Decimal,
        current: Decimal,
        direction: Direction,
    },
}

impl PriceChange {
    /// Security and direction when the update should flash
    pub fn flash(&self) -> Option<(SecurityId, Direction)> {
        match self {
            PriceChange::Changed { id, direction, .. } => Some((*id, *direction)),
            _ => None,
        }
    }
}

/// Security id -> price entry, indexed by ticker
#[derive(Debug, Default)]
pub struct PriceBook {
    entries: HashMap<SecurityId, PriceEntry>,
    by_ticker: HashMap<String, SecurityId>,
    last_updated: Option<DateTime<Utc>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_securities(securities: impl IntoIterator<Item = Security>) -> Self {
        let mut book = Self::new();
        book.load(securities);
        book
    }

    /// Replace the book's contents with a fresh securities listing
    pub fn load(&mut self, securities: impl IntoIterator<Item = Security>) {
        self.entries.clear();
        self.by_ticker.clear();
        for security in securities {
            self.upsert(security);
        }
        self.last_updated = Some(Utc::now());
        debug!("[PriceBook] Loaded {} securities", self.entries.len());
    }

    /// Insert or replace one security
    pub fn upsert(&mut self, security: Security) {
        if let Some(previous) = self.by_ticker.get(&security.ticker) {
            if *previous != security.id {
                warn!(
                    "[PriceBook] Ticker {} moves from {} to {}",
                    security.ticker, previous, security.id
                );
                self.entries.remove(previous);
            }
        }
        if let Some(old) = self.entries.get(&security.id) {
            if old.ticker != security.ticker {
                self.by_ticker.remove(&old.ticker);
            }
        }
        self.by_ticker.insert(security.ticker.clone(), security.id);
        self.entries.insert(security.id, PriceEntry::from(security));
    }

    pub fn remove(&mut self, id: SecurityId) -> Option<PriceEntry> {
        let entry = self.entries.remove(&id)?;
        self.by_ticker.remove(&entry.ticker);
        Some(entry)
    }

    /// Apply a validated stream update.
    ///
    /// The direction is computed from the stored price in the same step
    /// that replaces it.
    pub fn apply(&mut self, update: &PriceUpdate) -> PriceChange {
        let Some(id) = self.by_ticker.get(&update.ticker).copied() else {
            debug!("[PriceBook] Ignoring update for untracked ticker {}", update.ticker);
            return PriceChange::UnknownTicker;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            return PriceChange::UnknownTicker;
        };

        let now = Utc::now();
        entry.last_updated = Some(now);
        self.last_updated = Some(now);

        match entry.price {
            None => {
                entry.price = Some(update.price);
                PriceChange::FirstObserved {
                    id,
                    price: update.price,
                }
            }
            Some(previous) => match Direction::between(previous, update.price) {
                None => PriceChange::Unchanged { id },
                Some(direction) => {
                    entry.price = Some(update.price);
                    PriceChange::Changed {
                        id,
                        previous,
                        current: update.price,
                        direction,
                    }
                }
            },
        }
    }

    pub fn price(&self, id: SecurityId) -> Option<Decimal> {
        self.entries.get(&id).and_then(|e| e.price)
    }

    pub fn entry(&self, id: SecurityId) -> Option<&PriceEntry> {
        self.entries.get(&id)
    }

    pub fn by_ticker(&self, ticker: &str) -> Option<&PriceEntry> {
        self.by_ticker.get(ticker).and_then(|id| self.entries.get(id))
    }

    pub fn ticker_of(&self, id: SecurityId) -> Option<&str> {
        self.entries.get(&id).map(|e| e.ticker.as_str())
    }

    pub fn contains_ticker(&self, ticker: &str) -> bool {
        self.by_ticker.contains_key(ticker)
    }

    /// All entries ordered by security id
    pub fn entries(&self) -> Vec<PriceEntry> {
        let mut entries: Vec<PriceEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time of the last load or applied update
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> PriceBook {
        PriceBook::from_securities(vec![
            Security::new(1, "AAPL", "Apple Inc.").with_price(dec!(150.00)),
            Security::new(2, "MSFT", "Microsoft"),
        ])
    }

    #[test]
    fn test_price_up_and_down() {
        let mut book = book();

        let change = book.apply(&PriceUpdate::new("AAPL", dec!(151.25)));
        assert_eq!(
            change,
            PriceChange::Changed {
                id: SecurityId(1),
                previous: dec!(150.00),
                current: dec!(151.25),
                direction: Direction::Up,
            }
        );
        assert_eq!(book.price(SecurityId(1)), Some(dec!(151.25)));

        let change = book.apply(&PriceUpdate::new("AAPL", dec!(149)));
        assert_eq!(change.flash(), Some((SecurityId(1), Direction::Down)));
        assert_eq!(book.price(SecurityId(1)), Some(dec!(149)));
    }

    #[test]
    fn test_unchanged_price_only_touches_timestamp() {
        let mut book = book();
        assert!(book.entry(SecurityId(1)).unwrap().last_updated.is_none());

        let change = book.apply(&PriceUpdate::new("AAPL", dec!(150)));
        assert_eq!(change, PriceChange::Unchanged { id: SecurityId(1) });
        assert_eq!(change.flash(), None);

        let entry = book.entry(SecurityId(1)).unwrap();
        assert!(entry.last_updated.is_some());
        assert_eq!(entry.price, Some(dec!(150.00)));
    }

    #[test]
    fn test_first_observed_price_does_not_flash() {
        let mut book = book();
        assert_eq!(book.price(SecurityId(2)), None);

        let change = book.apply(&PriceUpdate::new("MSFT", dec!(410.5)));
        assert_eq!(
            change,
            PriceChange::FirstObserved {
                id: SecurityId(2),
                price: dec!(410.5)
            }
        );
        assert_eq!(change.flash(), None);
        assert_eq!(book.price(SecurityId(2)), Some(dec!(410.5)));
    }

    #[test]
    fn test_untracked_ticker_is_ignored() {
        let mut book = book();
        let change = book.apply(&PriceUpdate::new("ZZZZ", dec!(10)));
        assert_eq!(change, PriceChange::UnknownTicker);
        assert_eq!(book.len(), 2);
        assert!(book.by_ticker("ZZZZ").is_none());
    }

    #[test]
    fn test_upsert_and_remove_keep_index_consistent() {
        let mut book = book();

        // Ticker rename keeps the id
        book.upsert(Security::new(2, "MSFT.O", "Microsoft"));
        assert!(!book.contains_ticker("MSFT"));
        assert_eq!(book.ticker_of(SecurityId(2)), Some("MSFT.O"));

        let removed = book.remove(SecurityId(1)).unwrap();
        assert_eq!(removed.ticker, "AAPL");
        assert!(!book.contains_ticker("AAPL"));
        assert_eq!(book.apply(&PriceUpdate::new("AAPL", dec!(1))), PriceChange::UnknownTicker);

        let ids: Vec<SecurityId> = book.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![SecurityId(2)]);
    }
}
