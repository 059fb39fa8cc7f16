//! Securities, watchlists and price movement types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a security (the REST primary key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityId(pub u64);

impl fmt::Display for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "security-{}", self.0)
    }
}

/// A tradable security as served by the securities endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub id: SecurityId,

    /// Ticker symbol used as the subscription key (e.g. "AAPL")
    pub ticker: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Last known price, `None` until first observed
    #[serde(default)]
    pub last_price: Option<Decimal>,
}

impl Security {
    pub fn new(id: u64, ticker: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: SecurityId(id),
            ticker: ticker.into(),
            name: name.into(),
            last_price: None,
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.last_price = Some(price);
        self
    }
}

/// A user's named list of securities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watchlist {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub securities: Vec<SecurityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Watchlist {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            securities: Vec::new(),
            updated_at: None,
        }
    }
}

/// Direction of a price change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Direction of the move from `previous` to `current`, `None` if equal
    pub fn between(previous: Decimal, current: Decimal) -> Option<Self> {
        match current.cmp(&previous) {
            std::cmp::Ordering::Greater => Some(Direction::Up),
            std::cmp::Ordering::Less => Some(Direction::Down),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// CSS class the UI applies while a flash is active
    pub fn css_class(&self) -> &'static str {
        match self {
            Direction::Up => "price-up",
            Direction::Down => "price-down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}
