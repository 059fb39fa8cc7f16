//! Stream handler that keeps the price book and flashes current

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use pricefeed_core::PriceUpdate;
use pricefeed_stream::PriceHandler;

use crate::flash::FlashTracker;
use crate::price_book::{PriceBook, PriceChange};

/// Global price handler of a session
#[derive(Debug, Clone)]
pub struct PriceFeed {
    prices: Arc<RwLock<PriceBook>>,
    flashes: FlashTracker,
}

impl PriceFeed {
    pub fn new(prices: Arc<RwLock<PriceBook>>, flashes: FlashTracker) -> Self {
        Self { prices, flashes }
    }

    /// Apply one update and start a flash when the price moved
    pub fn apply(&self, update: &PriceUpdate) -> PriceChange {
        // Read of the old price and write of the new one share one lock
        let change = self.prices.write().apply(update);

        if let PriceChange::Changed {
            id,
            previous,
            current,
            direction,
        } = &change
        {
            debug!(
                "[PriceBook] {} {} -> {} ({})",
                update.ticker, previous, current, direction
            );
            self.flashes.trigger(*id, *direction);
        }
        change
    }
}

impl PriceHandler for PriceFeed {
    fn on_price(&self, update: &PriceUpdate) -> anyhow::Result<()> {
        self.apply(update);
        Ok(())
    }
}
