//! Price update handler registry
//!
//! Global handlers see every validated update; ticker handlers see only
//! updates for the ticker they were registered under. A handler that
//! returns an error or panics is logged and skipped, the rest still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use pricefeed_core::PriceUpdate;

/// Observer of inbound price updates
pub trait PriceHandler: Send + Sync {
    fn on_price(&self, update: &PriceUpdate) -> anyhow::Result<()>;
}

impl<F> PriceHandler for F
where
    F: Fn(&PriceUpdate) -> anyhow::Result<()> + Send + Sync,
{
    fn on_price(&self, update: &PriceUpdate) -> anyhow::Result<()> {
        self(update)
    }
}

/// Registration token used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

type Entry = (HandlerId, Arc<dyn PriceHandler>);

#[derive(Default)]
struct Handlers {
    global: Vec<Entry>,
    by_ticker: HashMap<String, Vec<Entry>>,
}

/// Shared handler registry
///
/// Cloning shares the same registry. Dispatch snapshots the handler lists
/// before calling them, so a handler may add or remove handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    next_id: Arc<AtomicU64>,
    handlers: Arc<RwLock<Handlers>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn add_global(&self, handler: Arc<dyn PriceHandler>) -> HandlerId {
        let id = self.next_id();
        let mut handlers = self.handlers.write();
        handlers.global.push((id, handler));
        debug!("[Handlers] Added global {} ({} total)", id, handlers.global.len());
        id
    }

    /// Returns whether the handler was registered
    pub fn remove_global(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.global.len();
        handlers.global.retain(|(h, _)| *h != id);
        before != handlers.global.len()
    }

    pub fn clear_global(&self) {
        self.handlers.write().global.clear();
    }

    pub fn add_ticker(&self, ticker: impl Into<String>, handler: Arc<dyn PriceHandler>) -> HandlerId {
        let id = self.next_id();
        self.handlers
            .write()
            .by_ticker
            .entry(ticker.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns whether the handler was registered under `ticker`
    pub fn remove_ticker(&self, ticker: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.by_ticker.get_mut(ticker) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        let removed = before != list.len();
        if list.is_empty() {
            handlers.by_ticker.remove(ticker);
        }
        removed
    }

    pub fn clear_ticker(&self, ticker: &str) {
        self.handlers.write().by_ticker.remove(ticker);
    }

    pub fn global_count(&self) -> usize {
        self.handlers.read().global.len()
    }

    pub fn ticker_count(&self, ticker: &str) -> usize {
        self.handlers
            .read()
            .by_ticker
            .get(ticker)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Run global handlers, then the ticker's handlers, in registration order.
    /// Returns how many handlers failed.
    pub fn dispatch(&self, update: &PriceUpdate) -> usize {
        let (global, specific) = {
            let handlers = self.handlers.read();
            let global: Vec<Entry> = handlers.global.clone();
            let specific: Vec<Entry> = handlers
                .by_ticker
                .get(&update.ticker)
                .cloned()
                .unwrap_or_default();
            (global, specific)
        };

        if global.is_empty() {
            debug!("[Handlers] No global handlers registered for {}", update.ticker);
        }

        let mut failures = 0;
        for (id, handler) in global.iter().chain(specific.iter()) {
            if !invoke(*id, handler.as_ref(), update) {
                failures += 1;
            }
        }
        failures
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("HandlerRegistry")
            .field("global", &handlers.global.len())
            .field("tickers", &handlers.by_ticker.len())
            .finish()
    }
}

/// Call one handler, isolating errors and panics
fn invoke(id: HandlerId, handler: &dyn PriceHandler, update: &PriceUpdate) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler.on_price(update))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("[Handlers] {} failed for {}: {:#}", id, update.ticker, e);
            false
        }
        Err(_) => {
            error!("[Handlers] {} panicked for {}", id, update.ticker);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Arc<dyn PriceHandler> {
        let log = Arc::clone(log);
        Arc::new(move |update: &PriceUpdate| -> anyhow::Result<()> {
            log.lock().push(format!("{}:{}", label, update.ticker));
            Ok(())
        })
    }

    #[test]
    fn test_dispatch_order_global_then_ticker() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add_ticker("AAPL", recorder(&log, "aapl"));
        registry.add_global(recorder(&log, "g1"));
        registry.add_global(recorder(&log, "g2"));
        registry.add_ticker("MSFT", recorder(&log, "msft"));

        let failures = registry.dispatch(&PriceUpdate::new("AAPL", dec!(150)));
        assert_eq!(failures, 0);
        assert_eq!(*log.lock(), vec!["g1:AAPL", "g2:AAPL", "aapl:AAPL"]);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add_global(Arc::new(|_: &PriceUpdate| -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }));
        registry.add_global(Arc::new(|_: &PriceUpdate| -> anyhow::Result<()> {
            panic!("handler panic")
        }));
        registry.add_global(recorder(&log, "after"));

        let failures = registry.dispatch(&PriceUpdate::new("AAPL", dec!(1)));
        assert_eq!(failures, 2);
        assert_eq!(*log.lock(), vec!["after:AAPL"]);
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let global = registry.add_global(recorder(&log, "g"));
        let ticker = registry.add_ticker("AAPL", recorder(&log, "t"));

        assert!(registry.remove_global(global));
        assert!(!registry.remove_global(global));
        assert!(!registry.remove_ticker("MSFT", ticker));
        assert!(registry.remove_ticker("AAPL", ticker));
        assert!(!registry.remove_ticker("AAPL", ticker));
        assert_eq!(registry.ticker_count("AAPL"), 0);

        registry.dispatch(&PriceUpdate::new("AAPL", dec!(1)));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_dispatch_without_global_handlers() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_ticker("AAPL", recorder(&log, "t"));

        assert_eq!(registry.dispatch(&PriceUpdate::new("AAPL", dec!(1))), 0);
        assert_eq!(registry.dispatch(&PriceUpdate::new("MSFT", dec!(1))), 0);
        assert_eq!(*log.lock(), vec!["t:AAPL"]);
    }

    #[test]
    fn test_clear_handlers() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add_global(recorder(&log, "g"));
        registry.add_ticker("AAPL", recorder(&log, "a"));
        registry.add_ticker("AAPL", recorder(&log, "b"));
        assert_eq!(registry.ticker_count("AAPL"), 2);

        registry.clear_ticker("AAPL");
        registry.clear_global();
        assert_eq!(registry.global_count(), 0);
        assert_eq!(registry.ticker_count("AAPL"), 0);
    }
}
