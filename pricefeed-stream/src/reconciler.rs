//! Subscription set bookkeeping
//!
//! Tracks which tickers have been sent to the server (`active`) and which
//! are wanted but waiting for the connection to open (`pending`). The
//! connection actor is the only writer.

use std::collections::BTreeSet;

/// Snapshot of the subscription sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    pub active: BTreeSet<String>,
    pub pending: BTreeSet<String>,
}

/// What a `reconcile` call has to do against the current active set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Result of one `reconcile` call, reported back to the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Sent in a subscribe frame
    pub subscribed: Vec<String>,
    /// Sent in an unsubscribe frame
    pub unsubscribed: Vec<String>,
    /// Waiting for the connection to open
    pub queued: Vec<String>,
}

impl ReconcileOutcome {
    /// No frame was written
    pub fn is_noop(&self) -> bool {
        self.subscribed.is_empty() && self.unsubscribed.is_empty()
    }
}

impl SubscriptionSet {
    /// `desired - active` and `active - desired`, in ticker order
    pub fn plan(&self, desired: &BTreeSet<String>) -> Delta {
        Delta {
            to_add: desired.difference(&self.active).cloned().collect(),
            to_remove: self.active.difference(desired).cloned().collect(),
        }
    }

    /// Append to the pending queue while offline; returns the newly queued tickers
    pub fn queue(&mut self, tickers: Vec<String>) -> Vec<String> {
        tickers
            .into_iter()
            .filter(|ticker| self.pending.insert(ticker.clone()))
            .collect()
    }

    /// Take the whole pending queue for one subscribe frame
    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub fn mark_subscribed(&mut self, tickers: &[String]) {
        for ticker in tickers {
            self.pending.remove(ticker);
            self.active.insert(ticker.clone());
        }
    }

    pub fn mark_unsubscribed(&mut self, tickers: &[String]) {
        for ticker in tickers {
            self.active.remove(ticker);
        }
    }

    /// Put tickers back in the queue after a failed send
    pub fn requeue(&mut self, tickers: Vec<String>) {
        self.pending.extend(tickers);
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tickers: &[&str]) -> BTreeSet<String> {
        tickers.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_plan_is_set_difference() {
        let subs = SubscriptionSet {
            active: set(&["AAPL", "MSFT"]),
            pending: BTreeSet::new(),
        };

        let delta = subs.plan(&set(&["MSFT", "TSLA", "AMZN"]));
        assert_eq!(delta.to_add, vec!["AMZN", "TSLA"]);
        assert_eq!(delta.to_remove, vec!["AAPL"]);

        assert!(subs.plan(&set(&["AAPL", "MSFT"])).is_empty());
    }

    #[test]
    fn test_queue_appends_to_pending() {
        let mut subs = SubscriptionSet::default();

        assert_eq!(subs.queue(vec!["AAPL".into(), "MSFT".into()]), vec!["AAPL", "MSFT"]);
        // Unchanged desired set queues nothing new
        assert!(subs.queue(vec!["AAPL".into(), "MSFT".into()]).is_empty());
        // A smaller desired set keeps what is already queued
        assert!(subs.queue(vec!["MSFT".into()]).is_empty());
        assert_eq!(subs.pending, set(&["AAPL", "MSFT"]));

        assert_eq!(subs.queue(vec!["TSLA".into()]), vec!["TSLA"]);
        assert_eq!(subs.pending, set(&["AAPL", "MSFT", "TSLA"]));
    }

    #[test]
    fn test_flush_moves_pending_to_active() {
        let mut subs = SubscriptionSet::default();
        subs.queue(vec!["AAPL".into(), "MSFT".into()]);

        let flushed = subs.take_pending();
        assert_eq!(flushed, vec!["AAPL", "MSFT"]);
        subs.mark_subscribed(&flushed);

        assert_eq!(subs.active, set(&["AAPL", "MSFT"]));
        assert!(subs.pending.is_empty());
        assert!(subs.active.is_disjoint(&subs.pending));

        subs.mark_unsubscribed(&["AAPL".to_string()]);
        assert_eq!(subs.active, set(&["MSFT"]));

        subs.clear();
        assert!(subs.is_empty());
    }
}
