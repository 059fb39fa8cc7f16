//! Flash state machine
//!
//! A price change puts its security into a short-lived `up` or `down`
//! highlight. Each security has at most one live flash; a new trigger
//! replaces the entry and cancels the previous expiry timer, so the flash
//! always ends one full duration after the latest change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use pricefeed_core::{Direction, SecurityId};

/// Default highlight duration
pub const FLASH_DURATION: Duration = Duration::from_millis(600);

const FLASH_CHANNEL_CAPACITY: usize = 256;

/// Flash tracker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    pub duration: Duration,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            duration: FLASH_DURATION,
        }
    }
}

/// Flash notification for UI consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    Started { id: SecurityId, direction: Direction },
    Cleared { id: SecurityId },
}

struct FlashEntry {
    direction: Direction,
    expires_at: Instant,
    seq: u64,
    timer: JoinHandle<()>,
}

struct Inner {
    config: FlashConfig,
    entries: Mutex<HashMap<SecurityId, FlashEntry>>,
    next_seq: AtomicU64,
    events_tx: broadcast::Sender<FlashEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, entry) in self.entries.get_mut().drain() {
            entry.timer.abort();
        }
    }
}

/// Per-security flash entries with their expiry timers.
///
/// Clones share the same entries. Triggering spawns a tokio timer, so it
/// must be called from inside a runtime.
#[derive(Clone)]
pub struct FlashTracker {
    inner: Arc<Inner>,
}

impl FlashTracker {
    pub fn new(config: FlashConfig) -> Self {
        let (events_tx, _) = broadcast::channel(FLASH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                events_tx,
            }),
        }
    }

    /// Start or restart the flash of `id`
    pub fn trigger(&self, id: SecurityId, direction: Direction) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let expires_at = Instant::now() + self.inner.config.duration;
        let timer = tokio::spawn(expire(Arc::downgrade(&self.inner), id, seq, expires_at));

        let previous = self.inner.entries.lock().insert(
            id,
            FlashEntry {
                direction,
                expires_at,
                seq,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }

        debug!("[Flash] {} flashing {}", id, direction);
        let _ = self
            .inner
            .events_tx
            .send(FlashEvent::Started { id, direction });
    }

    /// Current flash direction, `None` once the entry has expired
    pub fn direction(&self, id: SecurityId) -> Option<Direction> {
        let entries = self.inner.entries.lock();
        entries
            .get(&id)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| entry.direction)
    }

    /// `price-up` / `price-down` while flashing
    pub fn css_class(&self, id: SecurityId) -> Option<&'static str> {
        self.direction(id).map(|d| d.css_class())
    }

    /// Securities currently flashing
    pub fn active(&self) -> Vec<(SecurityId, Direction)> {
        let now = Instant::now();
        let mut active: Vec<_> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| now < entry.expires_at)
            .map(|(id, entry)| (*id, entry.direction))
            .collect();
        active.sort_by_key(|(id, _)| *id);
        active
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Drop every flash and cancel all timers
    pub fn clear(&self) {
        let drained: Vec<(SecurityId, FlashEntry)> = self.inner.entries.lock().drain().collect();
        if !drained.is_empty() {
            debug!("[Flash] Clearing {} flashes", drained.len());
        }
        for (id, entry) in drained {
            entry.timer.abort();
            let _ = self.inner.events_tx.send(FlashEvent::Cleared { id });
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.inner.config
    }
}

impl Default for FlashTracker {
    fn default() -> Self {
        Self::new(FlashConfig::default())
    }
}

impl std::fmt::Debug for FlashTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashTracker")
            .field("duration", &self.inner.config.duration)
            .field("entries", &self.inner.entries.lock().len())
            .finish()
    }
}

/// Expiry timer of one trigger; a newer trigger owns the entry once `seq` moved on
async fn expire(inner: Weak<Inner>, id: SecurityId, seq: u64, at: Instant) {
    tokio::time::sleep_until(at).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let removed = {
        let mut entries = inner.entries.lock();
        match entries.get(&id) {
            Some(entry) if entry.seq == seq => entries.remove(&id).is_some(),
            _ => false,
        }
    };
    if removed {
        debug!("[Flash] {} cleared", id);
        let _ = inner.events_tx.send(FlashEvent::Cleared { id });
    }
}
