//! Stream connection configuration

use std::time::Duration;

use url::Url;

use pricefeed_core::{FeedError, FeedResult};

/// Default securities stream endpoint; the identity is appended as `?token=`
pub const DEFAULT_STREAM_URL: &str = "ws://localhost:8001/ws/securities/";

/// Reconnect delay base, doubled for every failed attempt
pub const RECONNECT_DELAY_BASE: Duration = Duration::from_millis(3000);

/// Max reconnect attempts
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Configuration for [`StreamClient`](crate::StreamClient)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub endpoint: String,
    pub reconnect_base: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_STREAM_URL.to_string(),
            reconnect_base: RECONNECT_DELAY_BASE,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl StreamConfig {
    /// Defaults overridden by `PRICEFEED_WS_URL`, `PRICEFEED_RECONNECT_BASE_MS`
    /// and `PRICEFEED_MAX_RECONNECT_ATTEMPTS`
    pub fn from_env() -> FeedResult<Self> {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("PRICEFEED_WS_URL") {
            config.endpoint = endpoint;
        }
        if let Ok(base) = std::env::var("PRICEFEED_RECONNECT_BASE_MS") {
            let ms = base.parse::<u64>().map_err(|e| {
                FeedError::config(format!("PRICEFEED_RECONNECT_BASE_MS={}: {}", base, e))
            })?;
            config.reconnect_base = Duration::from_millis(ms);
        }
        if let Ok(max) = std::env::var("PRICEFEED_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = max.parse::<u32>().map_err(|e| {
                FeedError::config(format!("PRICEFEED_MAX_RECONNECT_ATTEMPTS={}: {}", max, e))
            })?;
        }

        // Fail early on a bad endpoint instead of at first connect
        Url::parse(&config.endpoint)
            .map_err(|e| FeedError::config(format!("invalid endpoint {}: {}", config.endpoint, e)))?;

        Ok(config)
    }

    /// Stream URL for one identity
    pub fn url_for(&self, identity: &str) -> FeedResult<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| FeedError::config(format!("invalid endpoint {}: {}", self.endpoint, e)))?;
        url.query_pairs_mut().append_pair("token", identity);
        Ok(url)
    }

    /// Delay before the reconnect that follows `attempts` failed ones
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.reconnect_base
            .checked_mul(2u32.saturating_pow(attempts))
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let config = StreamConfig::default();
        let delays: Vec<u128> = (0..5).map(|n| config.backoff(n).as_millis()).collect();
        assert_eq!(delays, vec![3000, 6000, 12000, 24000, 48000]);
    }

    #[test]
    fn test_url_carries_token() {
        let config = StreamConfig::default();
        let url = config.url_for("42").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8001/ws/securities/?token=42");

        let url = config.url_for("a b&c").unwrap();
        assert_eq!(url.query(), Some("token=a+b%26c"));
    }

    #[test]
    fn test_invalid_endpoint() {
        let config = StreamConfig {
            endpoint: "not a url".to_string(),
            ..StreamConfig::default()
        };
        assert!(matches!(config.url_for("1"), Err(FeedError::Config(_))));
    }
}
