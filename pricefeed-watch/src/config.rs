//! Watcher configuration from the environment

use std::path::PathBuf;

use anyhow::{Context, Result};

use pricefeed_services::{Portfolio, SessionConfig};

/// Everything the watcher needs to open a session
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Opaque identity sent as the stream `token`
    pub token: String,
    /// JSON file with the securities listing and watchlists
    pub portfolio_path: Option<PathBuf>,
    pub session: SessionConfig,
}

impl WatchConfig {
    /// Reads `PRICEFEED_TOKEN` (required) and `PRICEFEED_PORTFOLIO`, plus the
    /// stream overrides understood by [`SessionConfig::from_env`]
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("PRICEFEED_TOKEN").context("PRICEFEED_TOKEN is not set")?;
        let portfolio_path = std::env::var("PRICEFEED_PORTFOLIO").ok().map(PathBuf::from);
        let session = SessionConfig::from_env()?;

        Ok(Self {
            token,
            portfolio_path,
            session,
        })
    }

    /// The configured portfolio, or an empty one when no file is set
    pub fn load_portfolio(&self) -> Result<Portfolio> {
        let Some(path) = &self.portfolio_path else {
            return Ok(Portfolio::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading portfolio {}", path.display()))?;
        Ok(Portfolio::from_json(&text)?)
    }
}
