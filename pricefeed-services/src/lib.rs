//! Services for the watchlist price feed
//!
//! Builds the user-facing price state on top of the stream client: the
//! price book, per-security flash highlights, the interest set derived
//! from watchlists, and the session that ties them to one connection.

pub mod flash;
pub mod price_book;
pub mod price_feed;
pub mod session;
pub mod watchlists;

pub use flash::{FlashConfig, FlashEvent, FlashTracker, FLASH_DURATION};
pub use price_book::{PriceBook, PriceChange, PriceEntry};
pub use price_feed::PriceFeed;
pub use session::{Session, SessionConfig};
pub use watchlists::{InterestSet, Portfolio, WatchlistBook, WatchlistInterest};
