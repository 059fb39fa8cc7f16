//! Core types for the price feed
//!
//! This crate defines the shared data structures used across the feed,
//! including securities, watchlists, the stream wire protocol and the
//! error type.

pub mod error;
pub mod security;
pub mod websocket;

pub use error::{FeedError, FeedResult};
pub use security::{Direction, Security, SecurityId, Watchlist};
pub use websocket::{
    decode_frame, parse_price, ClientMessage, ConnectionState, PriceUpdate, ServerFrame,
};
