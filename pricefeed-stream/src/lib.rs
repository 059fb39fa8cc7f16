//! Price stream client for the watchlist price feed
//!
//! Keeps one persistent websocket to the securities stream server:
//! connects with an opaque identity token, reconnects with geometric
//! backoff after abnormal closes, reconciles the server-side subscription
//! set against the tickers the client wants, and dispatches validated
//! price updates to registered handlers.

pub mod client;
pub mod config;
pub mod handlers;
pub mod reconciler;
pub mod transport;

pub use client::{LifecycleEvent, StreamClient};
pub use config::{StreamConfig, DEFAULT_STREAM_URL, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_BASE};
pub use handlers::{HandlerId, HandlerRegistry, PriceHandler};
pub use reconciler::{ReconcileOutcome, SubscriptionSet};
pub use transport::{
    Connector, LoopbackConnector, LoopbackPeer, OutboundFrame, TransportChannels, TransportEvent,
    WsConnector, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
