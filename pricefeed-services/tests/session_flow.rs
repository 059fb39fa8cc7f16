//! End-to-end session flow against the in-process loopback transport
//!
//! Run with: cargo test -p pricefeed-services --test session_flow -- --nocapture

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};

use pricefeed_core::{ClientMessage, ConnectionState, Direction, Security, SecurityId, Watchlist};
use pricefeed_services::{FlashEvent, Portfolio, Session, SessionConfig};
use pricefeed_stream::{LoopbackConnector, LoopbackPeer, ABNORMAL_CLOSURE};

const AAPL: SecurityId = SecurityId(1);
const MSFT: SecurityId = SecurityId(2);

fn portfolio() -> Portfolio {
    let mut tech = Watchlist::new(10, "Tech");
    tech.securities = vec![AAPL, MSFT];
    Portfolio {
        securities: vec![
            Security::new(1, "AAPL", "Apple Inc.").with_price(dec!(150.00)),
            Security::new(2, "MSFT", "Microsoft").with_price(dec!(410.00)),
        ],
        watchlists: vec![tech],
    }
}

async fn logged_in() -> (
    Session,
    Arc<LoopbackConnector>,
    mpsc::UnboundedReceiver<LoopbackPeer>,
    LoopbackPeer,
) {
    let (connector, mut peers) = LoopbackConnector::new();
    let session = Session::new(SessionConfig::default(), connector.clone());
    session.load_portfolio(portfolio());
    session.login("user-1").await.unwrap();
    let peer = peers.recv().await.unwrap();
    (session, connector, peers, peer)
}

async fn next_started(events: &mut broadcast::Receiver<FlashEvent>) -> (SecurityId, Direction) {
    loop {
        if let FlashEvent::Started { id, direction } = events.recv().await.unwrap() {
            return (id, direction);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_queued_subscriptions_flush_in_one_frame() {
    let (connector, mut peers) = LoopbackConnector::new();
    let session = Session::new(SessionConfig::default(), connector);
    session.load_portfolio(portfolio());

    let outcome = session.sync_subscriptions().await.unwrap();
    assert_eq!(outcome.queued, vec!["AAPL", "MSFT"]);
    assert!(outcome.is_noop());

    session.login("user-1").await.unwrap();
    let mut peer = peers.recv().await.unwrap();

    assert_eq!(
        peer.drain_messages(),
        vec![ClientMessage::subscribe(["AAPL", "MSFT"])]
    );
    assert!(session.client().pending_tickers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ticker_dropped_while_offline_is_pruned_after_flush() {
    let (connector, mut peers) = LoopbackConnector::new();
    let session = Session::new(SessionConfig::default(), connector);
    session.load_portfolio(portfolio());

    session.sync_subscriptions().await.unwrap();
    let removed = session
        .update_watchlists(|book| book.remove_security(10, AAPL))
        .await
        .unwrap();
    assert!(removed);
    assert_eq!(
        session.client().pending_tickers().into_iter().collect::<Vec<_>>(),
        vec!["AAPL", "MSFT"]
    );

    session.login("user-1").await.unwrap();
    let mut peer = peers.recv().await.unwrap();
    session.sync_subscriptions().await.unwrap();

    assert_eq!(
        peer.drain_messages(),
        vec![
            ClientMessage::subscribe(["AAPL", "MSFT"]),
            ClientMessage::unsubscribe(["AAPL"]),
        ]
    );
    assert_eq!(
        session.client().subscribed_tickers().into_iter().collect::<Vec<_>>(),
        vec!["MSFT"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_price_up_flashes_for_600ms() {
    let (session, _connector, _peers, peer) = logged_in().await;
    let mut events = session.flash_events();

    peer.send_price("AAPL", serde_json::json!("151.25"));
    assert_eq!(next_started(&mut events).await, (AAPL, Direction::Up));
    assert_eq!(session.price(AAPL), Some(dec!(151.25)));
    assert_eq!(session.flash_class(AAPL), Some("price-up"));

    sleep(Duration::from_millis(599)).await;
    assert_eq!(session.flash_direction(AAPL), Some(Direction::Up));

    sleep(Duration::from_millis(1)).await;
    assert_eq!(session.flash_direction(AAPL), None);
    assert_eq!(session.price(AAPL), Some(dec!(151.25)));
}

#[tokio::test(start_paused = true)]
async fn test_second_change_restarts_flash() {
    let (session, _connector, _peers, peer) = logged_in().await;
    let mut events = session.flash_events();

    peer.send_price("AAPL", serde_json::json!(151));
    assert_eq!(next_started(&mut events).await, (AAPL, Direction::Up));

    sleep(Duration::from_millis(200)).await;
    peer.send_price("AAPL", serde_json::json!(149));
    assert_eq!(next_started(&mut events).await, (AAPL, Direction::Down));

    sleep(Duration::from_millis(599)).await;
    assert_eq!(session.flash_direction(AAPL), Some(Direction::Down));

    sleep(Duration::from_millis(1)).await;
    assert_eq!(session.flash_direction(AAPL), None);
    assert_eq!(session.price(AAPL), Some(dec!(149)));
}

#[tokio::test(start_paused = true)]
async fn test_equal_price_and_untracked_ticker_do_not_flash() {
    let (session, _connector, _peers, peer) = logged_in().await;
    let mut events = session.flash_events();

    peer.send_price("ZZZZ", serde_json::json!(10));
    peer.send_price("MSFT", serde_json::json!(410));
    peer.send_text(r#"{"ticker":"MSFT","price":"n/a"}"#);
    peer.send_price("MSFT", serde_json::json!(411));

    // Frames are handled in order, so the first flash is the last frame's
    assert_eq!(next_started(&mut events).await, (MSFT, Direction::Up));
    assert!(session.entry_by_ticker("ZZZZ").is_none());
    assert_eq!(session.flash_direction(AAPL), None);
    assert!(session.entry(MSFT).unwrap().last_updated.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_reconnects_and_resubscribes() {
    let (session, connector, mut peers, mut peer) = logged_in().await;
    peer.drain_messages();

    let lost_at = Instant::now();
    peer.close(ABNORMAL_CLOSURE);

    let mut reconnected = peers.recv().await.unwrap();
    let waited = lost_at.elapsed();
    assert!(waited >= Duration::from_millis(3000), "reconnected after {:?}", waited);
    assert!(waited < Duration::from_millis(3100), "reconnected after {:?}", waited);
    assert_eq!(connector.open_count(), 2);

    let mut state = session.client().watch_state();
    state.wait_for(|s| s.is_connected()).await.unwrap();
    session.sync_subscriptions().await.unwrap();

    assert_eq!(
        reconnected.drain_messages(),
        vec![ClientMessage::subscribe(["AAPL", "MSFT"])]
    );
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    // Stream still feeds the price book after the reconnect
    let mut events = session.flash_events();
    reconnected.send_price("MSFT", serde_json::json!(400));
    assert_eq!(next_started(&mut events).await, (MSFT, Direction::Down));
}

#[tokio::test(start_paused = true)]
async fn test_logout_leaves_nothing_behind() {
    let (session, connector, mut peers, peer) = logged_in().await;
    let mut events = session.flash_events();

    peer.send_price("AAPL", serde_json::json!(152));
    next_started(&mut events).await;

    session.logout().await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.client().subscribed_tickers().is_empty());
    assert!(session.client().pending_tickers().is_empty());
    assert!(session.flashes().active().is_empty());

    // No reconnect is ever scheduled after a logout
    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.open_count(), 1);
    assert!(peers.try_recv().is_err());
}
