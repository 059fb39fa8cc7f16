//! Transport seam for the price stream
//!
//! A [`Connector`] opens one transport and hands back a pair of channels:
//! outbound frames to write and inbound events read from the far end. The
//! connection actor never touches sockets directly, so the websocket
//! implementation and the in-process loopback are interchangeable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use pricefeed_core::{ClientMessage, FeedError, FeedResult};

/// Close code for an orderly shutdown; anything else is abnormal
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the transport vanished without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Frame written to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Event read from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Error(String),
    /// Always the last event of a transport
    Closed { code: u16 },
}

/// Channel pair of one open transport
#[derive(Debug)]
pub struct TransportChannels {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports to the stream server
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Resolves once the transport is open and ready for frames
    async fn open(&self, url: &Url) -> FeedResult<TransportChannels>;
}

// ============================================================================
// WebSocket transport
// ============================================================================

/// `tokio-tungstenite` backed connector
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> FeedResult<TransportChannels> {
        info!("[Stream WS] Connecting to {}", redact(url));

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| FeedError::connection(e.to_string()))?;

        info!("[Stream WS] Connected successfully");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws_stream, outbound_rx, inbound_tx));

        Ok(TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Moves frames between the socket and the channel pair until either side closes
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    let code = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(TransportEvent::Frame(text.as_str().to_owned())).is_err() {
                            // Nobody listens any more
                            let _ = write.close().await;
                            break NORMAL_CLOSURE;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("[Stream WS] Failed to send pong: {}", e);
                            let _ = inbound.send(TransportEvent::Error(e.to_string()));
                            break ABNORMAL_CLOSURE;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(ABNORMAL_CLOSURE);
                        info!("[Stream WS] Connection closed by server ({})", code);
                        break code;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("[Stream WS] Error: {}", e);
                        let _ = inbound.send(TransportEvent::Error(e.to_string()));
                        break ABNORMAL_CLOSURE;
                    }
                    None => {
                        info!("[Stream WS] Stream ended");
                        break ABNORMAL_CLOSURE;
                    }
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(OutboundFrame::Text(json)) => {
                        debug!("[Stream WS] Sending {}", json);
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            warn!("[Stream WS] Failed to send frame: {}", e);
                            let _ = inbound.send(TransportEvent::Error(e.to_string()));
                            break ABNORMAL_CLOSURE;
                        }
                    }
                    Some(OutboundFrame::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!("[Stream WS] Close frame not delivered: {}", e);
                        }
                        break code;
                    }
                    None => {
                        let _ = write.close().await;
                        break NORMAL_CLOSURE;
                    }
                }
            }
        }
    };

    let _ = inbound.send(TransportEvent::Closed { code });
}

/// Endpoint without the identity token, for logs
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

// ============================================================================
// In-process transport
// ============================================================================

/// Far end of a loopback transport, held by whoever plays the server
#[derive(Debug)]
pub struct LoopbackPeer {
    pub url: Url,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopbackPeer {
    /// Deliver a raw text frame to the client
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(TransportEvent::Frame(text.into()));
    }

    /// Deliver a `{"ticker", "price"}` frame
    pub fn send_price(&self, ticker: &str, price: serde_json::Value) {
        self.send_text(serde_json::json!({ "ticker": ticker, "price": price }).to_string());
    }

    /// Close the transport from the server side
    pub fn close(&self, code: u16) {
        let _ = self.inbound.send(TransportEvent::Closed { code });
    }

    /// Next frame the client wrote, if any is buffered
    pub fn try_next_frame(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }

    /// All buffered client messages, decoded; close frames are skipped
    pub fn drain_messages(&mut self) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        while let Some(frame) = self.try_next_frame() {
            if let OutboundFrame::Text(json) = frame {
                match serde_json::from_str(&json) {
                    Ok(message) => messages.push(message),
                    Err(e) => warn!("[Loopback] Undecodable client frame {}: {}", json, e),
                }
            }
        }
        messages
    }
}

/// Connector whose transports are channel pairs handed to a [`LoopbackPeer`]
#[derive(Debug)]
pub struct LoopbackConnector {
    refusing: AtomicBool,
    opens: AtomicUsize,
    peers: mpsc::UnboundedSender<LoopbackPeer>,
}

impl LoopbackConnector {
    /// Connector plus the receiver of one peer per successful open
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LoopbackPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            refusing: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            peers,
        });
        (connector, peer_rx)
    }

    /// While refusing, every open fails with a connection error
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of opens attempted so far, refused ones included
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, url: &Url) -> FeedResult<TransportChannels> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if self.refusing.load(Ordering::SeqCst) {
            return Err(FeedError::connection("loopback refused connection"));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = LoopbackPeer {
            url: url.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| FeedError::connection("loopback peer receiver dropped"))?;

        Ok(TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let (connector, mut peers) = LoopbackConnector::new();
        let url = Url::parse("ws://localhost:8001/ws/securities/?token=1").unwrap();

        let mut channels = connector.open(&url).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.url, url);

        let subscribe = ClientMessage::subscribe(["AAPL"]).to_json().unwrap();
        channels.outbound.send(OutboundFrame::Text(subscribe)).unwrap();
        assert_eq!(peer.drain_messages(), vec![ClientMessage::subscribe(["AAPL"])]);

        peer.send_price("AAPL", serde_json::json!(150.5));
        peer.close(NORMAL_CLOSURE);
        assert!(matches!(channels.inbound.recv().await, Some(TransportEvent::Frame(_))));
        assert_eq!(
            channels.inbound.recv().await,
            Some(TransportEvent::Closed { code: NORMAL_CLOSURE })
        );
    }

    #[tokio::test]
    async fn test_refusing_counts_opens() {
        let (connector, _peers) = LoopbackConnector::new();
        let url = Url::parse("ws://localhost:8001/").unwrap();

        connector.set_refusing(true);
        assert!(matches!(connector.open(&url).await, Err(FeedError::Connection(_))));
        connector.set_refusing(false);
        assert!(connector.open(&url).await.is_ok());
        assert_eq!(connector.open_count(), 2);
    }

    #[test]
    fn test_redact_hides_token() {
        let url = Url::parse("ws://localhost:8001/ws/securities/?token=secret").unwrap();
        assert_eq!(redact(&url), "ws://localhost:8001/ws/securities/");
    }
}
