//! WebSocket message types for the price stream
//!
//! These types define the protocol spoken with the securities stream
//! server. Outbound messages are serialized directly; inbound frames go
//! through [`decode_frame`], the only place raw JSON is interpreted.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FeedError, FeedResult};

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start streaming prices for these tickers
    Subscribe { securities: Vec<String> },
    /// Stop streaming prices for these tickers
    Unsubscribe { securities: Vec<String> },
}

impl ClientMessage {
    pub fn subscribe<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientMessage::Subscribe {
            securities: tickers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn unsubscribe<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientMessage::Unsubscribe {
            securities: tickers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tickers(&self) -> &[String] {
        match self {
            Self::Subscribe { securities } => securities,
            Self::Unsubscribe { securities } => securities,
        }
    }

    pub fn to_json(&self) -> FeedResult<String> {
        serde_json::to_string(self).map_err(|e| FeedError::protocol(e.to_string()))
    }
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

/// A validated price update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceUpdate {
    pub ticker: String,
    pub price: Decimal,
}

impl PriceUpdate {
    pub fn new(ticker: impl Into<String>, price: Decimal) -> Self {
        Self {
            ticker: ticker.into(),
            price,
        }
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// `{"ticker": ..., "price": ...}`
    Price(PriceUpdate),
    /// Server bookkeeping (`connection_established`, `heartbeat`, `echo`, `error`)
    Control { kind: String, message: Option<String> },
}

/// Decode one inbound text frame.
///
/// Anything that is neither a price update nor a typed control frame is a
/// [`FeedError::Protocol`].
pub fn decode_frame(text: &str) -> FeedResult<ServerFrame> {
    let json: Value = serde_json::from_str(text)
        .map_err(|e| FeedError::protocol(format!("invalid JSON: {}", e)))?;

    let Value::Object(fields) = json else {
        return Err(FeedError::protocol("frame is not a JSON object"));
    };

    if let Some(ticker) = fields.get("ticker") {
        let ticker = ticker
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FeedError::protocol("ticker must be a non-empty string"))?;
        let price = fields
            .get("price")
            .ok_or_else(|| FeedError::protocol(format!("missing price for {}", ticker)))?;
        let price = parse_price(price)?;
        return Ok(ServerFrame::Price(PriceUpdate::new(ticker, price)));
    }

    if let Some(kind) = fields.get("type").and_then(Value::as_str) {
        let message = fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(ServerFrame::Control {
            kind: kind.to_string(),
            message,
        });
    }

    Err(FeedError::protocol("frame has neither ticker nor type"))
}

/// Normalize a JSON price (number or numeric string) to a decimal
pub fn parse_price(value: &Value) -> FeedResult<Decimal> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => {
            return Err(FeedError::protocol(format!(
                "price must be a number or numeric string, got {}",
                other
            )))
        }
    };

    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| FeedError::protocol(format!("unparsable price: {:?}", raw)))
}

// ============================================================================
// Connection state
// ============================================================================

/// Lifecycle state of the stream connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport; initial state and the state after giving up
    #[default]
    Disconnected,
    /// Transport open in flight
    Connecting,
    /// Transport open and frames flowing
    Connected,
    /// Lost abnormally, waiting for the backoff timer
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subscribe_wire_shape() {
        let json = ClientMessage::subscribe(["AAPL", "MSFT"]).to_json().unwrap();
        assert_eq!(json, r#"{"action":"subscribe","securities":["AAPL","MSFT"]}"#);

        let json = ClientMessage::unsubscribe(["TSLA"]).to_json().unwrap();
        assert_eq!(json, r#"{"action":"unsubscribe","securities":["TSLA"]}"#);
    }

    #[test]
    fn test_decode_numeric_and_string_prices() {
        assert_eq!(
            decode_frame(r#"{"ticker": "AAPL", "price": 151.25}"#).unwrap(),
            ServerFrame::Price(PriceUpdate::new("AAPL", dec!(151.25)))
        );
        assert_eq!(
            decode_frame(r#"{"ticker": "AAPL", "price": "150.00"}"#).unwrap(),
            ServerFrame::Price(PriceUpdate::new("AAPL", dec!(150.00)))
        );
        assert_eq!(
            decode_frame(r#"{"ticker": "ZZZZ", "price": 10}"#).unwrap(),
            ServerFrame::Price(PriceUpdate::new("ZZZZ", dec!(10)))
        );
    }

    #[test]
    fn test_connection_state_defaults_to_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(!ConnectionState::default().is_connected());
    }

    #[test]
    fn test_decode_control_frames() {
        let frame = decode_frame(r#"{"type": "heartbeat", "timestamp": "2024-01-01T00:00:00"}"#)
            .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Control {
                kind: "heartbeat".to_string(),
                message: None
            }
        );

        let frame =
            decode_frame(r#"{"type": "error", "message": "Error processing message"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Control { ref kind, message: Some(_) } if kind == "error"));
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        let cases = [
            "not json",
            "[1, 2, 3]",
            r#"{"ticker": "AAPL"}"#,
            r#"{"ticker": "", "price": 1}"#,
            r#"{"ticker": 42, "price": 1}"#,
            r#"{"ticker": "AAPL", "price": null}"#,
            r#"{"ticker": "AAPL", "price": "abc"}"#,
            r#"{"price": 10}"#,
        ];
        for case in cases {
            assert!(
                matches!(decode_frame(case), Err(FeedError::Protocol(_))),
                "expected protocol error for {}",
                case
            );
        }
    }
}
