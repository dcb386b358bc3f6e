//! Websocket market data streams
//!
//! Each subscription spawns a task that owns its connection, re-subscribes
//! after every reconnect with bounded backoff, and forwards parsed items
//! over an mpsc channel. Dropping the receiver ends the task. Consumers
//! never share mutable state with the socket; everything flows through the
//! channel into the market data buffers.

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{Candle, DepthSnapshot, Symbol, TickerTick, Timeframe};

/// Reconnect backoff: start small, cap at a minute
const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Channel depth; enough to absorb a burst while the coordinator runs
const CHANNEL_CAPACITY: usize = 1024;

pub fn subscribe_ticker(ws_url: &str, symbol: &Symbol) -> mpsc::Receiver<TickerTick> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    spawn_subscription(ws_url.to_string(), symbol.clone(), "ticker".to_string(), None, tx);
    rx
}

pub fn subscribe_depth(ws_url: &str, symbol: &Symbol) -> mpsc::Receiver<DepthSnapshot> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    spawn_subscription(ws_url.to_string(), symbol.clone(), "depth".to_string(), None, tx);
    rx
}

pub fn subscribe_candles(
    ws_url: &str,
    symbol: &Symbol,
    timeframe: Timeframe,
) -> mpsc::Receiver<Candle> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    spawn_subscription(
        ws_url.to_string(),
        symbol.clone(),
        "candles".to_string(),
        Some(timeframe),
        tx,
    );
    rx
}

/// An item that can be parsed out of a stream message for its channel
trait StreamItem: Sized + Send + 'static {
    fn parse(message: &StreamMessage) -> Option<Self>;
}

fn spawn_subscription<T: StreamItem>(
    ws_url: String,
    symbol: Symbol,
    channel: String,
    timeframe: Option<Timeframe>,
    tx: mpsc::Sender<T>,
) {
    tokio::spawn(async move {
        let mut backoff = RECONNECT_BASE;

        loop {
            match run_connection(&ws_url, &symbol, &channel, timeframe, &tx).await {
                ConnectionEnd::ReceiverDropped => {
                    debug!(symbol = %symbol, channel, "Stream consumer gone; ending task");
                    return;
                }
                ConnectionEnd::Disconnected(reason) => {
                    warn!(
                        symbol = %symbol,
                        channel,
                        reason,
                        backoff_s = backoff.as_secs(),
                        "Stream disconnected; reconnecting"
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                }
                ConnectionEnd::Established => {
                    // Healthy session ended; reset backoff and reconnect
                    backoff = RECONNECT_BASE;
                    sleep(backoff).await;
                }
            }
        }
    });
}

enum ConnectionEnd {
    ReceiverDropped,
    Disconnected(String),
    Established,
}

async fn run_connection<T: StreamItem>(
    ws_url: &str,
    symbol: &Symbol,
    channel: &str,
    timeframe: Option<Timeframe>,
    tx: &mpsc::Sender<T>,
) -> ConnectionEnd {
    let (ws_stream, _) = match connect_async(ws_url).await {
        Ok(ok) => ok,
        Err(e) => return ConnectionEnd::Disconnected(e.to_string()),
    };
    let (mut sink, mut reader) = ws_stream.split();

    let mut subscribe = serde_json::json!({
        "op": "subscribe",
        "channel": channel,
        "symbol": symbol.as_str(),
    });
    if let Some(tf) = timeframe {
        subscribe["interval"] = serde_json::json!(tf.as_str());
    }

    if let Err(e) = sink.send(Message::Text(subscribe.to_string())).await {
        return ConnectionEnd::Disconnected(e.to_string());
    }
    info!(symbol = %symbol, channel, "Stream subscribed");

    let mut received_any = false;
    while let Some(message) = reader.next().await {
        let message = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(payload)) => {
                if sink.send(Message::Pong(payload)).await.is_err() {
                    return ConnectionEnd::Disconnected("pong failed".to_string());
                }
                continue;
            }
            Ok(Message::Close(frame)) => {
                return ConnectionEnd::Disconnected(format!("server close: {:?}", frame));
            }
            Ok(_) => continue,
            Err(e) => return ConnectionEnd::Disconnected(e.to_string()),
        };

        let parsed: StreamMessage = match serde_json::from_str(&message) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable stream message");
                continue;
            }
        };

        if parsed.channel.as_deref() != Some(channel) {
            continue;
        }
        if let Some(item) = T::parse(&parsed) {
            received_any = true;
            if tx.send(item).await.is_err() {
                return ConnectionEnd::ReceiverDropped;
            }
        }
    }

    if received_any {
        ConnectionEnd::Established
    } else {
        ConnectionEnd::Disconnected("stream ended before any data".to_string())
    }
}

// ----------------------------------------------------------------------
// Wire format
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamMessage {
    channel: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireTicker {
    ts: i64,
    last_price: f64,
    best_bid: f64,
    #[serde(default)]
    best_bid_qty: f64,
    best_ask: f64,
    #[serde(default)]
    best_ask_qty: f64,
    #[serde(default)]
    volume_24h: f64,
}

impl StreamItem for TickerTick {
    fn parse(message: &StreamMessage) -> Option<Self> {
        let wire: WireTicker = serde_json::from_value(message.data.clone()).ok()?;
        Some(TickerTick {
            event_time: Utc.timestamp_millis_opt(wire.ts).single()?,
            last_price: wire.last_price,
            best_bid: wire.best_bid,
            best_bid_qty: wire.best_bid_qty,
            best_ask: wire.best_ask,
            best_ask_qty: wire.best_ask_qty,
            volume_24h: wire.volume_24h,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireDepth {
    ts: i64,
    bids: Vec<(f64, f64)>,
    asks: Vec<(f64, f64)>,
}

impl StreamItem for DepthSnapshot {
    fn parse(message: &StreamMessage) -> Option<Self> {
        let wire: WireDepth = serde_json::from_value(message.data.clone()).ok()?;
        let mut bids = wire.bids;
        let mut asks = wire.asks;
        bids.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Some(DepthSnapshot {
            event_time: Utc.timestamp_millis_opt(wire.ts).single()?,
            bids,
            asks,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireCandleEvent {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    /// Venue marks the candle closed once a later interval opens
    #[serde(default)]
    closed: bool,
}

impl StreamItem for Candle {
    fn parse(message: &StreamMessage) -> Option<Self> {
        let wire: WireCandleEvent = serde_json::from_value(message.data.clone()).ok()?;
        if !wire.closed {
            return None;
        }
        Some(Candle::from_millis(
            wire.t, wire.o, wire.h, wire.l, wire.c, wire.v,
        ))
    }
}
