//! Rolling market data buffers
//!
//! Per-symbol stores for candles (one per timeframe), ticker ticks and the
//! order book snapshot. Writers are the stream and refresh tasks; readers
//! take snapshot copies so indicator math never observes a torn buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::config::RetentionConfig;
use crate::{Candle, DepthSnapshot, Symbol, TickerTick, Timeframe};

#[derive(Debug, Default)]
struct SymbolBuffers {
    candles: HashMap<Timeframe, VecDeque<Candle>>,
    ticker: VecDeque<TickerTick>,
    depth: Option<DepthSnapshot>,
    last_logged_price: Option<f64>,
}

/// Thread-safe rolling buffers for all managed symbols
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct MarketBuffers {
    inner: Arc<RwLock<HashMap<Symbol, SymbolBuffers>>>,
    retention: Arc<RetentionConfig>,
}

impl MarketBuffers {
    pub fn new(retention: RetentionConfig) -> Self {
        MarketBuffers {
            inner: Arc::new(RwLock::new(HashMap::new())),
            retention: Arc::new(retention),
        }
    }

    /// Replace a candle buffer with a freshly fetched historical window
    ///
    /// Input is sorted, de-duplicated by open time and truncated to the
    /// retention cap. Misaligned rows are dropped.
    pub fn preload_candles(&self, symbol: &Symbol, timeframe: Timeframe, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        candles.retain(|c| c.is_aligned(timeframe));

        let cap = self.retention.candle_cap(timeframe);
        let skip = candles.len().saturating_sub(cap);
        let window: VecDeque<Candle> = candles.into_iter().skip(skip).collect();

        info!(
            symbol = %symbol,
            timeframe = %timeframe,
            rows = window.len(),
            "Preloaded candle buffer"
        );

        let mut inner = self.inner.write().expect("buffer lock poisoned");
        inner
            .entry(symbol.clone())
            .or_default()
            .candles
            .insert(timeframe, window);
    }

    /// Append one closed candle from a stream or refresh task
    ///
    /// Idempotent: duplicates and stale rows (open time not strictly after
    /// the buffer head) are dropped, as are misaligned rows. Returns true
    /// when the candle was admitted.
    pub fn append_candle(&self, symbol: &Symbol, timeframe: Timeframe, candle: Candle) -> bool {
        if !candle.is_aligned(timeframe) {
            debug!(symbol = %symbol, timeframe = %timeframe, time = %candle.open_time, "Dropping misaligned candle");
            return false;
        }

        let mut inner = self.inner.write().expect("buffer lock poisoned");
        let buffer = inner
            .entry(symbol.clone())
            .or_default()
            .candles
            .entry(timeframe)
            .or_default();

        if let Some(last) = buffer.back() {
            if candle.open_time <= last.open_time {
                return false;
            }
        }

        buffer.push_back(candle);
        let cap = self.retention.candle_cap(timeframe);
        while buffer.len() > cap {
            buffer.pop_front();
        }
        true
    }

    /// Append a ticker tick; event times must be monotone non-decreasing
    pub fn append_ticker(&self, symbol: &Symbol, tick: TickerTick) -> bool {
        let mut inner = self.inner.write().expect("buffer lock poisoned");
        let buffers = inner.entry(symbol.clone()).or_default();

        if let Some(last) = buffers.ticker.back() {
            if tick.event_time < last.event_time {
                return false;
            }
        }

        // Log at info only on a >1% move to keep the stream quiet
        let price = tick.last_price;
        match buffers.last_logged_price {
            Some(prev) if prev > 0.0 && (price - prev).abs() / prev > 0.01 => {
                info!(symbol = %symbol, price, "Ticker price moved >1%");
                buffers.last_logged_price = Some(price);
            }
            None => {
                info!(symbol = %symbol, price, "First ticker received");
                buffers.last_logged_price = Some(price);
            }
            _ => debug!(symbol = %symbol, price, "Ticker update"),
        }

        buffers.ticker.push_back(tick);
        while buffers.ticker.len() > self.retention.ticker {
            buffers.ticker.pop_front();
        }
        true
    }

    /// Install the latest depth snapshot, truncated to the retained levels
    pub fn set_depth(&self, symbol: &Symbol, mut depth: DepthSnapshot) -> bool {
        let mut inner = self.inner.write().expect("buffer lock poisoned");
        let buffers = inner.entry(symbol.clone()).or_default();

        if let Some(current) = &buffers.depth {
            if depth.event_time < current.event_time {
                return false;
            }
        }

        depth.bids.truncate(self.retention.depth_levels);
        depth.asks.truncate(self.retention.depth_levels);
        buffers.depth = Some(depth);
        true
    }

    /// Drop every buffer for a symbol (used on stream gap resume)
    pub fn clear_symbol(&self, symbol: &Symbol) {
        let mut inner = self.inner.write().expect("buffer lock poisoned");
        inner.remove(symbol);
    }

    /// Owned copy of a candle buffer
    pub fn candles_snapshot(&self, symbol: &Symbol, timeframe: Timeframe) -> Vec<Candle> {
        let inner = self.inner.read().expect("buffer lock poisoned");
        inner
            .get(symbol)
            .and_then(|b| b.candles.get(&timeframe))
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Owned copy of the ticker buffer
    pub fn ticker_snapshot(&self, symbol: &Symbol) -> Vec<TickerTick> {
        let inner = self.inner.read().expect("buffer lock poisoned");
        inner
            .get(symbol)
            .map(|b| b.ticker.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest depth snapshot, if any
    pub fn depth_snapshot(&self, symbol: &Symbol) -> Option<DepthSnapshot> {
        let inner = self.inner.read().expect("buffer lock poisoned");
        inner.get(symbol).and_then(|b| b.depth.clone())
    }

    /// Latest open time in a candle buffer
    pub fn latest_candle_time(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<chrono::DateTime<chrono::Utc>> {
        let inner = self.inner.read().expect("buffer lock poisoned");
        inner
            .get(symbol)
            .and_then(|b| b.candles.get(&timeframe))
            .and_then(|d| d.back())
            .map(|c| c.open_time)
    }

    /// Current price: latest ticker price, falling back to the latest
    /// 1m close when the ticker buffer is empty
    pub fn last_price(&self, symbol: &Symbol) -> Option<f64> {
        let inner = self.inner.read().expect("buffer lock poisoned");
        let buffers = inner.get(symbol)?;
        if let Some(tick) = buffers.ticker.back() {
            if tick.last_price > 0.0 {
                return Some(tick.last_price);
            }
        }
        buffers
            .candles
            .get(&Timeframe::M1)
            .and_then(|d| d.back())
            .map(|c| c.close)
    }
}
