//! Core data types used across the trading engine

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
///
/// `open_time` marks the start of the candle interval, aligned to the
/// timeframe boundary. A candle is only admitted into buffers once the
/// venue reports it closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        open_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Construct from venue epoch-millis without validation (trusted source)
    pub fn from_millis(
        ts_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            open_time: Utc.timestamp_millis_opt(ts_ms).single().unwrap_or_default(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }
        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }
        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }
        Ok(())
    }

    /// Check the open time sits on a timeframe boundary
    pub fn is_aligned(&self, timeframe: Timeframe) -> bool {
        self.open_time.timestamp_millis() % timeframe.duration_ms() == 0
    }
}

/// Candle timeframes tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M1,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H6,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H6 => "6h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M15 => 900_000,
            Timeframe::H1 => 3_600_000,
            Timeframe::H6 => 21_600_000,
            Timeframe::D1 => 86_400_000,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms())
    }

    /// Historical window fetched at startup
    pub fn preload_horizon(&self) -> usize {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M15 => 100,
            Timeframe::H1 => 72,
            Timeframe::H6 => 100,
            Timeframe::D1 => 60,
        }
    }

    /// Rolling buffer cap; always at least the preload horizon
    pub fn default_retention(&self) -> usize {
        self.preload_horizon().max(100)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "6h" => Ok(Timeframe::H6),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {}", other)),
        }
    }
}

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned on every buffer key, ledger entry and order request.
/// Using Arc<str> instead of String reduces heap allocations from O(n) to
/// O(1) per clone. The constructor normalizes to the canonical uppercase
/// form so all internal keys agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.to_uppercase().as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref().to_uppercase().as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset of a `BASE-QUOTE` pair (e.g. "HBAR" for "HBAR-USDT")
    pub fn base_asset(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// Quote asset of a `BASE-QUOTE` pair (e.g. "USDT" for "HBAR-USDT")
    pub fn quote_asset(&self) -> &str {
        self.0.rsplit('-').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single ticker update from the venue stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerTick {
    pub event_time: DateTime<Utc>,
    pub last_price: f64,
    pub best_bid: f64,
    pub best_bid_qty: f64,
    pub best_ask: f64,
    pub best_ask_qty: f64,
    pub volume_24h: f64,
}

/// Order book snapshot: bids descending, asks ascending, top-of-book first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub event_time: DateTime<Utc>,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.first().copied()
    }
}

/// Venue precision rules for a trading pair
///
/// All order prices and quantities pass through here before leaving the
/// engine. Quantization runs on `Decimal` so repeated float arithmetic
/// cannot drift a grid level off its exchange tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Smallest price increment accepted by the venue
    pub price_tick: f64,
    /// Smallest quantity increment accepted by the venue
    pub lot_size: f64,
    /// Minimum order value (price * quantity) accepted by the venue
    pub min_notional: f64,
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        InstrumentSpec {
            price_tick: 0.0001,
            lot_size: 0.0001,
            min_notional: 10.0,
        }
    }
}

impl InstrumentSpec {
    /// Number of whole ticks closest to `price`; ledger levels key on this
    pub fn price_ticks(&self, price: f64) -> i64 {
        let p = Decimal::from_f64_retain(price).unwrap_or_default();
        let t = Decimal::from_f64_retain(self.price_tick).unwrap_or(Decimal::ONE);
        if t.is_zero() {
            return 0;
        }
        (p / t).round().to_i64().unwrap_or(0)
    }

    /// Snap a price onto the venue tick grid
    pub fn quantize_price(&self, price: f64) -> f64 {
        let t = Decimal::from_f64_retain(self.price_tick).unwrap_or(Decimal::ONE);
        (Decimal::from(self.price_ticks(price)) * t)
            .to_f64()
            .unwrap_or(price)
    }

    /// Round a quantity down to the venue lot size
    pub fn quantize_qty(&self, qty: f64) -> f64 {
        let q = Decimal::from_f64_retain(qty).unwrap_or_default();
        let lot = Decimal::from_f64_retain(self.lot_size).unwrap_or(Decimal::ONE);
        if lot.is_zero() {
            return qty.max(0.0);
        }
        let lots = (q / lot).floor();
        (lots * lot).to_f64().unwrap_or(0.0).max(0.0)
    }

    /// Two prices are equal up to exchange tick precision
    pub fn same_level(&self, a: f64, b: f64) -> bool {
        self.price_ticks(a) == self.price_ticks(b)
    }

    /// Order value check against the venue minimum
    pub fn meets_min_notional(&self, price: f64, qty: f64) -> bool {
        price * qty >= self.min_notional
    }
}
