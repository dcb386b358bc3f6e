//! Technical indicators
//!
//! Pure indicator math over candle and ticker buffers. Column functions
//! return `Vec<Option<f64>>` aligned with their input so callers can pick
//! the latest defined value; `IndicatorSet` and `Microstructure` bundle the
//! values the regime classifier and grid coordinator consume.

use crate::{Candle, DepthSnapshot, TickerTick};

/// Fixed periods of the candle-derived indicator set
const EMA_FAST: usize = 12;
const EMA_SLOW: usize = 26;
const WILDER_PERIOD: usize = 14;
const MACD_SIGNAL: usize = 9;

/// Depth levels per side considered for order book imbalance
const IMBALANCE_DEPTH: usize = 10;

/// Volume rows preceding the latest tick used for the surge baseline
const VOLUME_BASELINE: usize = 20;

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Calculate Exponential Moving Average
///
/// k = 2/(n+1), seeded with the SMA of the first n values.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return result;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_value: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = values[0..period].iter().sum();
            ema_value = Some(sum / period as f64);
            result.push(ema_value);
        } else if let Some(prev_ema) = ema_value {
            let new_ema = (value - prev_ema) * multiplier + prev_ema;
            ema_value = Some(new_ema);
            result.push(Some(new_ema));
        }
    }

    result
}

/// Wilder's smoothing: seeded with the SMA of the first n values, then
/// smoothed = (prev * (n - 1) + value) / n
pub fn wilder(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return result;
    }

    let mut smoothed: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = values[0..period].iter().sum();
            smoothed = Some(sum / period as f64);
            result.push(smoothed);
        } else if let Some(prev) = smoothed {
            let next = (prev * (period as f64 - 1.0) + value) / period as f64;
            smoothed = Some(next);
            result.push(Some(next));
        }
    }

    result
}

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (Wilder smoothing of true range)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    wilder(&tr, period)
}

/// Calculate RSI (Relative Strength Index) with Wilder smoothing
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut gains = Vec::with_capacity(values.len());
    let mut losses = Vec::with_capacity(values.len());

    gains.push(0.0);
    losses.push(0.0);

    for i in 1..values.len() {
        let change = values[i] - values[i - 1];
        gains.push(if change > 0.0 { change } else { 0.0 });
        losses.push(if change < 0.0 { -change } else { 0.0 });
    }

    let avg_gains = wilder(&gains, period);
    let avg_losses = wilder(&losses, period);

    let mut rsi_values = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if let (Some(avg_gain), Some(avg_loss)) = (avg_gains[i], avg_losses[i]) {
            if avg_loss == 0.0 {
                rsi_values.push(Some(100.0));
            } else {
                let rs = avg_gain / avg_loss;
                rsi_values.push(Some(100.0 - (100.0 / (1.0 + rs))));
            }
        } else {
            rsi_values.push(None);
        }
    }

    rsi_values
}

/// Calculate the directional indicators +DI and -DI
pub fn dmi(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let n = high.len();
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];

    for i in 1..n {
        let up_move = high[i] - high[i - 1];
        let down_move = low[i - 1] - low[i];

        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let tr = true_range(high, low, close);
    let smoothed_tr = wilder(&tr, period);
    let smoothed_plus = wilder(&plus_dm, period);
    let smoothed_minus = wilder(&minus_dm, period);

    let mut plus_di = Vec::with_capacity(n);
    let mut minus_di = Vec::with_capacity(n);

    for i in 0..n {
        match (smoothed_plus[i], smoothed_minus[i], smoothed_tr[i]) {
            (Some(p), Some(m), Some(t)) if t > 0.0 => {
                plus_di.push(Some(p / t * 100.0));
                minus_di.push(Some(m / t * 100.0));
            }
            (Some(_), Some(_), Some(_)) => {
                plus_di.push(Some(0.0));
                minus_di.push(Some(0.0));
            }
            _ => {
                plus_di.push(None);
                minus_di.push(None);
            }
        }
    }

    (plus_di, minus_di)
}

/// Calculate Average Directional Index (Wilder smoothing of DX)
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let (plus_di, minus_di) = dmi(high, low, close, period);

    let mut dx = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        if let (Some(pdi), Some(mdi)) = (plus_di[i], minus_di[i]) {
            let sum = pdi + mdi;
            if sum > 0.0 {
                dx.push(((pdi - mdi).abs() / sum) * 100.0);
            } else {
                dx.push(0.0);
            }
        } else {
            dx.push(0.0);
        }
    }

    wilder(&dx, period)
}

/// Calculate MACD line, signal line and histogram
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let n = values.len();
    let ema_fast = ema(values, fast);
    let ema_slow = ema(values, slow);

    let mut macd_line = Vec::with_capacity(n);
    for i in 0..n {
        match (ema_fast.get(i).copied().flatten(), ema_slow.get(i).copied().flatten()) {
            (Some(f), Some(s)) => macd_line.push(Some(f - s)),
            _ => macd_line.push(None),
        }
    }

    // Signal line: EMA over the defined region of the MACD line
    let first_defined = macd_line.iter().position(|v| v.is_some()).unwrap_or(n);
    let defined: Vec<f64> = macd_line[first_defined..]
        .iter()
        .map(|v| v.unwrap_or(0.0))
        .collect();
    let signal_defined = ema(&defined, signal);

    let mut signal_line = vec![None; first_defined];
    signal_line.extend(signal_defined);
    signal_line.resize(n, None);

    let mut histogram = Vec::with_capacity(n);
    for i in 0..n {
        match (macd_line[i], signal_line[i]) {
            (Some(m), Some(s)) => histogram.push(Some(m - s)),
            _ => histogram.push(None),
        }
    }

    (macd_line, signal_line, histogram)
}

/// Candle-derived indicator bundle for one symbol and timeframe
///
/// Produced whole or not at all: a buffer too short for any member yields
/// `None` rather than a partially populated set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorSet {
    pub ema12: f64,
    pub ema26: f64,
    pub rsi14: f64,
    pub adx14: f64,
    pub atr14: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
}

impl IndicatorSet {
    /// Rows required before the full set is defined
    ///
    /// The binding constraint is the MACD signal line: an ema9 over a
    /// MACD series that only starts at the ema26 seed, so
    /// `slow + signal - 1` rows. Everything else warms up sooner.
    pub fn required_rows() -> usize {
        (EMA_SLOW + MACD_SIGNAL - 1).max(2 * WILDER_PERIOD)
    }

    /// Compute the full set from a candle snapshot
    ///
    /// Returns `None` when the buffer is shorter than `required_rows` or
    /// any input value is not finite.
    pub fn compute(candles: &[Candle]) -> Option<IndicatorSet> {
        if candles.len() < Self::required_rows() {
            return None;
        }

        let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let close: Vec<f64> = candles.iter().map(|c| c.close).collect();

        if high
            .iter()
            .chain(low.iter())
            .chain(close.iter())
            .any(|v| !v.is_finite())
        {
            return None;
        }

        let ema12 = ema(&close, EMA_FAST).last().copied().flatten()?;
        let ema26 = ema(&close, EMA_SLOW).last().copied().flatten()?;
        let rsi14 = rsi(&close, WILDER_PERIOD).last().copied().flatten()?;
        let adx14 = adx(&high, &low, &close, WILDER_PERIOD)
            .last()
            .copied()
            .flatten()?;
        let atr14 = atr(&high, &low, &close, WILDER_PERIOD)
            .last()
            .copied()
            .flatten()?;
        let (macd_line, signal_line, hist) = macd(&close, EMA_FAST, EMA_SLOW, MACD_SIGNAL);
        let macd_v = macd_line.last().copied().flatten()?;
        let macd_signal = signal_line.last().copied().flatten()?;
        let macd_hist = hist.last().copied().flatten()?;

        Some(IndicatorSet {
            ema12,
            ema26,
            rsi14,
            adx14,
            atr14,
            macd: macd_v,
            macd_signal,
            macd_hist,
        })
    }
}

/// Microstructure metrics from ticker and depth buffers
///
/// Missing inputs yield the documented defaults instead of an error; the
/// coordinator treats the default set as "no signal".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Microstructure {
    pub bid_ask_spread: f64,
    pub order_book_imbalance: f64,
    pub ema5: f64,
    pub atr14: f64,
    pub volume_surge_ratio: f64,
    pub best_ask: f64,
}

impl Default for Microstructure {
    fn default() -> Self {
        Microstructure {
            bid_ask_spread: 0.0,
            order_book_imbalance: 0.5,
            ema5: 0.0,
            atr14: 0.0001,
            volume_surge_ratio: 1.0,
            best_ask: 0.0,
        }
    }
}

impl Microstructure {
    pub fn compute(ticks: &[TickerTick], depth: Option<&DepthSnapshot>) -> Microstructure {
        if ticks.len() < 14 {
            return Microstructure::default();
        }

        let last = &ticks[ticks.len() - 1];

        // Spread from the latest ticker; fall back to top-of-book depth
        let (best_bid, best_ask) = if last.best_bid > 0.0 && last.best_ask > 0.0 {
            (last.best_bid, last.best_ask)
        } else {
            match depth {
                Some(d) => (
                    d.best_bid().map(|(p, _)| p).unwrap_or(0.0),
                    d.best_ask().map(|(p, _)| p).unwrap_or(0.0),
                ),
                None => (0.0, 0.0),
            }
        };
        let bid_ask_spread = if best_bid > 0.0 {
            (best_ask - best_bid) / best_bid
        } else {
            0.0
        };

        let order_book_imbalance = depth
            .map(|d| {
                let bid_qty: f64 = d.bids.iter().take(IMBALANCE_DEPTH).map(|(_, q)| q).sum();
                let ask_qty: f64 = d.asks.iter().take(IMBALANCE_DEPTH).map(|(_, q)| q).sum();
                let total = bid_qty + ask_qty;
                if total > 0.0 {
                    bid_qty / total
                } else {
                    0.5
                }
            })
            .unwrap_or(0.5);

        let prices: Vec<f64> = ticks.iter().map(|t| t.last_price).collect();
        let ema5 = ema(&prices, 5)
            .last()
            .copied()
            .flatten()
            .unwrap_or(last.last_price);

        // ATR over ticks: mean absolute move of the last 14 price changes
        let diffs: Vec<f64> = prices.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
        let atr14 = if diffs.is_empty() {
            0.0001
        } else {
            let tail = &diffs[diffs.len().saturating_sub(14)..];
            tail.iter().sum::<f64>() / tail.len() as f64
        };

        let volume_surge_ratio = {
            let vols: Vec<f64> = ticks.iter().map(|t| t.volume_24h).collect();
            let latest = *vols.last().unwrap_or(&0.0);
            let prior = &vols[..vols.len() - 1];
            let baseline = &prior[prior.len().saturating_sub(VOLUME_BASELINE)..];
            if baseline.is_empty() {
                1.0
            } else {
                let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
                if mean > 0.0 {
                    latest / mean
                } else {
                    1.0
                }
            }
        };

        Microstructure {
            bid_ask_spread,
            order_book_imbalance,
            ema5,
            atr14,
            volume_surge_ratio,
            best_ask,
        }
    }
}
