//! Market regime classification
//!
//! Maps an indicator set to a discrete market state per timeframe. The
//! mapping is total: every defined indicator set produces exactly one
//! regime, and a missing set produces `Unknown`.

use serde::{Deserialize, Serialize};

use crate::config::RegimeConfig;
use crate::indicators::IndicatorSet;
use crate::market_data::MarketBuffers;
use crate::{Symbol, Timeframe};
use std::collections::HashMap;

/// Discrete market state for one timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Uptrend,
    Downtrend,
    Sideways,
    Unknown,
}

impl Regime {
    /// Trading is allowed while the regime is not trending down
    pub fn is_tradeable(&self) -> bool {
        matches!(self, Regime::Uptrend | Regime::Sideways)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Regime::Uptrend => "uptrend",
            Regime::Downtrend => "downtrend",
            Regime::Sideways => "sideways",
            Regime::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Regime classifier with configuration-supplied thresholds
#[derive(Debug, Clone, Copy)]
pub struct RegimeClassifier {
    thresholds: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(thresholds: RegimeConfig) -> Self {
        RegimeClassifier { thresholds }
    }

    /// Classify a single indicator set
    ///
    /// Rules, in order:
    /// - sideways when adx14 is below the trend threshold
    /// - uptrend when trending, ema12 above ema26 and rsi14 below the ceiling
    /// - downtrend when trending, ema12 below ema26 and rsi14 above the floor
    /// - sideways otherwise
    /// - unknown when the set is missing
    pub fn classify_set(&self, set: Option<&IndicatorSet>) -> Regime {
        let set = match set {
            Some(s) => s,
            None => return Regime::Unknown,
        };
        let t = &self.thresholds;

        if set.adx14 < t.adx_threshold {
            Regime::Sideways
        } else if set.ema12 > set.ema26 && set.rsi14 < t.rsi_upper {
            Regime::Uptrend
        } else if set.ema12 < set.ema26 && set.rsi14 > t.rsi_lower {
            Regime::Downtrend
        } else {
            Regime::Sideways
        }
    }

    /// Classify one symbol/timeframe from the current buffers
    pub fn classify(&self, buffers: &MarketBuffers, symbol: &Symbol, timeframe: Timeframe) -> Regime {
        let candles = buffers.candles_snapshot(symbol, timeframe);
        let set = IndicatorSet::compute(&candles);
        self.classify_set(set.as_ref())
    }

    /// Classify every timeframe with a populated buffer
    ///
    /// 1h and 1d drive the trade gates; 15m and 6h are advisory and only
    /// appear in the result when their buffers hold data.
    pub fn classify_all(
        &self,
        buffers: &MarketBuffers,
        symbol: &Symbol,
    ) -> HashMap<Timeframe, Regime> {
        let mut states = HashMap::new();
        for tf in [Timeframe::H1, Timeframe::D1] {
            states.insert(tf, self.classify(buffers, symbol, tf));
        }
        for tf in [Timeframe::M15, Timeframe::H6] {
            if !buffers.candles_snapshot(symbol, tf).is_empty() {
                states.insert(tf, self.classify(buffers, symbol, tf));
            }
        }
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ema12: f64, ema26: f64, rsi14: f64, adx14: f64) -> IndicatorSet {
        IndicatorSet {
            ema12,
            ema26,
            rsi14,
            adx14,
            atr14: 0.002,
            macd: ema12 - ema26,
            macd_signal: 0.0,
            macd_hist: ema12 - ema26,
        }
    }

    fn classifier() -> RegimeClassifier {
        RegimeClassifier::new(RegimeConfig::default())
    }

    #[test]
    fn test_missing_set_is_unknown() {
        assert_eq!(classifier().classify_set(None), Regime::Unknown);
    }

    #[test]
    fn test_low_adx_is_sideways() {
        let s = set(1.1, 1.0, 55.0, 15.0);
        assert_eq!(classifier().classify_set(Some(&s)), Regime::Sideways);
    }

    #[test]
    fn test_uptrend() {
        let s = set(1.1, 1.0, 55.0, 25.0);
        assert_eq!(classifier().classify_set(Some(&s)), Regime::Uptrend);
    }

    #[test]
    fn test_overbought_uptrend_falls_back_to_sideways() {
        let s = set(1.1, 1.0, 75.0, 25.0);
        assert_eq!(classifier().classify_set(Some(&s)), Regime::Sideways);
    }

    #[test]
    fn test_downtrend() {
        let s = set(0.9, 1.0, 45.0, 25.0);
        assert_eq!(classifier().classify_set(Some(&s)), Regime::Downtrend);
    }

    #[test]
    fn test_oversold_downtrend_falls_back_to_sideways() {
        let s = set(0.9, 1.0, 25.0, 25.0);
        assert_eq!(classifier().classify_set(Some(&s)), Regime::Sideways);
    }

    #[test]
    fn test_custom_thresholds() {
        let classifier = RegimeClassifier::new(RegimeConfig {
            adx_threshold: 30.0,
            rsi_upper: 80.0,
            rsi_lower: 20.0,
        });
        // ADX 25 no longer counts as trending under the raised threshold
        let s = set(1.1, 1.0, 55.0, 25.0);
        assert_eq!(classifier.classify_set(Some(&s)), Regime::Sideways);
    }

    #[test]
    fn test_classification_is_total() {
        // Sweep a coarse cube of inputs; every cell must land on a label
        let classifier = classifier();
        for ema_diff in [-1.0, 0.0, 1.0] {
            for rsi in [10.0, 50.0, 90.0] {
                for adx in [5.0, 20.0, 60.0] {
                    let s = set(100.0 + ema_diff, 100.0, rsi, adx);
                    let regime = classifier.classify_set(Some(&s));
                    assert!(matches!(
                        regime,
                        Regime::Uptrend | Regime::Downtrend | Regime::Sideways
                    ));
                }
            }
        }
    }

    #[test]
    fn test_tradeable() {
        assert!(Regime::Uptrend.is_tradeable());
        assert!(Regime::Sideways.is_tradeable());
        assert!(!Regime::Downtrend.is_tradeable());
        assert!(!Regime::Unknown.is_tradeable());
    }
}
