//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::{InstrumentSpec, Symbol, Timeframe};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Load API credentials from environment if not set
        if let Ok(api_key) = std::env::var("GRID_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("GRID_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trading.symbols.is_empty() {
            anyhow::bail!("trading.symbols must not be empty");
        }
        if self.grid.levels_below + self.grid.levels_above >= self.grid.grid_levels_n {
            anyhow::bail!(
                "grid.levels_below + grid.levels_above must be < grid.grid_levels_n ({} + {} >= {})",
                self.grid.levels_below,
                self.grid.levels_above,
                self.grid.grid_levels_n
            );
        }
        if !(0.0..=1.0).contains(&self.grid.notional_fraction) {
            anyhow::bail!("grid.notional_fraction must be within [0, 1]");
        }
        if self.trading.tick_period_s == 0 {
            anyhow::bail!("trading.tick_period_s must be > 0");
        }
        Ok(())
    }
}

/// Exchange connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub rest_url: String,
    pub ws_url: String,
    /// Suppress all order-mutating venue calls and simulate them locally
    pub dry_run: bool,
    /// Requests per second budget for the shared REST client
    pub rate_limit: u32,
    /// Per-request deadline in seconds
    pub request_timeout_s: u64,
    /// Transport retries before a call is surfaced as failed
    pub max_retries: u32,
    /// Simulated balances used in dry-run mode, keyed by asset
    #[serde(default)]
    pub dry_run_balances: HashMap<String, f64>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            rest_url: "https://api.exchange.example.com".to_string(),
            ws_url: "wss://stream.exchange.example.com/ws".to_string(),
            dry_run: false,
            rate_limit: 10,
            request_timeout_s: 30,
            max_retries: 3,
            dry_run_balances: HashMap::new(),
        }
    }
}

/// Trading loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    /// Coordinator tick interval in seconds
    pub tick_period_s: u64,
    /// Venue precision per symbol; falls back to the default spec
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentSpec>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec!["HBAR-USDT".to_string()],
            tick_period_s: 30,
            instruments: HashMap::new(),
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }

    pub fn instrument(&self, symbol: &Symbol) -> InstrumentSpec {
        self.instruments
            .get(symbol.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

/// Grid geometry and sizing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Number of levels in the grid
    pub grid_levels_n: usize,
    /// Buy levels maintained strictly below the current price
    pub levels_below: usize,
    /// Sell levels maintained strictly above the current price
    pub levels_above: usize,
    /// Spacing multiplier applied to atr14
    pub atr_multiplier: f64,
    /// Floor spacing as a fraction of the current price
    pub min_spacing_pct: f64,
    /// Fraction of (open buys value + quote balance) allocated to the grid
    pub notional_fraction: f64,
    /// Consecutive ticks above the top level that trigger a rebuild
    pub reset_ticks_above_top: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            grid_levels_n: 20,
            levels_below: 5,
            levels_above: 1,
            atr_multiplier: 2.0,
            min_spacing_pct: 0.012,
            notional_fraction: 0.75,
            reset_ticks_above_top: 30,
        }
    }
}

/// Regime classification thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// ADX boundary separating trending from sideways
    pub adx_threshold: f64,
    /// RSI ceiling above which an uptrend is considered exhausted
    pub rsi_upper: f64,
    /// RSI floor below which a downtrend is considered exhausted
    pub rsi_lower: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            adx_threshold: 20.0,
            rsi_upper: 70.0,
            rsi_lower: 30.0,
        }
    }
}

/// Per-buffer retention caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Candle rows kept per timeframe, keyed by timeframe label
    #[serde(default)]
    pub candles: HashMap<String, usize>,
    /// Ticker ticks kept per symbol
    pub ticker: usize,
    /// Depth levels kept per book side
    pub depth_levels: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            candles: HashMap::new(),
            ticker: 1000,
            depth_levels: 20,
        }
    }
}

impl RetentionConfig {
    pub fn candle_cap(&self, timeframe: Timeframe) -> usize {
        self.candles
            .get(timeframe.as_str())
            .copied()
            .unwrap_or_else(|| timeframe.default_retention())
    }
}
