//! Grid Trading Engine
//!
//! An automated grid trading system for spot cryptocurrency pairs,
//! featuring volatility-derived level geometry, multi-timeframe market
//! regime gating, and continuous reconciliation against the exchange.

pub mod config;
pub mod exchange;
pub mod grid;
pub mod indicators;
pub mod ledger;
pub mod market_data;
pub mod regime;
pub mod supervisor;
pub mod types;

pub use config::Config;
pub use regime::Regime;
pub use types::*;
