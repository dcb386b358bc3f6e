//! Exchange gateway
//!
//! Narrow, capability-typed facade over the venue. REST order/balance
//! calls are retried with bounded backoff and paced against the venue
//! rate limit; market data arrives over restartable websocket streams.
//! Dry-run mode is a property of the gateway, not of callers: mutating
//! calls are answered from an internal simulated book.

pub mod rest;
pub mod sim;
pub mod stream;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::ledger::ExchangeOrder;
use crate::{Candle, DepthSnapshot, Side, Symbol, TickerTick, Timeframe};

use rest::RestClient;
use sim::SimBook;

/// Backoff schedule for transport retries
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Delay applied before retrying a rate-limited call
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(2);

/// Gateway error taxonomy
///
/// `Transport` and `RateLimited` are retried internally and surfaced only
/// on exhaustion. `InsufficientFunds` and `Rejected` are terminal for the
/// call. `UnknownOrder` on cancel is benign and swallowed by the gateway.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("malformed venue response: {0}")]
    Parse(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_) | ExchangeError::RateLimited(_)
        )
    }
}

/// Venue operations the core consumes
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn create_limit_buy(
        &self,
        symbol: &Symbol,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError>;

    async fn create_limit_sell(
        &self,
        symbol: &Symbol,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError>;

    async fn create_market_sell(
        &self,
        symbol: &Symbol,
        quantity: f64,
    ) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError>;

    async fn cancel_all(&self, symbol: &Symbol, side: Side)
        -> Result<Vec<String>, ExchangeError>;

    async fn fetch_open_orders(&self, symbol: &Symbol)
        -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn fetch_orders_since(
        &self,
        symbol: &Symbol,
        since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    async fn fetch_candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;
}

/// Production gateway: retrying REST facade plus websocket streams
pub struct Gateway {
    rest: RestClient,
    ws_url: String,
    dry_run: bool,
    sim: SimBook,
    max_retries: u32,
    pace: tokio::sync::Mutex<tokio::time::Instant>,
    min_gap: Duration,
}

impl Gateway {
    pub fn new(config: &ExchangeConfig) -> Self {
        let rate = config.rate_limit.max(1);
        Gateway {
            rest: RestClient::new(config),
            ws_url: config.ws_url.clone(),
            dry_run: config.dry_run,
            sim: SimBook::new(config.dry_run_balances.clone()),
            max_retries: config.max_retries,
            pace: tokio::sync::Mutex::new(tokio::time::Instant::now()),
            min_gap: Duration::from_millis(1000 / rate as u64),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Verify venue connectivity before streams and preload start
    pub async fn connect(&self) -> Result<(), ExchangeError> {
        if self.dry_run {
            info!("Gateway in dry-run mode; skipping venue connectivity check");
            return Ok(());
        }
        self.with_retry("ping", || self.rest.ping()).await?;
        info!("Exchange gateway connected");
        Ok(())
    }

    /// Space requests out to respect the shared rate budget
    async fn throttle(&self) {
        let mut last = self.pace.lock().await;
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(*last);
        if elapsed < self.min_gap {
            sleep(self.min_gap - elapsed).await;
        }
        *last = tokio::time::Instant::now();
    }

    /// Run a venue call with pacing, bounded exponential backoff on
    /// transport errors and respectful delay on rate limits
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0u32;

        loop {
            self.throttle().await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let wait = match err {
                        ExchangeError::RateLimited(_) => RATE_LIMIT_DELAY,
                        _ => delay,
                    };
                    warn!(
                        call = what,
                        attempt,
                        error = %err,
                        wait_ms = wait.as_millis() as u64,
                        "Retrying venue call"
                    );
                    sleep(wait).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ------------------------------------------------------------------
    // Streaming interface: lazy, restartable sequences
    // ------------------------------------------------------------------

    pub fn subscribe_ticker(&self, symbol: &Symbol) -> mpsc::Receiver<TickerTick> {
        stream::subscribe_ticker(&self.ws_url, symbol)
    }

    pub fn subscribe_depth(&self, symbol: &Symbol) -> mpsc::Receiver<DepthSnapshot> {
        stream::subscribe_depth(&self.ws_url, symbol)
    }

    pub fn subscribe_candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> mpsc::Receiver<Candle> {
        stream::subscribe_candles(&self.ws_url, symbol, timeframe)
    }
}

#[async_trait]
impl ExchangeApi for Gateway {
    async fn create_limit_buy(
        &self,
        symbol: &Symbol,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        if self.dry_run {
            return self.sim.create_limit(symbol, Side::Buy, price, quantity);
        }
        self.with_retry("create_limit_buy", || {
            self.rest.create_order(symbol, Side::Buy, Some(price), quantity)
        })
        .await
    }

    async fn create_limit_sell(
        &self,
        symbol: &Symbol,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        if self.dry_run {
            return self.sim.create_limit(symbol, Side::Sell, price, quantity);
        }
        self.with_retry("create_limit_sell", || {
            self.rest.create_order(symbol, Side::Sell, Some(price), quantity)
        })
        .await
    }

    async fn create_market_sell(
        &self,
        symbol: &Symbol,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        if self.dry_run {
            return self.sim.create_market_sell(symbol, quantity);
        }
        self.with_retry("create_market_sell", || {
            self.rest.create_order(symbol, Side::Sell, None, quantity)
        })
        .await
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
        let result = if self.dry_run {
            self.sim.cancel_order(symbol, order_id)
        } else {
            self.with_retry("cancel_order", || self.rest.cancel_order(symbol, order_id))
                .await
        };

        match result {
            // Already gone on the venue: success for our purposes
            Err(ExchangeError::UnknownOrder(id)) => {
                debug!(order_id = %id, "Cancel target already absent");
                Ok(())
            }
            other => other,
        }
    }

    async fn cancel_all(
        &self,
        symbol: &Symbol,
        side: Side,
    ) -> Result<Vec<String>, ExchangeError> {
        if self.dry_run {
            return self.sim.cancel_all(symbol, side);
        }
        self.with_retry("cancel_all", || self.rest.cancel_all(symbol, side))
            .await
    }

    async fn fetch_open_orders(
        &self,
        symbol: &Symbol,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        if self.dry_run {
            return self.sim.open_orders(symbol);
        }
        self.with_retry("fetch_open_orders", || self.rest.open_orders(symbol))
            .await
    }

    async fn fetch_orders_since(
        &self,
        symbol: &Symbol,
        since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        if self.dry_run {
            return self.sim.orders_since(symbol, since_ms);
        }
        self.with_retry("fetch_orders_since", || {
            self.rest.orders_since(symbol, since_ms)
        })
        .await
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        if self.dry_run {
            return self.sim.balance(asset);
        }
        self.with_retry("get_balance", || self.rest.balance(asset))
            .await
    }

    async fn fetch_candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        // Candle history is public data; fetched live even in dry-run
        self.with_retry("fetch_candles", || {
            self.rest.candles(symbol, timeframe, limit)
        })
        .await
    }
}

/// Shared handle type used across the engine
pub type SharedExchange = Arc<dyn ExchangeApi>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dry_run_gateway() -> Gateway {
        let mut config = ExchangeConfig::default();
        config.dry_run = true;
        config.dry_run_balances =
            HashMap::from([("USDT".to_string(), 1000.0), ("HBAR".to_string(), 500.0)]);
        Gateway::new(&config)
    }

    #[tokio::test]
    async fn test_dry_run_ids_are_deterministic() {
        let gateway = dry_run_gateway();
        let symbol = Symbol::new("HBAR-USDT");

        let id = gateway
            .create_limit_buy(&symbol, 0.096, 104.0)
            .await
            .unwrap();
        assert_eq!(id, "dryrun:buy:0.096:104");
    }

    #[tokio::test]
    async fn test_dry_run_orders_visible_in_fetch() {
        let gateway = dry_run_gateway();
        let symbol = Symbol::new("HBAR-USDT");

        gateway
            .create_limit_buy(&symbol, 0.096, 104.0)
            .await
            .unwrap();
        let open = gateway.fetch_open_orders(&symbol).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Buy);
        assert_eq!(open[0].price, 0.096);
    }

    #[tokio::test]
    async fn test_dry_run_cancel_unknown_is_benign() {
        let gateway = dry_run_gateway();
        let symbol = Symbol::new("HBAR-USDT");
        assert!(gateway.cancel_order(&symbol, "missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_dry_run_balance_fixtures() {
        let gateway = dry_run_gateway();
        assert_eq!(gateway.get_balance("USDT").await.unwrap(), 1000.0);
        assert_eq!(gateway.get_balance("UNSET").await.unwrap(), 0.0);
    }
}
