//! Lifecycle supervisor
//!
//! Owns process startup, the periodic coordinator ticks and graceful
//! shutdown. Startup order: gateway connect, buffer preload, stream
//! subscriptions, initial reconciliation, then the first tick. On
//! termination every managed symbol's resting orders are cancelled
//! (unless dry-run), stream tasks are stopped and the gateway released.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::exchange::{ExchangeApi, Gateway, SharedExchange};
use crate::grid::GridCoordinator;
use crate::market_data::MarketBuffers;
use crate::{Side, Symbol, Timeframe};

/// REST refresh cadence for timeframes with weaker stream reliability
const REFRESH_1H: Duration = Duration::from_secs(60);
const REFRESH_1D: Duration = Duration::from_secs(600);

/// How long shutdown waits for tasks to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Supervisor { config }
    }

    /// Run the engine until a termination signal or fatal error
    pub async fn run(self) -> Result<()> {
        let symbols = self.config.trading.symbols();
        let tick_period = Duration::from_secs(self.config.trading.tick_period_s);

        info!(
            symbols = ?self.config.trading.symbols,
            tick_period_s = self.config.trading.tick_period_s,
            dry_run = self.config.exchange.dry_run,
            "Starting grid engine"
        );

        // 1. Gateway connect
        let gateway = Arc::new(Gateway::new(&self.config.exchange));
        gateway
            .connect()
            .await
            .context("Exchange gateway connect failed")?;
        let exchange: SharedExchange = gateway.clone();

        // 2. Preload buffers
        let buffers = MarketBuffers::new(self.config.retention.clone());
        for symbol in &symbols {
            for tf in Timeframe::ALL {
                match exchange
                    .fetch_candles(symbol, tf, tf.preload_horizon())
                    .await
                {
                    Ok(candles) => buffers.preload_candles(symbol, tf, candles),
                    Err(e) => {
                        warn!(symbol = %symbol, timeframe = %tf, error = %e, "Candle preload failed")
                    }
                }
            }
        }

        // Shutdown fan-out and fatal-error fan-in
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(4);

        // 3. Stream subscriptions feeding the buffers
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for symbol in &symbols {
            tasks.push(spawn_ticker_pump(
                gateway.clone(),
                buffers.clone(),
                symbol.clone(),
                shutdown_rx.clone(),
            ));
            tasks.push(spawn_depth_pump(
                gateway.clone(),
                buffers.clone(),
                symbol.clone(),
                shutdown_rx.clone(),
            ));
            for tf in Timeframe::ALL {
                tasks.push(spawn_candle_pump(
                    gateway.clone(),
                    buffers.clone(),
                    symbol.clone(),
                    tf,
                    shutdown_rx.clone(),
                ));
            }
            // Streams for the slow timeframes are backstopped by REST
            tasks.push(spawn_candle_refresh(
                exchange.clone(),
                buffers.clone(),
                symbol.clone(),
                Timeframe::H1,
                REFRESH_1H,
                shutdown_rx.clone(),
            ));
            tasks.push(spawn_candle_refresh(
                exchange.clone(),
                buffers.clone(),
                symbol.clone(),
                Timeframe::D1,
                REFRESH_1D,
                shutdown_rx.clone(),
            ));
        }

        // 4 + 5. Per-symbol coordinators: initial reconcile, then ticks
        for symbol in &symbols {
            let mut coordinator = GridCoordinator::new(
                symbol.clone(),
                self.config.grid.clone(),
                self.config.regime,
                self.config.trading.instrument(symbol),
                buffers.clone(),
                exchange.clone(),
            );

            let mut shutdown = shutdown_rx.clone();
            let fatal = fatal_tx.clone();
            let symbol_name = symbol.clone();
            tasks.push(tokio::spawn(async move {
                coordinator.bootstrap().await;

                let mut ticker = interval(tick_period);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            // A tick exceeding 2x its period is cancelled;
                            // the next tick reconciles from exchange truth
                            match timeout(tick_period * 2, coordinator.tick()).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    error!(symbol = %symbol_name, error = %e, escalated = true, "Fatal coordinator error");
                                    let _ = fatal.send(format!("{}: {}", symbol_name, e)).await;
                                    break;
                                }
                                Err(_) => {
                                    warn!(symbol = %symbol_name, "Tick exceeded deadline; retrying next period");
                                }
                            }
                        }
                    }
                }
            }));
        }
        drop(fatal_tx);

        info!("Engine running; press Ctrl+C to stop");

        // Wait for a termination signal or an escalated failure
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Termination signal received; shutting down"),
                    Err(e) => error!(error = %e, "Signal handler failed; shutting down"),
                }
            }
            reason = fatal_rx.recv() => {
                if let Some(reason) = reason {
                    error!(reason = %reason, escalated = true, "Escalated failure; shutting down");
                }
            }
        }

        // Shutdown is idempotent: the watch flips once, later signals
        // during teardown are coalesced by the already-closed loop tasks
        let _ = shutdown_tx.send(true);

        for task in tasks {
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Task did not stop within grace period; aborting");
            }
        }

        if !self.config.exchange.dry_run {
            for symbol in &symbols {
                for side in [Side::Buy, Side::Sell] {
                    match exchange.cancel_all(symbol, side).await {
                        Ok(ids) if !ids.is_empty() => {
                            info!(symbol = %symbol, side = %side, count = ids.len(), "Orders cancelled on shutdown")
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(symbol = %symbol, side = %side, error = %e, "Shutdown cancel failed")
                        }
                    }
                }
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

fn spawn_ticker_pump(
    gateway: Arc<Gateway>,
    buffers: MarketBuffers,
    symbol: Symbol,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = gateway.subscribe_ticker(&symbol);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                item = rx.recv() => match item {
                    Some(tick) => {
                        buffers.append_ticker(&symbol, tick);
                    }
                    None => break,
                },
            }
        }
    })
}

fn spawn_depth_pump(
    gateway: Arc<Gateway>,
    buffers: MarketBuffers,
    symbol: Symbol,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = gateway.subscribe_depth(&symbol);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                item = rx.recv() => match item {
                    Some(depth) => {
                        buffers.set_depth(&symbol, depth);
                    }
                    None => break,
                },
            }
        }
    })
}

fn spawn_candle_pump(
    gateway: Arc<Gateway>,
    buffers: MarketBuffers,
    symbol: Symbol,
    timeframe: Timeframe,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = gateway.subscribe_candles(&symbol, timeframe);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                item = rx.recv() => match item {
                    Some(candle) => {
                        buffers.append_candle(&symbol, timeframe, candle);
                    }
                    None => break,
                },
            }
        }
    })
}

/// Periodic REST backstop: ask for the latest closed candles and append
/// whatever the stream missed
fn spawn_candle_refresh(
    exchange: SharedExchange,
    buffers: MarketBuffers,
    symbol: Symbol,
    timeframe: Timeframe,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match exchange.fetch_candles(&symbol, timeframe, 2).await {
                        Ok(candles) => {
                            for candle in candles {
                                if buffers.append_candle(&symbol, timeframe, candle) {
                                    info!(symbol = %symbol, timeframe = %timeframe, "New candle via refresh");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "Candle refresh failed")
                        }
                    }
                }
            }
        }
    })
}
