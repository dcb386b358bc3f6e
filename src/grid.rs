//! Grid coordinator
//!
//! Owns the per-symbol control loop: level geometry, trade-gate flags,
//! reconciliation against the exchange, regime reactions and order
//! placement. One tick runs the steps in fixed order; every recoverable
//! failure defers work to the next tick, because the exchange is the
//! authoritative ledger and reconciliation converges on restart.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{GridConfig, RegimeConfig};
use crate::exchange::{ExchangeError, SharedExchange};
use crate::indicators::{IndicatorSet, Microstructure};
use crate::ledger::{desired_levels, DesiredLevels, LedgerError, OrderLedger};
use crate::market_data::MarketBuffers;
use crate::regime::{Regime, RegimeClassifier};
use crate::{InstrumentSpec, Side, Symbol, Timeframe};

/// Price snapshot retries before a tick is skipped
const PRICE_RETRIES: u32 = 3;
const PRICE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Overlap window when fetching recent orders, to absorb clock skew
const RECONCILE_OVERLAP_MS: i64 = 60_000;

/// Compute the fixed level set around the current price
///
/// Spacing is `max(atr_multiplier * atr, min_spacing_pct * price)`;
/// `levels_below` levels sit strictly below the price and the rest extend
/// above. Levels are quantized to the venue tick; when two raw levels
/// collapse onto one tick the lower-priced one wins. Output is
/// deterministic for fixed inputs.
pub fn compute_grid_levels(
    price: f64,
    atr: f64,
    config: &GridConfig,
    instrument: &InstrumentSpec,
) -> Vec<f64> {
    let spacing = (config.atr_multiplier * atr).max(config.min_spacing_pct * price);
    let mut levels = Vec::with_capacity(config.grid_levels_n);

    for i in 0..config.grid_levels_n {
        let raw = price + (i as f64 - config.levels_below as f64) * spacing;
        if raw <= 0.0 {
            continue;
        }
        let quantized = instrument.quantize_price(raw);
        if quantized <= 0.0 {
            continue;
        }
        if let Some(&last) = levels.last() {
            if instrument.same_level(last, quantized) {
                continue;
            }
        }
        levels.push(quantized);
    }

    levels
}

/// Per-symbol grid trading coordinator
pub struct GridCoordinator {
    symbol: Symbol,
    config: GridConfig,
    classifier: RegimeClassifier,
    instrument: InstrumentSpec,
    buffers: MarketBuffers,
    exchange: SharedExchange,
    ledger: OrderLedger,
    grid_levels: Vec<f64>,
    long_term_gate: bool,
    short_term_gate: bool,
    ticks_above_top: u32,
    reset_requested: bool,
    last_long_term: Regime,
    last_short_term: Regime,
    last_reconcile: DateTime<Utc>,
}

impl GridCoordinator {
    pub fn new(
        symbol: Symbol,
        config: GridConfig,
        regime: RegimeConfig,
        instrument: InstrumentSpec,
        buffers: MarketBuffers,
        exchange: SharedExchange,
    ) -> Self {
        GridCoordinator {
            ledger: OrderLedger::new(instrument.clone()),
            symbol,
            config,
            classifier: RegimeClassifier::new(regime),
            instrument,
            buffers,
            exchange,
            grid_levels: Vec::new(),
            long_term_gate: true,
            short_term_gate: true,
            ticks_above_top: 0,
            reset_requested: false,
            last_long_term: Regime::Unknown,
            last_short_term: Regime::Unknown,
            last_reconcile: Utc::now(),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn gates(&self) -> (bool, bool) {
        (self.long_term_gate, self.short_term_gate)
    }

    pub fn grid_levels(&self) -> &[f64] {
        &self.grid_levels
    }

    pub fn ticks_above_top(&self) -> u32 {
        self.ticks_above_top
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    /// Startup reconciliation: rebuild the local order picture from the
    /// venue before the first tick. Best-effort; the first tick repeats
    /// the merge anyway.
    pub async fn bootstrap(&mut self) {
        match self.reconcile().await {
            Ok(_) => info!(symbol = %self.symbol, "Initial reconciliation complete"),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Initial reconciliation failed; first tick will retry")
            }
        }
    }

    /// Run one coordinator tick
    ///
    /// Recoverable conditions never surface; the next tick converges from
    /// exchange truth. Only authentication failures propagate.
    pub async fn tick(&mut self) -> Result<()> {
        // Step 1: price snapshot
        let price = match self.current_price().await {
            Some(p) => p,
            None => {
                warn!(symbol = %self.symbol, "No price available; skipping tick");
                return Ok(());
            }
        };

        // Step 2: regime refresh; unknown regimes leave the gates alone.
        // 1h and 1d drive the gates; other populated timeframes are
        // advisory context only.
        let states = self.classifier.classify_all(&self.buffers, &self.symbol);
        let long_term = states
            .get(&Timeframe::D1)
            .copied()
            .unwrap_or(Regime::Unknown);
        let short_term = states
            .get(&Timeframe::H1)
            .copied()
            .unwrap_or(Regime::Unknown);
        for (tf, regime) in &states {
            if !matches!(tf, Timeframe::H1 | Timeframe::D1) {
                debug!(symbol = %self.symbol, timeframe = %tf, regime = %regime, "Advisory regime");
            }
        }

        if long_term != self.last_long_term || short_term != self.last_short_term {
            info!(
                symbol = %self.symbol,
                long_term = %long_term,
                short_term = %short_term,
                "Market state change"
            );
            self.last_long_term = long_term;
            self.last_short_term = short_term;
        }

        let gates_open_at_entry = self.long_term_gate && self.short_term_gate;

        // Step 3: long-term reaction
        if self.long_term_gate && long_term == Regime::Downtrend {
            self.handle_long_term_downtrend().await;
        }
        // Step 4: short-term reaction; sells stay to harvest remaining upside
        else if self.short_term_gate && short_term == Regime::Downtrend {
            self.handle_short_term_downtrend().await;
        }

        // Step 5: gate recovery. A gate re-enabled now produces no
        // placements until the next tick (gates_open_at_entry guard).
        if !self.long_term_gate && long_term.is_tradeable() {
            info!(symbol = %self.symbol, regime = %long_term, "Long-term gate re-enabled");
            self.long_term_gate = true;
        }
        if !self.short_term_gate && short_term.is_tradeable() {
            info!(symbol = %self.symbol, regime = %short_term, "Short-term gate re-enabled");
            self.short_term_gate = true;
        }

        // Step 6: breakout reset check
        if let Some(&top) = self.grid_levels.last() {
            if self.instrument.price_ticks(price) > self.instrument.price_ticks(top) {
                self.ticks_above_top += 1;
                debug!(
                    symbol = %self.symbol,
                    ticks = self.ticks_above_top,
                    top,
                    "Price above top grid level"
                );
                if self.ticks_above_top >= self.config.reset_ticks_above_top {
                    info!(symbol = %self.symbol, price, top, "Breakout reset triggered");
                    if let Err(e) = self.exchange.cancel_all(&self.symbol, Side::Buy).await {
                        warn!(symbol = %self.symbol, error = %e, "Breakout buy cancel failed");
                    }
                    self.reset_requested = true;
                    self.ticks_above_top = 0;
                }
            } else {
                self.ticks_above_top = 0;
            }
        }

        if !(gates_open_at_entry && self.long_term_gate && self.short_term_gate) {
            debug!(symbol = %self.symbol, "Gates closed; tick ends after state upkeep");
            return Ok(());
        }

        // Step 7: reconcile against exchange truth
        match self.reconcile().await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(ExchangeError::Authentication(e)) => {
                return Err(anyhow!("authentication failure during reconcile: {}", e));
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Reconcile failed; deferring to next tick");
                return Ok(());
            }
        }

        // Step 8: geometry
        if self.grid_levels.is_empty() || self.reset_requested {
            let candles = self.buffers.candles_snapshot(&self.symbol, Timeframe::H1);
            match IndicatorSet::compute(&candles).map(|s| s.atr14) {
                Some(atr) => {
                    self.grid_levels =
                        compute_grid_levels(price, atr, &self.config, &self.instrument);
                    self.reset_requested = false;
                    self.ticks_above_top = 0;
                    info!(
                        symbol = %self.symbol,
                        price,
                        atr,
                        levels = self.grid_levels.len(),
                        "Grid rebuilt"
                    );
                }
                None => {
                    warn!(symbol = %self.symbol, "atr14 unavailable; grid build deferred");
                    return Ok(());
                }
            }
        }

        // Steps 9-10: sizing and placement
        self.place_orders(price).await?;

        // Settle bookkeeping for levels that left the desired set
        let keep = self.desired(price).all();
        self.ledger.prune_inactive(&keep);

        let micro = Microstructure::compute(
            &self.buffers.ticker_snapshot(&self.symbol),
            self.buffers.depth_snapshot(&self.symbol).as_ref(),
        );
        debug!(
            symbol = %self.symbol,
            price,
            spread = micro.bid_ask_spread,
            imbalance = micro.order_book_imbalance,
            volume_surge = micro.volume_surge_ratio,
            "Tick complete"
        );
        Ok(())
    }

    /// Current price with bounded retries: latest ticker, else latest 1m close
    async fn current_price(&self) -> Option<f64> {
        for attempt in 0..PRICE_RETRIES {
            if let Some(price) = self.buffers.last_price(&self.symbol) {
                if price > 0.0 {
                    return Some(price);
                }
            }
            if attempt + 1 < PRICE_RETRIES {
                sleep(PRICE_RETRY_DELAY * (attempt + 1)).await;
            }
        }
        None
    }

    /// Long-term downtrend: flatten everything, then close the gate.
    /// The sequence is best-effort in order; partial failure is logged and
    /// the exchange remains authoritative.
    async fn handle_long_term_downtrend(&mut self) {
        warn!(symbol = %self.symbol, "Long-term downtrend: liquidating position");

        if let Err(e) = self.exchange.cancel_all(&self.symbol, Side::Buy).await {
            warn!(symbol = %self.symbol, error = %e, "Buy cancel-all failed during liquidation");
        }
        if let Err(e) = self.exchange.cancel_all(&self.symbol, Side::Sell).await {
            warn!(symbol = %self.symbol, error = %e, "Sell cancel-all failed during liquidation");
        }

        match self.exchange.get_balance(self.symbol.base_asset()).await {
            Ok(balance) => {
                let quantity = self.instrument.quantize_qty(balance);
                if quantity > 0.0 {
                    match self.exchange.create_market_sell(&self.symbol, quantity).await {
                        Ok(id) => {
                            info!(symbol = %self.symbol, quantity, order_id = %id, "Base asset liquidated")
                        }
                        Err(e) => {
                            warn!(symbol = %self.symbol, error = %e, "Liquidation market sell failed")
                        }
                    }
                }
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Balance fetch failed during liquidation")
            }
        }

        self.ledger.clear();
        self.grid_levels.clear();
        self.ticks_above_top = 0;
        self.long_term_gate = false;
    }

    /// Short-term downtrend: stop buying, keep sells working
    async fn handle_short_term_downtrend(&mut self) {
        warn!(symbol = %self.symbol, "Short-term downtrend: cancelling open buys");
        if let Err(e) = self.exchange.cancel_all(&self.symbol, Side::Buy).await {
            warn!(symbol = %self.symbol, error = %e, "Buy cancel-all failed");
        }
        self.short_term_gate = false;
    }

    /// Merge the exchange order view into the ledger and clean up strays.
    /// Returns Ok(true) when the tick may proceed to placement.
    async fn reconcile(&mut self) -> Result<bool, ExchangeError> {
        let mut merged = self.exchange.fetch_open_orders(&self.symbol).await?;
        let since_ms = self.last_reconcile.timestamp_millis() - RECONCILE_OVERLAP_MS;
        let recent = self
            .exchange
            .fetch_orders_since(&self.symbol, since_ms)
            .await?;
        for order in recent {
            if !merged.iter().any(|o| o.id == order.id) {
                merged.push(order);
            }
        }
        self.last_reconcile = Utc::now();

        match self.ledger.observe(&merged) {
            Ok(report) => {
                for filled in &report.newly_filled_buys {
                    info!(symbol = %self.symbol, level = filled, "Buy fill observed");
                }
                // Stray buys are cancelled; stray sells may be ongoing
                // exits and stay untouched
                for stray in report.strays.iter().filter(|s| s.side == Side::Buy) {
                    info!(
                        symbol = %self.symbol,
                        order_id = %stray.id,
                        price = stray.price,
                        "Cancelling stray buy order"
                    );
                    if let Err(e) = self.exchange.cancel_order(&self.symbol, &stray.id).await {
                        warn!(symbol = %self.symbol, error = %e, "Stray cancel failed");
                    }
                }
                Ok(true)
            }
            Err(err @ LedgerError::InvariantViolation { .. }) => {
                error!(
                    symbol = %self.symbol,
                    error = %err,
                    escalated = true,
                    "Ledger invariant violated; flattening buy side and rebuilding"
                );
                if let Err(e) = self.exchange.cancel_all(&self.symbol, Side::Buy).await {
                    warn!(symbol = %self.symbol, error = %e, "Recovery buy cancel-all failed");
                }
                self.ledger.clear();
                self.reset_requested = true;
                Ok(false)
            }
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "Observe failed; deferring");
                Ok(false)
            }
        }
    }

    /// Steps 9 and 10: size orders and place what is missing
    async fn place_orders(&mut self, price: f64) -> Result<()> {
        // Paired sells first; their buy-first dependency is already
        // satisfied by the observed fill
        for (buy_level, quantity) in self.ledger.levels_needing_sell() {
            let sell_price = match self.next_level_above(buy_level) {
                Some(p) => p,
                None => {
                    warn!(
                        symbol = %self.symbol,
                        buy_level,
                        "No grid level above filled buy; sell deferred"
                    );
                    continue;
                }
            };

            match self
                .exchange
                .create_limit_sell(&self.symbol, sell_price, quantity)
                .await
            {
                Ok(id) => {
                    match self
                        .ledger
                        .register_sell(buy_level, sell_price, quantity, Some(id.clone()))
                    {
                        Ok(()) => {
                            info!(
                                symbol = %self.symbol,
                                buy_level,
                                sell_price,
                                quantity,
                                order_id = %id,
                                "Paired sell placed"
                            )
                        }
                        Err(e) => warn!(symbol = %self.symbol, error = %e, "Sell registration refused"),
                    }
                }
                Err(ExchangeError::Authentication(e)) => {
                    return Err(anyhow!("authentication failure on sell placement: {}", e));
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, sell_price, error = %e, "Sell placement failed")
                }
            }
        }

        // Step 9: per-order notional from in-flight capital plus balance
        let quote_balance = match self
            .exchange
            .get_balance(self.symbol.quote_asset())
            .await
        {
            Ok(balance) => balance,
            Err(ExchangeError::Authentication(e)) => {
                return Err(anyhow!("authentication failure on balance fetch: {}", e));
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Balance fetch failed; placement deferred");
                return Ok(());
            }
        };

        let order_value = self.config.notional_fraction
            * (self.ledger.open_buys_value() + quote_balance)
            / self.config.grid_levels_n as f64;
        if order_value <= 0.0 {
            debug!(symbol = %self.symbol, "No capital to deploy this tick");
            return Ok(());
        }

        // Step 10: place missing buys at desired levels. A level stays
        // blocked while its previous cycle's fill awaits harvesting.
        for level in self.desired(price).buys {
            if self.ledger.buy_blocked(level) {
                continue;
            }

            let quantity = self.instrument.quantize_qty(order_value / level);
            if !self.instrument.meets_min_notional(level, quantity) {
                debug!(
                    symbol = %self.symbol,
                    level,
                    quantity,
                    "Order below venue minimum notional; level skipped this tick"
                );
                continue;
            }

            match self
                .exchange
                .create_limit_buy(&self.symbol, level, quantity)
                .await
            {
                Ok(id) => match self.ledger.register_buy(level, quantity, Some(id.clone())) {
                    Ok(()) => {
                        info!(
                            symbol = %self.symbol,
                            level,
                            quantity,
                            order_id = %id,
                            "Grid buy placed"
                        )
                    }
                    Err(e) => warn!(symbol = %self.symbol, error = %e, "Buy registration refused"),
                },
                Err(ExchangeError::InsufficientFunds(e)) => {
                    warn!(
                        symbol = %self.symbol,
                        level,
                        error = %e,
                        "Insufficient funds; remaining buys wait for next tick's sizing"
                    );
                    break;
                }
                Err(ExchangeError::Authentication(e)) => {
                    return Err(anyhow!("authentication failure on buy placement: {}", e));
                }
                Err(ExchangeError::Rejected(e)) => {
                    error!(symbol = %self.symbol, level, error = %e, "Buy rejected by venue");
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, level, error = %e, "Buy placement failed");
                }
            }
        }

        Ok(())
    }

    /// Desired resting-order levels for the current price
    fn desired(&self, price: f64) -> DesiredLevels {
        desired_levels(
            price,
            &self.grid_levels,
            self.config.levels_below,
            self.config.levels_above,
            &self.instrument,
        )
    }

    /// First grid level strictly above the given level
    fn next_level_above(&self, level: f64) -> Option<f64> {
        let key = self.instrument.price_ticks(level);
        self.grid_levels
            .iter()
            .copied()
            .find(|candidate| self.instrument.price_ticks(*candidate) > key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument() -> InstrumentSpec {
        InstrumentSpec {
            price_tick: 0.0001,
            lot_size: 0.01,
            min_notional: 1.0,
        }
    }

    #[test]
    fn test_geometry_matches_cold_start_example() {
        // atr = 0.002: spacing = max(2 * 0.002, 0.012 * 0.1) = 0.004
        let levels = compute_grid_levels(0.10, 0.002, &GridConfig::default(), &instrument());

        assert_eq!(levels.len(), 20);
        assert_eq!(levels[0], 0.0800);
        assert_eq!(levels[4], 0.0960);
        assert_eq!(levels[5], 0.1000);
        assert_eq!(levels[6], 0.1040);
        assert_eq!(*levels.last().unwrap(), 0.1560);
        for pair in levels.windows(2) {
            assert!((pair[1] - pair[0] - 0.004).abs() < 1e-9);
        }
    }

    #[test]
    fn test_geometry_is_deterministic() {
        let config = GridConfig::default();
        let a = compute_grid_levels(0.10, 0.002, &config, &instrument());
        let b = compute_grid_levels(0.10, 0.002, &config, &instrument());
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_atr_uses_floor_spacing() {
        let levels = compute_grid_levels(0.10, 0.0, &GridConfig::default(), &instrument());
        // Floor spacing = 0.012 * 0.10 = 0.0012
        assert!((levels[1] - levels[0] - 0.0012).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_ticks_keep_lower_level() {
        // Coarse tick: spacing quantizes several raw levels onto one tick
        let coarse = InstrumentSpec {
            price_tick: 0.01,
            lot_size: 0.01,
            min_notional: 1.0,
        };
        let levels = compute_grid_levels(0.10, 0.001, &GridConfig::default(), &coarse);
        let mut deduped = levels.clone();
        deduped.dedup();
        assert_eq!(levels, deduped, "levels must be strictly increasing");
    }

    #[test]
    fn test_negative_levels_dropped() {
        // Price so low the lower band would go negative
        let config = GridConfig {
            levels_below: 10,
            grid_levels_n: 20,
            ..GridConfig::default()
        };
        let levels = compute_grid_levels(0.001, 0.002, &config, &instrument());
        assert!(levels.iter().all(|l| *l > 0.0));
    }
}
