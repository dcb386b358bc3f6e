//! Integration tests for the grid engine
//!
//! Drives the grid coordinator against a scripted mock exchange and
//! hand-built market buffers, covering the cold-start, fill-pairing,
//! regime-reaction, breakout-reset and stray-order flows end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use grid_engine::config::{GridConfig, RegimeConfig, RetentionConfig};
use grid_engine::exchange::{ExchangeApi, ExchangeError};
use grid_engine::grid::GridCoordinator;
use grid_engine::ledger::{ExchangeOrder, OrderState};
use grid_engine::market_data::MarketBuffers;
use grid_engine::{Candle, InstrumentSpec, Side, Symbol, TickerTick, Timeframe};

// =============================================================================
// Mock exchange
// =============================================================================

#[derive(Default)]
struct MockState {
    orders: Vec<ExchangeOrder>,
    balances: HashMap<String, f64>,
    cancelled_ids: Vec<String>,
    cancel_all_calls: Vec<Side>,
    market_sells: Vec<f64>,
}

/// Scripted venue: orders rest open until the test fills or cancels them
struct MockExchange {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl MockExchange {
    fn new(quote_balance: f64, base_balance: f64) -> Arc<Self> {
        let mut balances = HashMap::new();
        balances.insert("USDT".to_string(), quote_balance);
        balances.insert("HBAR".to_string(), base_balance);
        Arc::new(MockExchange {
            state: Mutex::new(MockState {
                balances,
                ..MockState::default()
            }),
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Mark the resting order at `price` as filled
    fn fill_order_at(&self, side: Side, price: f64) -> String {
        let mut state = self.lock();
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.side == side && (o.price - price).abs() < 1e-9 && o.state.is_live())
            .expect("no live order at price");
        order.state = OrderState::Filled;
        order.id.clone()
    }

    /// Inject an order the ledger has never seen
    fn inject_order(&self, id: &str, side: Side, price: f64, quantity: f64) {
        self.lock().orders.push(ExchangeOrder {
            id: id.to_string(),
            side,
            price,
            quantity,
            state: OrderState::Open,
        });
    }

    fn open_buy_prices(&self) -> Vec<f64> {
        let state = self.lock();
        state
            .orders
            .iter()
            .filter(|o| o.side == Side::Buy && o.state.is_live())
            .map(|o| o.price)
            .collect()
    }

    fn open_sell_orders(&self) -> Vec<ExchangeOrder> {
        let state = self.lock();
        state
            .orders
            .iter()
            .filter(|o| o.side == Side::Sell && o.state.is_live())
            .cloned()
            .collect()
    }

    fn create(&self, side: Side, price: f64, quantity: f64) -> String {
        let id = format!("ord-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().orders.push(ExchangeOrder {
            id: id.clone(),
            side,
            price,
            quantity,
            state: OrderState::Open,
        });
        id
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn create_limit_buy(
        &self,
        _symbol: &Symbol,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        Ok(self.create(Side::Buy, price, quantity))
    }

    async fn create_limit_sell(
        &self,
        _symbol: &Symbol,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        Ok(self.create(Side::Sell, price, quantity))
    }

    async fn create_market_sell(
        &self,
        symbol: &Symbol,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let mut state = self.lock();
        state.market_sells.push(quantity);
        state.balances.insert(symbol.base_asset().to_string(), 0.0);
        Ok("market-sell".to_string())
    }

    async fn cancel_order(&self, _symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.lock();
        state.cancelled_ids.push(order_id.to_string());
        match state
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.state.is_live())
        {
            Some(order) => {
                order.state = OrderState::Cancelled;
                Ok(())
            }
            None => Err(ExchangeError::UnknownOrder(order_id.to_string())),
        }
    }

    async fn cancel_all(
        &self,
        _symbol: &Symbol,
        side: Side,
    ) -> Result<Vec<String>, ExchangeError> {
        let mut state = self.lock();
        state.cancel_all_calls.push(side);
        let mut ids = Vec::new();
        for order in state.orders.iter_mut() {
            if order.side == side && order.state.is_live() {
                order.state = OrderState::Cancelled;
                ids.push(order.id.clone());
            }
        }
        Ok(ids)
    }

    async fn fetch_open_orders(
        &self,
        _symbol: &Symbol,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Ok(self
            .lock()
            .orders
            .iter()
            .filter(|o| o.state.is_live())
            .cloned()
            .collect())
    }

    async fn fetch_orders_since(
        &self,
        _symbol: &Symbol,
        _since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Ok(self.lock().orders.clone())
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        Ok(self.lock().balances.get(asset).copied().unwrap_or(0.0))
    }

    async fn fetch_candles(
        &self,
        _symbol: &Symbol,
        _timeframe: Timeframe,
        _limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        Ok(Vec::new())
    }
}

// =============================================================================
// Test utilities
// =============================================================================

fn symbol() -> Symbol {
    Symbol::new("HBAR-USDT")
}

fn instrument() -> InstrumentSpec {
    InstrumentSpec {
        price_tick: 0.0001,
        lot_size: 0.01,
        min_notional: 1.0,
    }
}

/// Thresholds loosened so synthetic monotone series classify reliably:
/// any sustained trend clears the ADX bar and no RSI gate interferes.
fn loose_regime() -> RegimeConfig {
    RegimeConfig {
        adx_threshold: 10.0,
        rsi_upper: 101.0,
        rsi_lower: -1.0,
    }
}

/// Flat candles: constant close, high-low span of 0.002 so atr14 = 0.002
fn flat_candles(timeframe: Timeframe, count: usize, close: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            Candle::from_millis(
                i as i64 * timeframe.duration_ms(),
                close,
                close + 0.001,
                close - 0.001,
                close,
                1000.0,
            )
        })
        .collect()
}

/// Steadily falling closes; classifies as downtrend under loose thresholds
fn falling_candles(timeframe: Timeframe, count: usize, start: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let close = start - 0.001 * i as f64;
            Candle::from_millis(
                i as i64 * timeframe.duration_ms(),
                close + 0.001,
                close + 0.0015,
                close - 0.0005,
                close,
                1000.0,
            )
        })
        .collect()
}

/// Steadily rising closes; classifies as uptrend under loose thresholds
fn rising_candles(timeframe: Timeframe, count: usize, start: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let close = start + 0.001 * i as f64;
            Candle::from_millis(
                i as i64 * timeframe.duration_ms(),
                close - 0.001,
                close + 0.0005,
                close - 0.0015,
                close,
                1000.0,
            )
        })
        .collect()
}

struct Harness {
    buffers: MarketBuffers,
    coordinator: GridCoordinator,
    ticker_seq: i64,
}

impl Harness {
    fn new(exchange: Arc<MockExchange>, grid: GridConfig) -> Self {
        let buffers = MarketBuffers::new(RetentionConfig::default());
        let coordinator = GridCoordinator::new(
            symbol(),
            grid,
            loose_regime(),
            instrument(),
            buffers.clone(),
            exchange as Arc<dyn ExchangeApi>,
        );
        Harness {
            buffers,
            coordinator,
            ticker_seq: 0,
        }
    }

    /// Sideways on both gate timeframes, priced at `price`
    fn with_sideways_market(exchange: Arc<MockExchange>, price: f64) -> Self {
        let harness = Self::new(exchange, GridConfig::default());
        harness
            .buffers
            .preload_candles(&symbol(), Timeframe::H1, flat_candles(Timeframe::H1, 72, price));
        harness
            .buffers
            .preload_candles(&symbol(), Timeframe::D1, flat_candles(Timeframe::D1, 60, price));
        harness
    }

    fn push_price(&mut self, price: f64) {
        self.ticker_seq += 1;
        self.buffers.append_ticker(
            &symbol(),
            TickerTick {
                event_time: Utc.timestamp_opt(self.ticker_seq, 0).unwrap(),
                last_price: price,
                best_bid: price - 0.0001,
                best_bid_qty: 100.0,
                best_ask: price + 0.0001,
                best_ask_qty: 100.0,
                volume_24h: 1_000_000.0,
            },
        );
    }

    async fn tick(&mut self) {
        self.coordinator.tick().await.expect("tick failed");
    }
}

// =============================================================================
// Scenario A: cold start in a sideways market
// =============================================================================

#[tokio::test]
async fn cold_start_places_five_buys_and_no_sells() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    harness.push_price(0.10);

    harness.tick().await;

    // Spacing = max(2 * 0.002, 0.012 * 0.10) = 0.004; five buys below,
    // and the paired sell waits for a fill
    let levels = harness.coordinator.grid_levels().to_vec();
    assert_eq!(levels.len(), 20);
    assert!(levels.contains(&0.0920));
    assert!(levels.contains(&0.0960));
    assert!(levels.contains(&0.1000));
    assert!(levels.contains(&0.1040));

    let mut buys = exchange.open_buy_prices();
    buys.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(buys, vec![0.0800, 0.0840, 0.0880, 0.0920, 0.0960]);
    assert!(exchange.open_sell_orders().is_empty());

    // Sizing: V = 0.75 * (0 + 1000) / 20 = 37.5 quote per order
    let state = exchange.lock();
    let top_buy = state
        .orders
        .iter()
        .find(|o| (o.price - 0.0960).abs() < 1e-9)
        .unwrap();
    assert!((top_buy.quantity - 390.62).abs() < 1e-9);
}

#[tokio::test]
async fn tick_is_idempotent_against_unchanged_exchange() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    harness.push_price(0.10);

    harness.tick().await;
    let after_first = exchange.lock().orders.len();

    harness.push_price(0.10);
    harness.tick().await;
    let after_second = exchange.lock().orders.len();

    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn empty_ticker_buffer_skips_tick() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    // No ticker pushed and no 1m candles: price unavailable

    harness.tick().await;

    assert!(harness.coordinator.grid_levels().is_empty());
    assert_eq!(exchange.lock().orders.len(), 0);
    assert_eq!(harness.coordinator.ticks_above_top(), 0);
}

// =============================================================================
// Scenario B: a buy fill produces its paired sell
// =============================================================================

#[tokio::test]
async fn buy_fill_places_paired_sell_one_level_above() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    harness.push_price(0.10);
    harness.tick().await;

    let filled_id = exchange.fill_order_at(Side::Buy, 0.0960);

    harness.push_price(0.10);
    harness.tick().await;

    let sells = exchange.open_sell_orders();
    assert_eq!(sells.len(), 1);
    assert!((sells[0].price - 0.1000).abs() < 1e-9);

    // Same quantity as the filled buy
    let state = exchange.lock();
    let filled = state.orders.iter().find(|o| o.id == filled_id).unwrap();
    assert!((sells[0].quantity - filled.quantity).abs() < 1e-9);
}

#[tokio::test]
async fn recycled_level_re_arms_its_paired_sell() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    harness.push_price(0.10);
    harness.tick().await;

    // First cycle: buy fills, its sell goes up one level
    exchange.fill_order_at(Side::Buy, 0.0960);
    harness.push_price(0.10);
    harness.tick().await;
    assert_eq!(exchange.open_sell_orders().len(), 1);

    // Mid-cycle the level refuses a second buy
    assert!(!exchange.open_buy_prices().contains(&0.0960));

    // Harvest completes: the level takes a fresh buy
    exchange.fill_order_at(Side::Sell, 0.1000);
    harness.push_price(0.10);
    harness.tick().await;
    assert!(exchange.open_buy_prices().contains(&0.0960));

    // Second cycle: the new fill arms a fresh sell at the same slot
    exchange.fill_order_at(Side::Buy, 0.0960);
    harness.push_price(0.10);
    harness.tick().await;
    let sells = exchange.open_sell_orders();
    assert_eq!(sells.len(), 1);
    assert!((sells[0].price - 0.1000).abs() < 1e-9);
}

// =============================================================================
// Scenario C: short-term downtrend
// =============================================================================

#[tokio::test]
async fn short_term_downtrend_cancels_buys_and_keeps_sells() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    harness.push_price(0.10);
    harness.tick().await;

    // A live sell from an earlier fill must survive the reaction
    exchange.fill_order_at(Side::Buy, 0.0960);
    harness.push_price(0.10);
    harness.tick().await;
    assert_eq!(exchange.open_sell_orders().len(), 1);

    // Hourly regime turns down while the daily stays up
    harness.buffers.preload_candles(
        &symbol(),
        Timeframe::H1,
        falling_candles(Timeframe::H1, 72, 0.17),
    );
    harness.buffers.preload_candles(
        &symbol(),
        Timeframe::D1,
        rising_candles(Timeframe::D1, 60, 0.05),
    );
    harness.push_price(0.10);
    harness.tick().await;

    assert_eq!(harness.coordinator.gates(), (true, false));
    assert!(exchange.open_buy_prices().is_empty());
    assert_eq!(exchange.open_sell_orders().len(), 1);
    assert!(exchange.lock().market_sells.is_empty());

    // Recovery tick: gate reopens, but no placements yet
    harness.buffers.preload_candles(
        &symbol(),
        Timeframe::H1,
        flat_candles(Timeframe::H1, 72, 0.10),
    );
    harness.push_price(0.10);
    let orders_before = exchange.lock().orders.len();
    harness.tick().await;
    assert_eq!(harness.coordinator.gates(), (true, true));
    assert_eq!(exchange.lock().orders.len(), orders_before);

    // The tick after recovery replaces the missing buy levels; the
    // 0.0960 slot stays blocked while its fill awaits the resting sell
    harness.push_price(0.10);
    harness.tick().await;
    assert_eq!(exchange.open_buy_prices().len(), 4);
}

// =============================================================================
// Scenario D: long-term downtrend liquidates
// =============================================================================

#[tokio::test]
async fn long_term_downtrend_flattens_everything() {
    let exchange = MockExchange::new(1000.0, 500.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    harness.push_price(0.10);
    harness.tick().await;
    assert_eq!(exchange.open_buy_prices().len(), 5);

    harness.buffers.preload_candles(
        &symbol(),
        Timeframe::D1,
        falling_candles(Timeframe::D1, 60, 0.17),
    );
    harness.push_price(0.10);
    harness.tick().await;

    assert_eq!(harness.coordinator.gates(), (false, true));
    assert!(exchange.open_buy_prices().is_empty());
    assert!(exchange.open_sell_orders().is_empty());
    assert_eq!(exchange.lock().market_sells, vec![500.0]);
    assert!(harness.coordinator.ledger().is_empty());
    assert!(harness.coordinator.grid_levels().is_empty());

    // Still down: nothing happens
    harness.push_price(0.10);
    harness.tick().await;
    assert!(exchange.open_buy_prices().is_empty());

    // Daily goes sideways: gate reopens without placements
    harness.buffers.preload_candles(
        &symbol(),
        Timeframe::D1,
        flat_candles(Timeframe::D1, 60, 0.10),
    );
    harness.push_price(0.10);
    harness.tick().await;
    assert_eq!(harness.coordinator.gates(), (true, true));
    assert!(exchange.open_buy_prices().is_empty());

    // Next tick rebuilds the grid and repopulates the buy side
    harness.push_price(0.10);
    harness.tick().await;
    assert_eq!(exchange.open_buy_prices().len(), 5);
    assert_eq!(harness.coordinator.grid_levels().len(), 20);
}

// =============================================================================
// Scenario E: breakout reset
// =============================================================================

#[tokio::test]
async fn sustained_breakout_triggers_exactly_one_reset() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let grid = GridConfig {
        reset_ticks_above_top: 3,
        ..GridConfig::default()
    };
    let mut harness = Harness::new(exchange.clone(), grid);
    harness
        .buffers
        .preload_candles(&symbol(), Timeframe::H1, flat_candles(Timeframe::H1, 72, 0.10));
    harness
        .buffers
        .preload_candles(&symbol(), Timeframe::D1, flat_candles(Timeframe::D1, 60, 0.10));
    harness.push_price(0.10);
    harness.tick().await;

    let top = *harness.coordinator.grid_levels().last().unwrap();
    assert!((top - 0.1560).abs() < 1e-9);

    // Two ticks above the top: counter runs, grid unchanged
    harness.push_price(0.1600);
    harness.tick().await;
    assert_eq!(harness.coordinator.ticks_above_top(), 1);
    harness.push_price(0.1600);
    harness.tick().await;
    assert_eq!(harness.coordinator.ticks_above_top(), 2);
    assert!((harness.coordinator.grid_levels()[5] - 0.1000).abs() < 1e-9);

    // Third consecutive tick: buys cancelled, grid rebuilt around new price
    harness.push_price(0.1600);
    harness.tick().await;
    assert_eq!(harness.coordinator.ticks_above_top(), 0);
    assert!((harness.coordinator.grid_levels()[5] - 0.1600).abs() < 1e-9);
    assert!(exchange
        .lock()
        .cancel_all_calls
        .contains(&Side::Buy));
}

#[tokio::test]
async fn dip_back_inside_grid_resets_breakout_counter() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let grid = GridConfig {
        reset_ticks_above_top: 3,
        ..GridConfig::default()
    };
    let mut harness = Harness::new(exchange.clone(), grid);
    harness
        .buffers
        .preload_candles(&symbol(), Timeframe::H1, flat_candles(Timeframe::H1, 72, 0.10));
    harness
        .buffers
        .preload_candles(&symbol(), Timeframe::D1, flat_candles(Timeframe::D1, 60, 0.10));
    harness.push_price(0.10);
    harness.tick().await;

    harness.push_price(0.1600);
    harness.tick().await;
    harness.push_price(0.1600);
    harness.tick().await;
    assert_eq!(harness.coordinator.ticks_above_top(), 2);

    // First tick not strictly above the top resets the counter
    harness.push_price(0.1000);
    harness.tick().await;
    assert_eq!(harness.coordinator.ticks_above_top(), 0);
}

// =============================================================================
// Scenario F: stray order cancellation
// =============================================================================

#[tokio::test]
async fn stray_buy_is_cancelled_and_stray_sell_left_alone() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    harness.push_price(0.10);
    harness.tick().await;
    // Second tick settles freshly placed orders to their observed state
    harness.push_price(0.10);
    harness.tick().await;

    exchange.inject_order("manual-buy", Side::Buy, 0.0970, 50.0);
    exchange.inject_order("manual-sell", Side::Sell, 0.1100, 50.0);
    let ledger_before = harness.coordinator.ledger().snapshot();

    harness.push_price(0.10);
    harness.tick().await;

    let state = exchange.lock();
    assert!(state.cancelled_ids.contains(&"manual-buy".to_string()));
    assert!(!state.cancelled_ids.contains(&"manual-sell".to_string()));
    drop(state);

    // The stray never entered the ledger
    assert_eq!(harness.coordinator.ledger().snapshot(), ledger_before);

    // Next reconcile sees the stray gone
    harness.push_price(0.10);
    harness.tick().await;
    assert!(!exchange.open_buy_prices().contains(&0.0970));
}

// =============================================================================
// Invariant recovery
// =============================================================================

#[tokio::test]
async fn doubled_exchange_buy_flattens_buy_side_and_rebuilds() {
    let exchange = MockExchange::new(1000.0, 0.0);
    let mut harness = Harness::with_sideways_market(exchange.clone(), 0.10);
    harness.push_price(0.10);
    harness.tick().await;

    // Two live buys on one level violates the one-per-side invariant
    exchange.inject_order("dup-1", Side::Buy, 0.0970, 50.0);
    exchange.inject_order("dup-2", Side::Buy, 0.0970, 50.0);

    harness.push_price(0.10);
    harness.tick().await;

    assert!(harness.coordinator.ledger().is_empty());
    assert!(exchange.open_buy_prices().is_empty());

    // Following ticks rebuild the buy side from scratch
    harness.push_price(0.10);
    harness.tick().await;
    assert_eq!(exchange.open_buy_prices().len(), 5);
}
