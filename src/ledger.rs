//! In-memory order ledger
//!
//! Mirror of intended and observed orders keyed by quantized grid level.
//! The exchange stays authoritative: `observe` merges its view into the
//! mirror each tick and reports strays for cancellation. Each level holds
//! at most one buy and one sell; the paired sell lives on its buy's entry
//! and carries its own (higher) price.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{InstrumentSpec, Side};

/// Price level identity: whole venue ticks
pub type LevelKey = i64;

/// Order lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
    Unknown,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }

    /// Non-terminal states count against the one-live-order-per-side cap
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// An order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub id: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub state: OrderState,
}

/// One side of a ledger entry
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOrder {
    pub id: Option<String>,
    pub state: OrderState,
    pub price: f64,
    pub quantity: f64,
    /// Reconciliation-in-flight flag; a locked side is skipped by the
    /// placement step until `observe` resolves it
    pub locked: bool,
}

impl TrackedOrder {
    fn new(id: Option<String>, price: f64, quantity: f64) -> Self {
        TrackedOrder {
            id,
            state: OrderState::Pending,
            price,
            quantity,
            locked: true,
        }
    }
}

/// Per-level pair of tracked orders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelEntry {
    pub buy: Option<TrackedOrder>,
    pub sell: Option<TrackedOrder>,
}

impl LevelEntry {
    fn is_inactive(&self) -> bool {
        let side_done = |o: &Option<TrackedOrder>| match o {
            Some(t) => t.state.is_terminal(),
            None => true,
        };
        side_done(&self.buy) && side_done(&self.sell)
    }
}

/// Levels the coordinator wants resting orders at for a given price
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredLevels {
    /// Buy-side levels strictly below the price, closest first
    pub buys: Vec<f64>,
    /// Sell-side slots strictly above the price, closest first
    pub sells: Vec<f64>,
}

impl DesiredLevels {
    pub fn all(&self) -> Vec<f64> {
        self.buys.iter().chain(self.sells.iter()).copied().collect()
    }
}

/// Select the grid levels eligible for resting orders: `below` levels
/// strictly beneath the current price and `above` levels strictly over
/// it. Strictness is judged in whole venue ticks.
pub fn desired_levels(
    current_price: f64,
    grid_levels: &[f64],
    below: usize,
    above: usize,
    instrument: &InstrumentSpec,
) -> DesiredLevels {
    let price_key = instrument.price_ticks(current_price);
    let buys = grid_levels
        .iter()
        .copied()
        .filter(|level| instrument.price_ticks(*level) < price_key)
        .rev()
        .take(below)
        .collect();
    let sells = grid_levels
        .iter()
        .copied()
        .filter(|level| instrument.price_ticks(*level) > price_key)
        .take(above)
        .collect();
    DesiredLevels { buys, sells }
}

/// Result of merging the exchange view into the ledger
#[derive(Debug, Default)]
pub struct ObserveReport {
    /// Live exchange orders with no matching ledger entry
    pub strays: Vec<ExchangeOrder>,
    /// Buy levels whose order reached `filled` during this merge
    pub newly_filled_buys: Vec<f64>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("live {side} order already tracked at level {price}")]
    DuplicateLiveOrder { side: Side, price: f64 },

    #[error("sell registration at level {price} requires a filled buy")]
    SellBeforeBuyFill { price: f64 },

    #[error("level {price} has an unharvested filled buy")]
    UnharvestedFill { price: f64 },

    #[error("exchange reports {count} live {side} orders at level {price}")]
    InvariantViolation {
        side: Side,
        price: f64,
        count: usize,
    },
}

/// Ledger of tracked orders for one symbol
#[derive(Debug)]
pub struct OrderLedger {
    instrument: InstrumentSpec,
    levels: BTreeMap<LevelKey, LevelEntry>,
}

impl OrderLedger {
    pub fn new(instrument: InstrumentSpec) -> Self {
        OrderLedger {
            instrument,
            levels: BTreeMap::new(),
        }
    }

    pub fn key(&self, price: f64) -> LevelKey {
        self.instrument.price_ticks(price)
    }

    pub fn level_price(&self, key: LevelKey) -> f64 {
        self.instrument
            .quantize_price(key as f64 * self.instrument.price_tick)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Track a freshly placed buy at its grid level
    ///
    /// A level runs one cycle at a time: while a filled buy is still
    /// waiting for its paired sell to complete, the level refuses a new
    /// buy. Starting a fresh cycle drops the previous cycle's settled
    /// sell so the next fill re-arms its own.
    pub fn register_buy(
        &mut self,
        level_price: f64,
        quantity: f64,
        order_id: Option<String>,
    ) -> Result<(), LedgerError> {
        let key = self.key(level_price);
        let entry = self.levels.entry(key).or_default();

        if let Some(buy) = &entry.buy {
            if buy.state.is_live() {
                return Err(LedgerError::DuplicateLiveOrder {
                    side: Side::Buy,
                    price: level_price,
                });
            }
            if buy.state == OrderState::Filled {
                let harvested =
                    matches!(&entry.sell, Some(sell) if sell.state == OrderState::Filled);
                if !harvested {
                    return Err(LedgerError::UnharvestedFill { price: level_price });
                }
            }
        }

        entry.sell = None;
        entry.buy = Some(TrackedOrder::new(order_id, level_price, quantity));
        Ok(())
    }

    /// Track the paired sell for a filled buy
    ///
    /// The sell lives on the buy's entry and carries the higher sell price.
    pub fn register_sell(
        &mut self,
        buy_level_price: f64,
        sell_price: f64,
        quantity: f64,
        order_id: Option<String>,
    ) -> Result<(), LedgerError> {
        let key = self.key(buy_level_price);
        let entry = self
            .levels
            .get_mut(&key)
            .ok_or(LedgerError::SellBeforeBuyFill {
                price: buy_level_price,
            })?;

        match &entry.buy {
            Some(buy) if buy.state == OrderState::Filled => {}
            _ => {
                return Err(LedgerError::SellBeforeBuyFill {
                    price: buy_level_price,
                })
            }
        }

        if let Some(sell) = &entry.sell {
            if sell.state.is_live() {
                return Err(LedgerError::DuplicateLiveOrder {
                    side: Side::Sell,
                    price: sell_price,
                });
            }
        }

        entry.sell = Some(TrackedOrder::new(order_id, sell_price, quantity));
        Ok(())
    }

    /// Merge the exchange's authoritative order list into the ledger
    ///
    /// Matching is by order id first, then by (side, price within tick)
    /// for tracked orders that never received an id. Tracked orders absent
    /// from the exchange view degrade Pending -> Unknown on the first miss
    /// and Open/Unknown -> Cancelled after that, so a lost order always
    /// converges to a terminal state. Live exchange orders that match
    /// nothing are reported as strays.
    pub fn observe(&mut self, exchange_orders: &[ExchangeOrder]) -> Result<ObserveReport, LedgerError> {
        self.check_exchange_invariant(exchange_orders)?;

        let mut report = ObserveReport::default();
        let mut matched: Vec<&str> = Vec::new();

        for entry in self.levels.values_mut() {
            for side in [Side::Buy, Side::Sell] {
                let tracked = match side {
                    Side::Buy => &mut entry.buy,
                    Side::Sell => &mut entry.sell,
                };
                let Some(order) = tracked else { continue };
                if order.state.is_terminal() {
                    continue;
                }

                let found = exchange_orders.iter().find(|ex| {
                    match &order.id {
                        Some(id) => &ex.id == id,
                        // Adopt by (side, level) when the placement never
                        // returned an id
                        None => {
                            ex.side == side
                                && self.instrument.same_level(ex.price, order.price)
                                && ex.state.is_live()
                        }
                    }
                });

                match found {
                    Some(ex) => {
                        if order.id.is_none() {
                            order.id = Some(ex.id.clone());
                        }
                        matched.push(ex.id.as_str());
                        if ex.state == OrderState::Filled
                            && order.state != OrderState::Filled
                            && side == Side::Buy
                        {
                            report.newly_filled_buys.push(order.price);
                        }
                        order.state = ex.state;
                        order.locked = false;
                    }
                    None => {
                        order.state = match order.state {
                            OrderState::Pending => OrderState::Unknown,
                            _ => OrderState::Cancelled,
                        };
                        order.locked = false;
                    }
                }
            }
        }

        for ex in exchange_orders {
            if ex.state.is_live() && !matched.contains(&ex.id.as_str()) {
                report.strays.push(ex.clone());
            }
        }

        Ok(report)
    }

    fn check_exchange_invariant(&self, exchange_orders: &[ExchangeOrder]) -> Result<(), LedgerError> {
        let mut live: HashMap<(Side, LevelKey), usize> = HashMap::new();
        for ex in exchange_orders {
            if ex.state.is_live() {
                *live.entry((ex.side, self.key(ex.price))).or_default() += 1;
            }
        }
        for ((side, key), count) in live {
            if count > 1 {
                return Err(LedgerError::InvariantViolation {
                    side,
                    price: self.level_price(key),
                    count,
                });
            }
        }
        Ok(())
    }

    /// Remove entries whose both sides are settled and whose level has
    /// left the desired set
    pub fn prune_inactive(&mut self, desired_levels: &[f64]) {
        let desired: Vec<LevelKey> = desired_levels.iter().map(|p| self.key(*p)).collect();
        self.levels
            .retain(|key, entry| desired.contains(key) || !entry.is_inactive());
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// True while a non-terminal buy is tracked at the level
    pub fn has_live_buy(&self, level_price: f64) -> bool {
        self.levels
            .get(&self.key(level_price))
            .and_then(|e| e.buy.as_ref())
            .map(|b| b.state.is_live())
            .unwrap_or(false)
    }

    /// True while the level cannot take a new buy: a live buy is resting,
    /// or a filled buy is still waiting for its paired sell to fill
    pub fn buy_blocked(&self, level_price: f64) -> bool {
        let Some(entry) = self.levels.get(&self.key(level_price)) else {
            return false;
        };
        match &entry.buy {
            Some(buy) if buy.state.is_live() => true,
            Some(buy) if buy.state == OrderState::Filled => {
                !matches!(&entry.sell, Some(sell) if sell.state == OrderState::Filled)
            }
            _ => false,
        }
    }

    pub fn buy_locked(&self, level_price: f64) -> bool {
        self.levels
            .get(&self.key(level_price))
            .and_then(|e| e.buy.as_ref())
            .map(|b| b.locked)
            .unwrap_or(false)
    }

    /// Buy levels that filled and still need their paired sell
    pub fn levels_needing_sell(&self) -> Vec<(f64, f64)> {
        self.levels
            .values()
            .filter_map(|entry| {
                let buy = entry.buy.as_ref()?;
                if buy.state != OrderState::Filled {
                    return None;
                }
                let sell_open = match &entry.sell {
                    Some(sell) => sell.state.is_live() || sell.state == OrderState::Filled,
                    None => false,
                };
                if sell_open {
                    None
                } else {
                    Some((buy.price, buy.quantity))
                }
            })
            .collect()
    }

    /// Total notional of live tracked buys
    pub fn open_buys_value(&self) -> f64 {
        self.levels
            .values()
            .filter_map(|e| e.buy.as_ref())
            .filter(|b| b.state.is_live())
            .map(|b| b.price * b.quantity)
            .sum()
    }

    /// Owned copy of the ledger contents, ordered by level
    pub fn snapshot(&self) -> Vec<(f64, LevelEntry)> {
        self.levels
            .iter()
            .map(|(key, entry)| (self.level_price(*key), entry.clone()))
            .collect()
    }

    /// Project tracked live orders as the exchange would report them
    ///
    /// `observe(as_exchange_view())` is a no-op by construction.
    pub fn as_exchange_view(&self) -> Vec<ExchangeOrder> {
        self.levels
            .values()
            .flat_map(|entry| {
                [(Side::Buy, &entry.buy), (Side::Sell, &entry.sell)]
                    .into_iter()
                    .filter_map(move |(side, tracked)| {
                        let order = tracked.as_ref()?;
                        let id = order.id.clone()?;
                        order.state.is_live().then(|| ExchangeOrder {
                            id,
                            side,
                            price: order.price,
                            quantity: order.quantity,
                            state: order.state,
                        })
                    })
            })
            .collect()
    }
}
