//! Dry-run simulated order book
//!
//! Backs the gateway when venue mutations are suppressed. Order ids are
//! deterministic (`dryrun:{side}:{price}:{qty}`) so repeated runs against
//! identical inputs produce identical ledgers. Balances come from
//! configured fixtures.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::ledger::{ExchangeOrder, OrderState};
use crate::{Side, Symbol};

use super::ExchangeError;

#[derive(Default)]
pub struct SimBook {
    orders: Mutex<HashMap<Symbol, Vec<ExchangeOrder>>>,
    balances: Mutex<HashMap<String, f64>>,
}

impl SimBook {
    pub fn new(balances: HashMap<String, f64>) -> Self {
        SimBook {
            orders: Mutex::new(HashMap::new()),
            balances: Mutex::new(
                balances
                    .into_iter()
                    .map(|(k, v)| (k.to_uppercase(), v))
                    .collect(),
            ),
        }
    }

    fn order_id(side: Side, price: f64, quantity: f64) -> String {
        format!("dryrun:{}:{}:{}", side, price, quantity)
    }

    pub fn create_limit(
        &self,
        symbol: &Symbol,
        side: Side,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let id = Self::order_id(side, price, quantity);
        let mut orders = self.orders.lock().expect("sim book lock poisoned");
        let book = orders.entry(symbol.clone()).or_default();

        // Re-placing the same deterministic order is a no-op
        if !book.iter().any(|o| o.id == id && o.state.is_live()) {
            book.push(ExchangeOrder {
                id: id.clone(),
                side,
                price,
                quantity,
                state: OrderState::Open,
            });
        }
        Ok(id)
    }

    pub fn create_market_sell(
        &self,
        symbol: &Symbol,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let id = Self::order_id(Side::Sell, 0.0, quantity);
        let mut balances = self.balances.lock().expect("sim balances lock poisoned");
        balances.insert(symbol.base_asset().to_uppercase(), 0.0);
        Ok(id)
    }

    pub fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
        let mut orders = self.orders.lock().expect("sim book lock poisoned");
        let book = orders.entry(symbol.clone()).or_default();
        match book
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

    pub fn cancel_all(&self, symbol: &Symbol, side: Side) -> Result<Vec<String>, ExchangeError> {
        let mut orders = self.orders.lock().expect("sim book lock poisoned");
        let book = orders.entry(symbol.clone()).or_default();
        let mut cancelled = Vec::new();
        for order in book.iter_mut() {
            if order.side == side && order.state.is_live() {
                order.state = OrderState::Cancelled;
                cancelled.push(order.id.clone());
            }
        }
        Ok(cancelled)
    }

    pub fn open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let orders = self.orders.lock().expect("sim book lock poisoned");
        Ok(orders
            .get(symbol)
            .map(|book| {
                book.iter()
                    .filter(|o| o.state.is_live())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn orders_since(
        &self,
        symbol: &Symbol,
        _since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let orders = self.orders.lock().expect("sim book lock poisoned");
        Ok(orders.get(symbol).cloned().unwrap_or_default())
    }

    pub fn balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let balances = self.balances.lock().expect("sim balances lock poisoned");
        Ok(balances.get(&asset.to_uppercase()).copied().unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_placement_is_idempotent() {
        let sim = SimBook::new(HashMap::new());
        let symbol = Symbol::new("HBAR-USDT");

        let a = sim.create_limit(&symbol, Side::Buy, 0.096, 104.0).unwrap();
        let b = sim.create_limit(&symbol, Side::Buy, 0.096, 104.0).unwrap();
        assert_eq!(a, b);
        assert_eq!(sim.open_orders(&symbol).unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_all_only_hits_one_side() {
        let sim = SimBook::new(HashMap::new());
        let symbol = Symbol::new("HBAR-USDT");

        sim.create_limit(&symbol, Side::Buy, 0.096, 104.0).unwrap();
        sim.create_limit(&symbol, Side::Buy, 0.092, 104.0).unwrap();
        sim.create_limit(&symbol, Side::Sell, 0.104, 104.0).unwrap();

        let cancelled = sim.cancel_all(&symbol, Side::Buy).unwrap();
        assert_eq!(cancelled.len(), 2);

        let open = sim.open_orders(&symbol).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Sell);
    }

    #[test]
    fn test_market_sell_zeroes_base_balance() {
        let sim = SimBook::new(HashMap::from([("HBAR".to_string(), 500.0)]));
        let symbol = Symbol::new("HBAR-USDT");

        assert_eq!(sim.balance("HBAR").unwrap(), 500.0);
        sim.create_market_sell(&symbol, 500.0).unwrap();
        assert_eq!(sim.balance("HBAR").unwrap(), 0.0);
    }
}
