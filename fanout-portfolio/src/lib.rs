//! Portfolio accounting: orders, realised fills, and rolling net positions.
//!
//! Positions are keyed by (account, symbol) and carry a signed net
//! quantity. Reducing fills realise PnL against the average entry price;
//! fills that cross through zero re-open the residual at the fill price.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use uuid::Uuid;

use fanout_core::{AccountId, Order, OrderId, OrderState, Position, Price, Side, Symbol, Trade};

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),
    #[error("fill quantity must be positive")]
    BadQuantity,
}

/// In-memory projection of orders, trades, and positions.
#[derive(Default)]
pub struct PortfolioLedger {
    orders: RwLock<HashMap<OrderId, Order>>,
    trades: RwLock<Vec<Trade>>,
    positions: RwLock<HashMap<(AccountId, Symbol), Position>>,
}

impl PortfolioLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an order produced by an execution run.
    pub fn record_order(&self, order: Order) {
        self.orders.write().insert(order.id, order);
    }

    #[must_use]
    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.read().get(&order_id).cloned()
    }

    #[must_use]
    pub fn orders_for_account(&self, account_id: AccountId) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .values()
            .filter(|order| order.account_id == account_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    #[must_use]
    pub fn all_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.read().values().cloned().collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    /// Mark a tracked order cancelled and return the updated record.
    pub fn mark_order_cancelled(&self, order_id: OrderId) -> LedgerResult<Order> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(&order_id)
            .ok_or(LedgerError::UnknownOrder(order_id))?;
        order.state = OrderState::Cancelled;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    /// Apply a realised fill against a tracked order. Returns the trade with
    /// its realised PnL contribution.
    pub fn apply_fill(
        &self,
        order_id: OrderId,
        quantity: i64,
        price: Price,
        timestamp: DateTime<Utc>,
    ) -> LedgerResult<Trade> {
        if quantity <= 0 {
            return Err(LedgerError::BadQuantity);
        }
        let (account_id, symbol, side) = {
            let mut orders = self.orders.write();
            let order = orders
                .get_mut(&order_id)
                .ok_or(LedgerError::UnknownOrder(order_id))?;
            order.state = OrderState::Filled;
            order.updated_at = timestamp;
            (order.account_id, order.symbol.clone(), order.side)
        };

        let realized = self.update_position(account_id, &symbol, side, quantity, price, timestamp);
        let trade = Trade {
            id: Uuid::new_v4(),
            order_id,
            account_id,
            symbol,
            side,
            quantity,
            price,
            realized_pnl: realized,
            timestamp,
        };
        self.trades.write().push(trade.clone());
        Ok(trade)
    }

    fn update_position(
        &self,
        account_id: AccountId,
        symbol: &str,
        side: Side,
        quantity: i64,
        price: Price,
        timestamp: DateTime<Utc>,
    ) -> Price {
        let mut positions = self.positions.write();
        let entry = positions
            .entry((account_id, symbol.to_string()))
            .or_insert(Position {
                account_id,
                symbol: symbol.to_string(),
                net_qty: 0,
                avg_price: Decimal::ZERO,
                realized_pnl: Decimal::ZERO,
                unrealized_pnl: Decimal::ZERO,
                updated_at: timestamp,
            });

        let signed = quantity * i64::from(side.as_i8());
        let mut realized = Decimal::ZERO;

        if entry.net_qty == 0 || entry.net_qty.signum() == signed.signum() {
            // Opening or adding: weighted average entry.
            let prev_cost = entry.avg_price * Decimal::from(entry.net_qty.abs());
            let add_cost = price * Decimal::from(quantity);
            let total = entry.net_qty.abs() + quantity;
            entry.avg_price = (prev_cost + add_cost) / Decimal::from(total);
            entry.net_qty += signed;
        } else {
            // Reducing (possibly crossing zero).
            let closing = entry.net_qty.abs().min(quantity);
            let direction = Decimal::from(entry.net_qty.signum());
            realized = (price - entry.avg_price) * Decimal::from(closing) * direction;
            entry.realized_pnl += realized;
            let residual = entry.net_qty + signed;
            if residual == 0 {
                entry.net_qty = 0;
                entry.avg_price = Decimal::ZERO;
                entry.unrealized_pnl = Decimal::ZERO;
            } else if residual.signum() == entry.net_qty.signum() {
                entry.net_qty = residual;
            } else {
                entry.net_qty = residual;
                entry.avg_price = price;
            }
        }
        entry.updated_at = timestamp;
        realized
    }

    /// Refresh unrealised PnL for every position in `symbol`.
    pub fn mark_price(&self, symbol: &str, price: Price) {
        let mut positions = self.positions.write();
        for ((_, sym), position) in positions.iter_mut() {
            if sym == symbol {
                position.mark_price(price);
            }
        }
    }

    #[must_use]
    pub fn position(&self, account_id: AccountId, symbol: &str) -> Option<Position> {
        self.positions
            .read()
            .get(&(account_id, symbol.to_string()))
            .cloned()
    }

    /// Positions with a non-zero net quantity.
    #[must_use]
    pub fn open_positions(&self) -> Vec<Position> {
        let mut open: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|position| position.net_qty != 0)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        open
    }

    #[must_use]
    pub fn trades(&self) -> Vec<Trade> {
        self.trades.read().clone()
    }

    #[must_use]
    pub fn trades_since(&self, since: DateTime<Utc>) -> Vec<Trade> {
        self.trades
            .read()
            .iter()
            .filter(|trade| trade.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Sum of realised PnL across all recorded trades.
    #[must_use]
    pub fn realized_pnl(&self) -> Price {
        self.trades
            .read()
            .iter()
            .map(|trade| trade.realized_pnl)
            .sum()
    }

    /// Sum of unrealised PnL across open positions.
    #[must_use]
    pub fn unrealized_pnl(&self) -> Price {
        self.positions
            .read()
            .values()
            .map(|position| position.unrealized_pnl)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::OrderType;

    fn order(account_id: AccountId, side: Side) -> Order {
        Order {
            id: Uuid::new_v4(),
            account_id,
            strategy_id: None,
            run_id: None,
            broker_order_id: None,
            symbol: "NIFTY24AUGFUT".into(),
            side,
            quantity: 100,
            order_type: OrderType::Market,
            price: None,
            take_profit: None,
            stop_loss: None,
            state: OrderState::Accepted,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn buys_accumulate_weighted_average() {
        let ledger = PortfolioLedger::new();
        let account = Uuid::new_v4();
        let first = order(account, Side::Buy);
        let second = order(account, Side::Buy);
        ledger.record_order(first.clone());
        ledger.record_order(second.clone());

        ledger
            .apply_fill(first.id, 100, Decimal::from(200), Utc::now())
            .unwrap();
        ledger
            .apply_fill(second.id, 100, Decimal::from(210), Utc::now())
            .unwrap();

        let position = ledger.position(account, "NIFTY24AUGFUT").unwrap();
        assert_eq!(position.net_qty, 200);
        assert_eq!(position.avg_price, Decimal::from(205));
    }

    #[test]
    fn reducing_fill_realises_pnl() {
        let ledger = PortfolioLedger::new();
        let account = Uuid::new_v4();
        let buy = order(account, Side::Buy);
        let sell = order(account, Side::Sell);
        ledger.record_order(buy.clone());
        ledger.record_order(sell.clone());

        ledger
            .apply_fill(buy.id, 100, Decimal::from(200), Utc::now())
            .unwrap();
        let trade = ledger
            .apply_fill(sell.id, 40, Decimal::from(215), Utc::now())
            .unwrap();

        assert_eq!(trade.realized_pnl, Decimal::from(600));
        let position = ledger.position(account, "NIFTY24AUGFUT").unwrap();
        assert_eq!(position.net_qty, 60);
        assert_eq!(position.avg_price, Decimal::from(200));
        assert_eq!(ledger.realized_pnl(), Decimal::from(600));
    }

    #[test]
    fn crossing_zero_reopens_at_fill_price() {
        let ledger = PortfolioLedger::new();
        let account = Uuid::new_v4();
        let buy = order(account, Side::Buy);
        let sell = order(account, Side::Sell);
        ledger.record_order(buy.clone());
        ledger.record_order(sell.clone());

        ledger
            .apply_fill(buy.id, 50, Decimal::from(200), Utc::now())
            .unwrap();
        let trade = ledger
            .apply_fill(sell.id, 80, Decimal::from(190), Utc::now())
            .unwrap();

        // 50 closed at a 10-point loss; 30 reopened short at 190.
        assert_eq!(trade.realized_pnl, Decimal::from(-500));
        let position = ledger.position(account, "NIFTY24AUGFUT").unwrap();
        assert_eq!(position.net_qty, -30);
        assert_eq!(position.avg_price, Decimal::from(190));
    }

    #[test]
    fn flat_position_drops_out_of_open_set() {
        let ledger = PortfolioLedger::new();
        let account = Uuid::new_v4();
        let buy = order(account, Side::Buy);
        let sell = order(account, Side::Sell);
        ledger.record_order(buy.clone());
        ledger.record_order(sell.clone());

        ledger
            .apply_fill(buy.id, 50, Decimal::from(100), Utc::now())
            .unwrap();
        ledger
            .apply_fill(sell.id, 50, Decimal::from(110), Utc::now())
            .unwrap();

        assert!(ledger.open_positions().is_empty());
        assert_eq!(ledger.realized_pnl(), Decimal::from(500));
    }

    #[test]
    fn mark_price_updates_unrealized() {
        let ledger = PortfolioLedger::new();
        let account = Uuid::new_v4();
        let buy = order(account, Side::Buy);
        ledger.record_order(buy.clone());
        ledger
            .apply_fill(buy.id, 100, Decimal::from(200), Utc::now())
            .unwrap();

        ledger.mark_price("NIFTY24AUGFUT", Decimal::from(204));
        assert_eq!(ledger.unrealized_pnl(), Decimal::from(400));
    }

    #[test]
    fn unknown_order_is_an_error() {
        let ledger = PortfolioLedger::new();
        assert!(matches!(
            ledger.apply_fill(Uuid::new_v4(), 1, Decimal::ONE, Utc::now()),
            Err(LedgerError::UnknownOrder(_))
        ));
    }
}
