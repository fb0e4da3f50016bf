//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod allocation;
mod events;
mod latency;
pub mod wire;

pub use allocation::{Allocation, AllocationSlice, PolicyTrace};
pub use events::{ExecutionEvent, ExecutionRun, LegStatus, RunStatus};
pub use latency::{percentile, LatencySummary};

/// Alias for price precision.
pub type Price = Decimal;
/// Integer lot count; `quantity = lots * lot_size`.
pub type Lots = u32;
/// Alias used for human-readable market symbols (e.g., `NIFTY24AUGFUT`).
pub type Symbol = String;

/// Opaque 128-bit identifiers for the main entities.
pub type UserId = Uuid;
pub type LinkId = Uuid;
pub type AccountId = Uuid;
pub type GroupId = Uuid;
pub type MappingId = Uuid;
pub type RunId = Uuid;
pub type OrderId = Uuid;
pub type TradeId = Uuid;
pub type StrategyId = Uuid;
pub type StrategyRunId = Uuid;
pub type JobId = Uuid;
pub type ConnectorId = Uuid;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed direction used when netting position quantity.
    #[must_use]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Execute immediately at best available price.
    Market,
    /// Execute at the provided limit price.
    Limit,
}

/// How the legs of a group order are released to brokers.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// All legs dispatched concurrently.
    #[default]
    Parallel,
    /// Legs dispatched strictly in allocation order; a failure aborts the rest.
    Sync,
    /// Concurrent dispatch with a configured inter-leg release delay.
    Staggered,
}

/// Lot-split policy attached to an account inside an execution group.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    Proportional,
    Weighted,
    Fixed,
}

/// Binds one broker account into an execution group.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GroupAccountMapping {
    pub id: MappingId,
    pub account_id: AccountId,
    pub link_id: LinkId,
    pub policy: AllocationPolicy,
    pub weight: Option<Decimal>,
    pub fixed_lots: Option<Lots>,
}

impl GroupAccountMapping {
    /// Check the policy-specific field constraints.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self.policy {
            AllocationPolicy::Weighted => match self.weight {
                Some(w) if w > Decimal::ZERO => Ok(()),
                _ => Err(DomainError::InvalidMapping(
                    "weighted mapping requires weight > 0".into(),
                )),
            },
            AllocationPolicy::Fixed => match self.fixed_lots {
                Some(lots) if lots > 0 => Ok(()),
                _ => Err(DomainError::InvalidMapping(
                    "fixed mapping requires fixed_lots >= 1".into(),
                )),
            },
            AllocationPolicy::Proportional => Ok(()),
        }
    }
}

/// A named fan-out target owning an ordered set of account mappings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecutionGroup {
    pub id: GroupId,
    pub user_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub mode: ExecutionMode,
    pub mappings: Vec<GroupAccountMapping>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionGroup {
    /// Validate every mapping and the at-most-once-per-account invariant.
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut seen = Vec::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            mapping.validate()?;
            if seen.contains(&mapping.account_id) {
                return Err(DomainError::InvalidMapping(format!(
                    "account {} appears more than once in group {}",
                    mapping.account_id, self.id
                )));
            }
            seen.push(mapping.account_id);
        }
        Ok(())
    }
}

/// A single logical order before fan-out: what to trade, how much, and how.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradeIntent {
    pub symbol: Symbol,
    pub side: Side,
    pub total_lots: Lots,
    pub lot_size: Lots,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub stop_loss: Option<Price>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub symbol_token: Option<String>,
}

impl TradeIntent {
    /// Total tradable quantity represented by the intent.
    #[must_use]
    pub fn quantity(&self) -> i64 {
        i64::from(self.total_lots) * i64::from(self.lot_size)
    }

    /// Reject obviously malformed intents before any planning happens.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.symbol.trim().is_empty() {
            return Err(DomainError::InvalidIntent("symbol must not be empty".into()));
        }
        if self.total_lots == 0 {
            return Err(DomainError::InvalidIntent("total_lots must be >= 1".into()));
        }
        if self.lot_size == 0 {
            return Err(DomainError::InvalidIntent("lot_size must be >= 1".into()));
        }
        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err(DomainError::InvalidIntent(
                "limit orders require a price".into(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a broker-side order as tracked locally.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Accepted,
    Filled,
    Cancelled,
    Rejected,
}

/// Order representation persisted alongside its execution run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub strategy_id: Option<StrategyId>,
    pub run_id: Option<RunId>,
    pub broker_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: i64,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Realised fill attached to an order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Trade {
    pub id: TradeId,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: i64,
    pub price: Price,
    pub realized_pnl: Price,
    pub timestamp: DateTime<Utc>,
}

/// Rolling net position for an (account, symbol) pair, materialised from trades.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub net_qty: i64,
    pub avg_price: Price,
    pub realized_pnl: Price,
    pub unrealized_pnl: Price,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Refresh unrealised PnL against the latest mark price.
    pub fn mark_price(&mut self, price: Price) {
        if self.net_qty != 0 {
            let qty = Decimal::from(self.net_qty);
            self.unrealized_pnl = (price - self.avg_price) * qty;
        } else {
            self.unrealized_pnl = Decimal::ZERO;
        }
        self.updated_at = Utc::now();
    }
}

/// Validation failures raised by the domain types themselves.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("invalid trade intent: {0}")]
    InvalidIntent(String),
    #[error("invalid group mapping: {0}")]
    InvalidMapping(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(lots: Lots, lot_size: Lots) -> TradeIntent {
        TradeIntent {
            symbol: "NIFTY24AUGFUT".into(),
            side: Side::Buy,
            total_lots: lots,
            lot_size,
            order_type: OrderType::Market,
            price: None,
            take_profit: None,
            stop_loss: None,
            exchange: None,
            symbol_token: None,
        }
    }

    #[test]
    fn intent_quantity_multiplies_lots_by_lot_size() {
        assert_eq!(intent(10, 25).quantity(), 250);
    }

    #[test]
    fn zero_lot_intent_is_rejected() {
        assert!(intent(0, 25).validate().is_err());
        assert!(intent(10, 0).validate().is_err());
        assert!(intent(10, 25).validate().is_ok());
    }

    #[test]
    fn limit_intent_requires_price() {
        let mut limit = intent(1, 1);
        limit.order_type = OrderType::Limit;
        assert!(limit.validate().is_err());
        limit.price = Some(Decimal::from(101));
        assert!(limit.validate().is_ok());
    }

    #[test]
    fn weighted_mapping_requires_positive_weight() {
        let mapping = GroupAccountMapping {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            link_id: Uuid::new_v4(),
            policy: AllocationPolicy::Weighted,
            weight: Some(Decimal::ZERO),
            fixed_lots: None,
        };
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn duplicate_account_in_group_is_rejected() {
        let account = Uuid::new_v4();
        let mapping = |acct| GroupAccountMapping {
            id: Uuid::new_v4(),
            account_id: acct,
            link_id: Uuid::new_v4(),
            policy: AllocationPolicy::Proportional,
            weight: None,
            fixed_lots: None,
        };
        let group = ExecutionGroup {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "primary".into(),
            description: None,
            mode: ExecutionMode::Parallel,
            mappings: vec![mapping(account), mapping(account)],
            created_at: Utc::now(),
        };
        assert!(group.validate().is_err());
    }

    #[test]
    fn position_mark_price_updates_unrealized_pnl() {
        let mut position = Position {
            account_id: Uuid::new_v4(),
            symbol: "NIFTY24AUGFUT".into(),
            net_qty: 50,
            avg_price: Decimal::from(200),
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            updated_at: Utc::now(),
        };
        position.mark_price(Decimal::from(210));
        assert_eq!(position.unrealized_pnl, Decimal::from(500));
    }
}
