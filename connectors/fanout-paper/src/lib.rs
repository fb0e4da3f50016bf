//! Deterministic in-process broker used for paper trading and tests.
//!
//! Every order is accepted: MARKET orders fill immediately at the intent
//! price (or the adapter's reference price), LIMIT orders are accepted as
//! pending. Order ids are sequential so test assertions stay stable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use fanout_broker::{
    AdapterFactory, BrokerAdapter, BrokerError, BrokerPosition, BrokerResult, BrokerSession,
    Holding, MarginSnapshot, OrderCommand, OrderPatch, Placement, PlacementStatus,
};
use fanout_core::{OrderType, Price, Side};
use fanout_vault::Secrets;

const PAPER_MARGIN: i64 = 1_000_000;

#[derive(Clone)]
struct PaperOrder {
    command: OrderCommand,
    status: PlacementStatus,
    cancelled: bool,
}

/// In-memory simulator state shared by every session of one adapter instance.
#[derive(Default)]
struct PaperBook {
    sessions: HashMap<String, String>,
    orders: HashMap<String, PaperOrder>,
    positions: HashMap<String, (i64, Price)>,
}

/// Paper-trading adapter; the reference implementation for the adapter
/// contract.
pub struct PaperBroker {
    book: Mutex<PaperBook>,
    order_counter: AtomicU64,
    last_prices: Mutex<HashMap<String, Price>>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            order_counter: AtomicU64::new(0),
            last_prices: Mutex::new(HashMap::new()),
        }
    }

    /// Pin a reference price used to fill market orders without a price.
    pub fn set_reference_price(&self, symbol: &str, price: Price) {
        self.last_prices.lock().insert(symbol.to_string(), price);
    }

    fn next_order_id(&self) -> String {
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("PAPER-ORD-{n:06}")
    }

    fn reference_price(&self, symbol: &str) -> Price {
        if let Some(price) = self.last_prices.lock().get(symbol) {
            return *price;
        }
        pseudo_price(symbol)
    }

    fn require_session(&self, session: &BrokerSession) -> BrokerResult<()> {
        if self.book.lock().sessions.contains_key(&session.token) {
            Ok(())
        } else {
            Err(BrokerError::SessionExpired)
        }
    }

    fn apply_fill(&self, command: &OrderCommand, price: Price) {
        let mut book = self.book.lock();
        let entry = book
            .positions
            .entry(command.symbol.clone())
            .or_insert((0, Decimal::ZERO));
        let signed = command.quantity * i64::from(command.side.as_i8());
        let new_qty = entry.0 + signed;
        if entry.0 == 0 || entry.0.signum() == signed.signum() {
            let prev_cost = entry.1 * Decimal::from(entry.0.abs());
            let add_cost = price * Decimal::from(command.quantity);
            let total = entry.0.abs() + command.quantity;
            entry.1 = if total == 0 {
                price
            } else {
                (prev_cost + add_cost) / Decimal::from(total)
            };
        } else if new_qty != 0 && new_qty.signum() != entry.0.signum() {
            entry.1 = price;
        }
        entry.0 = new_qty;
        if new_qty == 0 {
            entry.1 = Decimal::ZERO;
        }
    }
}

/// Deterministic pseudo price so demos and tests see stable fills.
fn pseudo_price(symbol: &str) -> Price {
    let mut acc: u32 = 0;
    for byte in symbol.bytes() {
        acc = acc.wrapping_mul(31).wrapping_add(u32::from(byte));
    }
    let base = acc % 10_000;
    Decimal::from(100) + Decimal::from(base) / Decimal::from(250)
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn kind(&self) -> &str {
        "paper_trading"
    }

    async fn connect(&self, credentials: &Secrets) -> BrokerResult<BrokerSession> {
        let client_code = credentials.get("client_code").unwrap_or("paper").to_string();
        let token = format!("PAPER-{}", Uuid::new_v4().simple());
        self.book
            .lock()
            .sessions
            .insert(token.clone(), client_code.clone());
        let mut session = BrokerSession::new(token);
        session.metadata = json!({ "client_code": client_code });
        Ok(session)
    }

    async fn logout(&self, session: &BrokerSession) -> BrokerResult<()> {
        self.book.lock().sessions.remove(&session.token);
        Ok(())
    }

    async fn place(
        &self,
        session: &BrokerSession,
        command: &OrderCommand,
    ) -> BrokerResult<Placement> {
        self.require_session(session)?;
        if command.quantity <= 0 {
            return Err(BrokerError::InvalidRequest(
                "order quantity must be positive".into(),
            ));
        }
        let order_id = self.next_order_id();
        let (status, fill_price) = match command.order_type {
            OrderType::Market => {
                let price = command
                    .price
                    .unwrap_or_else(|| self.reference_price(&command.symbol));
                self.apply_fill(command, price);
                (PlacementStatus::Filled, Some(price))
            }
            OrderType::Limit => (PlacementStatus::Accepted, None),
        };
        self.book.lock().orders.insert(
            order_id.clone(),
            PaperOrder {
                command: command.clone(),
                status,
                cancelled: false,
            },
        );
        info!(
            order_id = %order_id,
            symbol = %command.symbol,
            qty = command.quantity,
            side = ?command.side,
            "paper order recorded"
        );
        Ok(Placement {
            broker_order_id: order_id,
            status,
            avg_fill_price: fill_price,
            message: None,
            metadata: json!({
                "symbol": command.symbol,
                "qty": command.quantity,
                "order_type": command.order_type,
            }),
        })
    }

    async fn modify(
        &self,
        session: &BrokerSession,
        broker_order_id: &str,
        patch: &OrderPatch,
    ) -> BrokerResult<Placement> {
        self.require_session(session)?;
        let mut book = self.book.lock();
        let order = book
            .orders
            .get_mut(broker_order_id)
            .ok_or_else(|| BrokerError::InvalidRequest("unknown paper order".into()))?;
        if order.cancelled || order.status == PlacementStatus::Filled {
            return Err(BrokerError::Rejected("order is no longer open".into()));
        }
        if let Some(quantity) = patch.quantity {
            order.command.quantity = quantity;
        }
        if let Some(price) = patch.price {
            order.command.price = Some(price);
        }
        Ok(Placement {
            broker_order_id: broker_order_id.to_string(),
            status: order.status,
            avg_fill_price: None,
            message: Some("modified".into()),
            metadata: Value::Null,
        })
    }

    async fn cancel(&self, session: &BrokerSession, broker_order_id: &str) -> BrokerResult<()> {
        self.require_session(session)?;
        let mut book = self.book.lock();
        match book.orders.get_mut(broker_order_id) {
            Some(order) => {
                order.cancelled = true;
                Ok(())
            }
            None => Err(BrokerError::InvalidRequest("unknown paper order".into())),
        }
    }

    async fn positions(&self, session: &BrokerSession) -> BrokerResult<Vec<BrokerPosition>> {
        self.require_session(session)?;
        let book = self.book.lock();
        let mut positions: Vec<BrokerPosition> = book
            .positions
            .iter()
            .filter(|(_, (qty, _))| *qty != 0)
            .map(|(symbol, (qty, avg))| BrokerPosition {
                symbol: symbol.clone(),
                quantity: *qty,
                avg_price: *avg,
                pnl: Decimal::ZERO,
                product: Some("INTRADAY".into()),
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn holdings(&self, session: &BrokerSession) -> BrokerResult<Vec<Holding>> {
        self.require_session(session)?;
        Ok(Vec::new())
    }

    async fn margin(&self, session: &BrokerSession) -> BrokerResult<MarginSnapshot> {
        self.require_session(session)?;
        Ok(MarginSnapshot {
            available: Decimal::from(PAPER_MARGIN),
            utilized: Decimal::ZERO,
            currency: "INR".into(),
        })
    }

    async fn last_price(&self, session: &BrokerSession, symbol: &str) -> BrokerResult<Price> {
        self.require_session(session)?;
        Ok(self.reference_price(symbol))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Factory registered under `paper_trading` and its aliases.
#[derive(Default)]
pub struct PaperFactory;

impl AdapterFactory for PaperFactory {
    fn kind(&self) -> &'static str {
        "paper_trading"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["paper", "paper-trading", "simulator"]
    }

    fn build(&self, _options: &Value) -> Arc<dyn BrokerAdapter> {
        Arc::new(PaperBroker::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::Side;

    fn command(symbol: &str, side: Side, qty: i64, order_type: OrderType) -> OrderCommand {
        OrderCommand {
            symbol: symbol.into(),
            side,
            quantity: qty,
            order_type,
            price: Some(Decimal::from(100)),
            take_profit: None,
            stop_loss: None,
            exchange: None,
            symbol_token: None,
            tag: None,
        }
    }

    async fn session(broker: &PaperBroker) -> BrokerSession {
        broker
            .connect(&Secrets::new().with("client_code", "P001"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn market_orders_fill_immediately_with_sequential_ids() {
        let broker = PaperBroker::new();
        let session = session(&broker).await;

        let first = broker
            .place(&session, &command("NIFTY", Side::Buy, 50, OrderType::Market))
            .await
            .unwrap();
        let second = broker
            .place(&session, &command("NIFTY", Side::Buy, 50, OrderType::Market))
            .await
            .unwrap();

        assert_eq!(first.broker_order_id, "PAPER-ORD-000001");
        assert_eq!(second.broker_order_id, "PAPER-ORD-000002");
        assert_eq!(first.status, PlacementStatus::Filled);
        assert_eq!(first.avg_fill_price, Some(Decimal::from(100)));
    }

    #[tokio::test]
    async fn limit_orders_rest_as_accepted() {
        let broker = PaperBroker::new();
        let session = session(&broker).await;
        let placement = broker
            .place(&session, &command("NIFTY", Side::Buy, 50, OrderType::Limit))
            .await
            .unwrap();
        assert_eq!(placement.status, PlacementStatus::Accepted);
        assert!(placement.avg_fill_price.is_none());
    }

    #[tokio::test]
    async fn fills_accumulate_into_positions() {
        let broker = PaperBroker::new();
        let session = session(&broker).await;
        broker
            .place(&session, &command("NIFTY", Side::Buy, 100, OrderType::Market))
            .await
            .unwrap();
        broker
            .place(&session, &command("NIFTY", Side::Sell, 40, OrderType::Market))
            .await
            .unwrap();

        let positions = broker.positions(&session).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 60);
    }

    #[tokio::test]
    async fn market_fill_uses_reference_price_when_intent_has_none() {
        let broker = PaperBroker::new();
        broker.set_reference_price("BANKNIFTY", Decimal::from(45_000));
        let session = session(&broker).await;
        let mut cmd = command("BANKNIFTY", Side::Buy, 15, OrderType::Market);
        cmd.price = None;
        let placement = broker.place(&session, &cmd).await.unwrap();
        assert_eq!(placement.avg_fill_price, Some(Decimal::from(45_000)));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let broker = PaperBroker::new();
        let stale = BrokerSession::new("PAPER-unknown");
        let err = broker
            .place(&stale, &command("NIFTY", Side::Buy, 1, OrderType::Market))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SessionExpired));
    }

    #[test]
    fn pseudo_price_is_deterministic() {
        assert_eq!(pseudo_price("NIFTY"), pseudo_price("NIFTY"));
        assert_ne!(pseudo_price("NIFTY"), pseudo_price("BANKNIFTY"));
    }
}
