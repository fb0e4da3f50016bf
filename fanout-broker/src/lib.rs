//! Broker-agnostic traits used by the rest of the workspace.

use std::any::Any;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use fanout_core::{OrderType, Price, Side, Symbol};
use fanout_vault::Secrets;

mod connection;
mod fleet;
mod registry;

pub use connection::{AdapterDeadlines, BrokerConnection};
pub use fleet::{Account, BrokerFleet, BrokerLink, LinkStatus};
pub use registry::{normalize_kind, AdapterFactory, AdapterRegistry};

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by broker adapters.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failure (network, 5xx). Retryable once per leg.
    #[error("transport error: {0}")]
    Transport(String),
    /// The adapter call exceeded its deadline.
    #[error("adapter call timed out")]
    Timeout,
    /// The session token is no longer valid; one silent re-auth is attempted.
    #[error("broker session expired")]
    SessionExpired,
    /// Authentication with the upstream failed.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The broker refused the order for a business reason. Never retried.
    #[error("broker rejected order: {0}")]
    Rejected(String),
    /// The request parameters are invalid for the target broker.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The adapter does not implement this capability.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A catch-all branch for invariant violations.
    #[error("unexpected error: {0}")]
    Internal(String),
}

/// Authenticated session handle issued by an adapter.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerSession {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
}

impl BrokerSession {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
            metadata: Value::Null,
        }
    }

    /// Whether the session is past its expiry timestamp.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Normalized order request handed to adapters.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderCommand {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: i64,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
    pub exchange: Option<String>,
    pub symbol_token: Option<String>,
    pub tag: Option<String>,
}

/// Upstream order state as reported at placement time.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStatus {
    Accepted,
    Filled,
    Pending,
}

/// Successful placement response. Rejections surface as [`BrokerError::Rejected`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Placement {
    pub broker_order_id: String,
    pub status: PlacementStatus,
    pub avg_fill_price: Option<Price>,
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Patch applied by `modify`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OrderPatch {
    pub quantity: Option<i64>,
    pub price: Option<Price>,
    pub order_type: Option<OrderType>,
}

/// Broker-side open position snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    pub quantity: i64,
    pub avg_price: Price,
    pub pnl: Price,
    pub product: Option<String>,
}

/// Broker-side holding (delivery) snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Holding {
    pub symbol: Symbol,
    pub quantity: i64,
    pub avg_price: Price,
    pub last_price: Option<Price>,
}

/// Funds snapshot reported by the broker.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarginSnapshot {
    pub available: Decimal,
    pub utilized: Decimal,
    pub currency: String,
}

/// Product-conversion request for brokers that support it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConversionRequest {
    pub symbol: Symbol,
    pub quantity: i64,
    pub from_product: String,
    pub to_product: String,
}

/// Capability contract every broker integration implements.
///
/// Adapters must be safe to invoke concurrently from multiple execution
/// runs; any upstream-mandated serialisation is the adapter's own concern.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Canonical broker kind (e.g. `paper_trading`).
    fn kind(&self) -> &str;

    /// Authenticate and return a session handle.
    async fn connect(&self, credentials: &Secrets) -> BrokerResult<BrokerSession>;

    /// Refresh an existing session. Defaults to a full reconnect being required.
    async fn refresh(&self, _session: &BrokerSession) -> BrokerResult<BrokerSession> {
        Err(BrokerError::SessionExpired)
    }

    /// Invalidate a session upstream. Best-effort by default.
    async fn logout(&self, _session: &BrokerSession) -> BrokerResult<()> {
        Ok(())
    }

    /// Place an order; business rejections come back as [`BrokerError::Rejected`].
    async fn place(&self, session: &BrokerSession, command: &OrderCommand)
        -> BrokerResult<Placement>;

    /// Amend an open order.
    async fn modify(
        &self,
        _session: &BrokerSession,
        _broker_order_id: &str,
        _patch: &OrderPatch,
    ) -> BrokerResult<Placement> {
        Err(BrokerError::Unsupported("order modification"))
    }

    /// Cancel an open order.
    async fn cancel(&self, session: &BrokerSession, broker_order_id: &str) -> BrokerResult<()>;

    /// Current open positions.
    async fn positions(&self, session: &BrokerSession) -> BrokerResult<Vec<BrokerPosition>>;

    /// Current holdings.
    async fn holdings(&self, _session: &BrokerSession) -> BrokerResult<Vec<Holding>> {
        Ok(Vec::new())
    }

    /// Funds snapshot.
    async fn margin(&self, session: &BrokerSession) -> BrokerResult<MarginSnapshot>;

    /// Convert a position between product types, where supported.
    async fn convert_position(
        &self,
        _session: &BrokerSession,
        _request: &ConversionRequest,
    ) -> BrokerResult<Value> {
        Err(BrokerError::Unsupported("position conversion"))
    }

    /// Last traded price used as the RMS reference price.
    async fn last_price(&self, session: &BrokerSession, symbol: &str) -> BrokerResult<Price>;

    /// Helper for downcasting to a concrete type in tests.
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn session_without_expiry_never_expires() {
        assert!(!BrokerSession::new("tok").is_expired());
    }

    #[test]
    fn session_expiry_is_checked_against_now() {
        let mut session = BrokerSession::new("tok");
        session.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(session.is_expired());
        session.expires_at = Some(Utc::now() + Duration::hours(1));
        assert!(!session.is_expired());
    }
}
