//! Wire DTOs and the error envelope exposed to transport layers.
//!
//! The HTTP server binds these shapes verbatim; the core never depends on
//! any transport crate.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    AccountId, AllocationPolicy, LinkId, Lots, OrderId, OrderType, Price, RunId, Side, StrategyId,
};

/// Request body for placing a fan-out order against an execution group.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GroupOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub lots: Lots,
    pub lot_size: Lots,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub stop_loss: Option<Price>,
    #[serde(default)]
    pub strategy_id: Option<StrategyId>,
}

/// One allocation entry in a group-order response.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AllocationResult {
    pub account_id: AccountId,
    pub broker_id: LinkId,
    pub lots: Lots,
    pub quantity: i64,
    pub allocation_policy: AllocationPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_lots: Option<Lots>,
}

/// Response body for a group order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GroupOrderResponse {
    pub execution_run_id: RunId,
    pub allocation: Vec<AllocationResult>,
    pub orders: Vec<OrderId>,
}

/// Machine-readable error codes carried by the envelope.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RmsMaxLoss,
    RmsMaxLots,
    RmsMargin,
    RmsExposure,
    NoEligibleAccounts,
    BrokerSessionExpired,
    BrokerRejected,
    AdapterTimeout,
    AllocationInvalid,
    Unauthorized,
    Conflict,
    NotFound,
    Validation,
    Internal,
}

/// Inner body of the error envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// `{error: {code, message, details?}}` as serialised to clients.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                details: None,
            },
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.error.details = Some(details);
        self
    }
}
