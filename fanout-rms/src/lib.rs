//! Risk management: per-user configuration, daily counters, the pre-trade
//! gate, and the in-trade enforcement sweep.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod audit;
mod engine;

pub use audit::{AuditEntry, AuditLog};
pub use engine::{DayCounters, LegCheck, Reservation, RmsEngine};

/// Result alias for gate decisions.
pub type RmsResult<T> = Result<T, RmsViolation>;

/// Per-user risk configuration. All limits are optional; an unset limit is
/// not enforced. `margin_buffer_pct` is a percentage (5 = 5 %).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RmsConfig {
    pub max_lots_per_order: Option<u32>,
    pub max_daily_lots: Option<u32>,
    pub max_daily_loss: Option<Decimal>,
    pub exposure_limit: Option<Decimal>,
    pub margin_buffer_pct: Option<Decimal>,
    pub profit_lock: Option<Decimal>,
    pub trailing_sl: Option<Decimal>,
    pub drawdown_limit: Option<Decimal>,
    #[serde(default)]
    pub auto_square_off_enabled: bool,
    pub auto_square_off_buffer_pct: Option<Decimal>,
    #[serde(default)]
    pub auto_hedge_enabled: bool,
    pub auto_hedge_ratio: Option<Decimal>,
    #[serde(default)]
    pub notify_email: bool,
    #[serde(default)]
    pub notify_telegram: bool,
}

/// A tripped pre-trade guardrail. Carried verbatim to the caller; never
/// retried.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum RmsViolation {
    #[error("order of {lots} lots exceeds per-order limit of {limit}")]
    MaxOrderLots { lots: u32, limit: u32 },
    #[error("daily lot limit would be exceeded: {used} used, {requested} requested, limit {limit}")]
    MaxDailyLots { used: u32, requested: u32, limit: u32 },
    #[error("daily loss threshold breached; new orders are blocked (pnl {pnl}, limit {limit})")]
    DailyLossTripped { pnl: Decimal, limit: Decimal },
    #[error("notional exposure limit reached: projected {projected}, limit {limit}")]
    ExposureLimit { projected: Decimal, limit: Decimal },
    #[error("margin buffer violated: required {required}, available {available}")]
    MarginBuffer { required: Decimal, available: Decimal },
}

impl RmsViolation {
    /// Stable rule name used in audit entries and error envelopes.
    #[must_use]
    pub fn rule(&self) -> &'static str {
        match self {
            Self::MaxOrderLots { .. } => "max_lots_per_order",
            Self::MaxDailyLots { .. } => "max_daily_lots",
            Self::DailyLossTripped { .. } => "max_daily_loss",
            Self::ExposureLimit { .. } => "exposure_limit",
            Self::MarginBuffer { .. } => "margin_buffer",
        }
    }
}

/// Command emitted by the enforcement sweep. The caller owns execution;
/// the engine only decides and audits.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EnforcementAction {
    /// Close all open positions via counter orders.
    SquareOff { rule: String, message: String },
    /// Raise the trailing stop by the configured delta.
    TightenTrailingStop { delta: Decimal },
    /// Hedge current exposure at the configured ratio.
    Hedge { ratio: Decimal, message: String },
}

/// Read model returned by `RmsEngine::status`.
#[derive(Clone, Debug, Serialize)]
pub struct RmsStatus {
    pub trading_day: chrono::NaiveDate,
    pub day_pnl: Decimal,
    pub lots_used: u32,
    pub lots_remaining: Option<u32>,
    pub max_daily_lots: Option<u32>,
    pub max_daily_loss: Option<Decimal>,
    pub loss_remaining: Option<Decimal>,
    pub notional_exposure: Decimal,
    pub exposure_limit: Option<Decimal>,
    pub alerts: Vec<String>,
    pub automations: Vec<String>,
}
