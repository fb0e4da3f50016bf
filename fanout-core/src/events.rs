//! Execution-run lifecycle records and their per-leg telemetry events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AccountId, GroupId, LatencySummary, OrderId, RunId, StrategyRunId, UserId};

/// Terminal and intermediate states of an execution run.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Partial,
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    /// Once terminal a run is immutable.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Outcome of a single dispatched (or skipped) leg.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Requested,
    Accepted,
    Rejected,
    Filled,
    Cancelled,
    CancelledBeforeSend,
    Error,
}

impl LegStatus {
    /// Whether the leg has reached a final state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Requested)
    }

    /// Whether the leg counts as a success when finalising a run.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Accepted | Self::Filled)
    }
}

/// One append-only telemetry record for a leg of an execution run.
///
/// Events are totally ordered per run by `seq`; each dispatched leg
/// produces exactly one terminal event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecutionEvent {
    pub run_id: RunId,
    pub seq: u64,
    pub account_id: Option<AccountId>,
    pub order_id: Option<OrderId>,
    pub status: LegStatus,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// One fan-out attempt: the intent snapshot plus aggregate outcome.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecutionRun {
    pub id: RunId,
    pub user_id: UserId,
    pub group_id: Option<GroupId>,
    pub strategy_run_id: Option<StrategyRunId>,
    pub status: RunStatus,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Snapshot of the intent and allocation that produced this run.
    pub payload: Value,
    pub latency: Option<LatencySummary>,
}
